//! Node harness and polling helpers for driving in-process scenarios.

use std::future::Future;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use flowspan::hospital::{Admission, FlowHospital, HospitalCommand};
use flowspan::{FlowNode, InMemoryCheckpointStore};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Install a test tracing subscriber once per process.
pub fn init_test_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "flowspan=debug".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A node running in the background, stoppable from the test body.
pub struct RunningNode {
    pub node: Arc<FlowNode<InMemoryCheckpointStore>>,
    pub store: InMemoryCheckpointStore,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl RunningNode {
    /// Spawn the node's pump loop in the background.
    pub fn spawn(node: Arc<FlowNode<InMemoryCheckpointStore>>, store: InMemoryCheckpointStore) -> Self {
        let (shutdown, signal) = oneshot::channel::<()>();
        let runner = Arc::clone(&node);
        let task = tokio::spawn(async move {
            if let Err(e) = runner
                .run(async {
                    let _ = signal.await;
                })
                .await
            {
                panic!("node stopped with error: {e}");
            }
        });
        Self {
            node,
            store,
            shutdown,
            task,
        }
    }

    /// Stop the node and wait for it to drain.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

/// Hospital that records admissions and answers with a fixed command.
#[derive(Default)]
pub struct RecordingHospital {
    pub admissions: Mutex<Vec<Admission>>,
    pub standing_order: Option<HospitalCommand>,
}

impl RecordingHospital {
    pub fn observing() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_standing_order(command: HospitalCommand) -> Arc<Self> {
        Arc::new(Self {
            admissions: Mutex::new(Vec::new()),
            standing_order: Some(command),
        })
    }

    pub fn admission_count(&self) -> usize {
        self.admissions.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl FlowHospital for RecordingHospital {
    async fn admit(&self, admission: Admission) -> Option<HospitalCommand> {
        self.admissions.lock().unwrap().push(admission);
        self.standing_order
    }
}
