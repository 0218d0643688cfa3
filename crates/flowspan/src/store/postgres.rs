//! PostgreSQL checkpoint store.

use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::checkpoint::{Checkpoint, CheckpointStatus, FlowOutcome};
use crate::error::{Error, Result};
use crate::flow::FlowId;
use crate::session::DedupId;

use super::{outcome_of, CheckpointStore, CheckpointTx, FlowSummary};

/// PostgreSQL-backed [`CheckpointStore`] for production use.
///
/// # Database Schema
///
/// Requires tables in the `flowspan` schema (see `migrations/`):
///
/// | Table         | Purpose                                                |
/// |---------------|--------------------------------------------------------|
/// | `checkpoints` | One row per flow, replaced optimistically by version   |
/// | `dedup_facts` | Durable log of consumed inbound message identities     |
/// | `flow_results`| Outcomes retained for `client_id` retrieval            |
///
/// # Concurrency
///
/// A flow's checkpoint row is only written by its owning fiber, so plain
/// read-committed isolation suffices. The `num_commits` compare-and-swap in
/// the upsert rejects replayed transitions after a crash.
#[derive(Debug, Clone)]
pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    /// Create a store from a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the store's schema migrations.
    pub async fn migrate(pool: &PgPool) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(|e| Error::Store(e.to_string()))
    }
}

fn status_to_str(status: CheckpointStatus) -> &'static str {
    match status {
        CheckpointStatus::Runnable => "runnable",
        CheckpointStatus::Hospitalized => "hospitalized",
        CheckpointStatus::Paused => "paused",
        CheckpointStatus::Completed => "completed",
        CheckpointStatus::Failed => "failed",
        CheckpointStatus::Killed => "killed",
    }
}

fn status_from_str(s: &str) -> Result<CheckpointStatus> {
    Ok(match s {
        "runnable" => CheckpointStatus::Runnable,
        "hospitalized" => CheckpointStatus::Hospitalized,
        "paused" => CheckpointStatus::Paused,
        "completed" => CheckpointStatus::Completed,
        "failed" => CheckpointStatus::Failed,
        "killed" => CheckpointStatus::Killed,
        other => return Err(Error::Store(format!("unknown checkpoint status: {other}"))),
    })
}

fn summary_from_row(row: &PgRow) -> Result<FlowSummary> {
    Ok(FlowSummary {
        flow_id: FlowId::from(row.try_get::<uuid::Uuid, _>("flow_id")?),
        flow_class: row.try_get("flow_class")?,
        status: status_from_str(&row.try_get::<String, _>("status")?)?,
        num_commits: row.try_get::<i64, _>("num_commits")? as u64,
        started_at: row.try_get("started_at")?,
    })
}

impl CheckpointStore for PgCheckpointStore {
    type Tx = PgCheckpointTx;

    async fn begin(&self) -> Result<PgCheckpointTx> {
        Ok(PgCheckpointTx {
            tx: self.pool.begin().await?,
        })
    }

    async fn get(&self, id: FlowId) -> Result<Option<Checkpoint>> {
        let row = sqlx::query("SELECT blob FROM flowspan.checkpoints WHERE flow_id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| -> Result<Checkpoint> {
            let blob: serde_json::Value = row.try_get("blob")?;
            Ok(serde_json::from_value(blob)?)
        })
        .transpose()
    }

    async fn list(&self, status_filter: Option<CheckpointStatus>) -> Result<Vec<FlowSummary>> {
        let mut builder = sqlx::QueryBuilder::<Postgres>::new(
            "SELECT flow_id, flow_class, status, num_commits, started_at \
             FROM flowspan.checkpoints",
        );
        if let Some(status) = status_filter {
            builder.push(" WHERE status = ");
            builder.push_bind(status_to_str(status));
        }
        builder.push(" ORDER BY started_at");

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(summary_from_row).collect()
    }

    async fn update_status(&self, id: FlowId, status: CheckpointStatus) -> Result<()> {
        let result =
            sqlx::query("UPDATE flowspan.checkpoints SET status = $2 WHERE flow_id = $1")
                .bind(id.as_uuid())
                .bind(status_to_str(status))
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(Error::FlowNotFound(id));
        }
        Ok(())
    }

    async fn is_duplicate(&self, dedup_id: &DedupId) -> Result<bool> {
        let row =
            sqlx::query("SELECT EXISTS(SELECT 1 FROM flowspan.dedup_facts WHERE dedup_id = $1)")
                .bind(dedup_id.to_string())
                .fetch_one(&self.pool)
                .await?;
        Ok(row.try_get::<bool, _>(0)?)
    }

    async fn result_for_client(&self, client_id: &str) -> Result<Option<FlowOutcome>> {
        let row = sqlx::query("SELECT outcome FROM flowspan.flow_results WHERE client_id = $1")
            .bind(client_id)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = row {
            let outcome: serde_json::Value = row.try_get("outcome")?;
            return Ok(Some(serde_json::from_value(outcome)?));
        }

        // The checkpoint row itself is the result store while it survives.
        let row = sqlx::query("SELECT blob FROM flowspan.checkpoints WHERE client_id = $1")
            .bind(client_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| -> Result<Option<FlowOutcome>> {
            let blob: serde_json::Value = row.try_get("blob")?;
            let checkpoint: Checkpoint = serde_json::from_value(blob)?;
            Ok(outcome_of(&checkpoint))
        })
        .transpose()
        .map(Option::flatten)
    }
}

/// A transactional span over [`PgCheckpointStore`].
pub struct PgCheckpointTx {
    tx: Transaction<'static, Postgres>,
}

impl CheckpointTx for PgCheckpointTx {
    async fn upsert(&mut self, id: FlowId, checkpoint: &Checkpoint, _is_update: bool) -> Result<()> {
        let blob = serde_json::to_value(checkpoint)?;
        let attempted = checkpoint.checkpoint_state.num_commits;

        // Optimistic replace: the conflict arm only fires when the incoming
        // version is strictly newer.
        let result = sqlx::query(
            "INSERT INTO flowspan.checkpoints \
                 (flow_id, flow_class, client_id, status, num_commits, blob, started_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (flow_id) DO UPDATE \
             SET status = EXCLUDED.status, \
                 num_commits = EXCLUDED.num_commits, \
                 blob = EXCLUDED.blob \
             WHERE flowspan.checkpoints.num_commits < EXCLUDED.num_commits",
        )
        .bind(id.as_uuid())
        .bind(&checkpoint.invocation_context.flow_class)
        .bind(checkpoint.invocation_context.client_id.as_deref())
        .bind(status_to_str(checkpoint.status))
        .bind(attempted as i64)
        .bind(&blob)
        .bind(checkpoint.invocation_context.started_at)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            let row =
                sqlx::query("SELECT num_commits FROM flowspan.checkpoints WHERE flow_id = $1")
                    .bind(id.as_uuid())
                    .fetch_one(&mut *self.tx)
                    .await?;
            return Err(Error::StaleCheckpoint {
                flow_id: id,
                stored: row.try_get::<i64, _>(0)? as u64,
                attempted,
            });
        }
        Ok(())
    }

    async fn remove(&mut self, id: FlowId, may_have_persistent_results: bool) -> Result<()> {
        let row = sqlx::query("DELETE FROM flowspan.checkpoints WHERE flow_id = $1 RETURNING blob")
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await?;

        if may_have_persistent_results {
            if let Some(row) = row {
                let blob: serde_json::Value = row.try_get("blob")?;
                let checkpoint: Checkpoint = serde_json::from_value(blob)?;
                if let (Some(client_id), Some(outcome)) = (
                    checkpoint.invocation_context.client_id.clone(),
                    outcome_of(&checkpoint),
                ) {
                    sqlx::query(
                        "INSERT INTO flowspan.flow_results (client_id, outcome) \
                         VALUES ($1, $2) \
                         ON CONFLICT (client_id) DO UPDATE SET outcome = EXCLUDED.outcome",
                    )
                    .bind(client_id)
                    .bind(serde_json::to_value(&outcome)?)
                    .execute(&mut *self.tx)
                    .await?;
                }
            }
        }
        Ok(())
    }

    async fn persist_dedup_facts(&mut self, facts: Vec<DedupId>) -> Result<()> {
        for fact in facts {
            // A conflict means the message was already delivered once.
            sqlx::query(
                "INSERT INTO flowspan.dedup_facts (dedup_id) VALUES ($1) \
                 ON CONFLICT (dedup_id) DO NOTHING",
            )
            .bind(fact.to_string())
            .execute(&mut *self.tx)
            .await?;
        }
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
