//! Flow programs used by the integration scenarios.

use std::time::Duration;

use flowspan::{
    Flow, FlowException, FlowIo, PartyName, ResumeValue, SessionId, StepError, StepOutcome,
    SuspendReason,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::OffsetDateTime;

/// Initiates a session from `args.peer` to `args.responder`, sends the
/// payload as part of initiation, and finishes with the first reply.
///
/// Session errors are rethrown, so a failing peer errors this flow too.
pub struct RequestReplyFlow;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RequestReplyState {
    pub session: Option<SessionId>,
}

impl Flow for RequestReplyFlow {
    type State = RequestReplyState;

    const CLASS: &'static str = "request-reply";

    fn step(
        state: &mut Self::State,
        input: ResumeValue,
        io: &mut FlowIo,
    ) -> Result<StepOutcome, StepError> {
        match input {
            ResumeValue::Start { args, .. } => {
                let peer = args["peer"]
                    .as_str()
                    .ok_or_else(|| FlowException::new("missing peer argument"))?;
                let responder = args["responder"].as_str().unwrap_or("echo");
                let session = io.initiate(PartyName::new(peer), responder, args["payload"].clone());
                state.session = Some(session);
                Ok(StepOutcome::Suspend(SuspendReason::ReceiveFrom(vec![
                    session,
                ])))
            }
            ResumeValue::Messages(mut messages) => {
                let (_, reply) = messages.remove(0);
                Ok(StepOutcome::Finish(reply))
            }
            ResumeValue::SessionError { exception, .. } => Err(exception.into()),
            ResumeValue::SessionEnded { .. } => {
                Err(FlowException::new("peer ended the session before replying").into())
            }
            other => Err(FlowException::new(format!("unexpected resume: {other:?}")).into()),
        }
    }
}

/// Replies to the initiation payload with `"<payload>:echo"` and finishes.
pub struct EchoFlow;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EchoState;

impl Flow for EchoFlow {
    type State = EchoState;

    const CLASS: &'static str = "echo";

    fn step(
        _state: &mut Self::State,
        input: ResumeValue,
        io: &mut FlowIo,
    ) -> Result<StepOutcome, StepError> {
        match input {
            ResumeValue::Start {
                args,
                initiated_session,
            } => {
                let session = initiated_session
                    .ok_or_else(|| FlowException::new("echo must be peer-initiated"))?;
                let text = args.as_str().unwrap_or("?").to_owned();
                io.send(session, json!(format!("{text}:echo")));
                Ok(StepOutcome::Finish(Value::Null))
            }
            other => Err(FlowException::new(format!("unexpected resume: {other:?}")).into()),
        }
    }
}

/// Raises an uncaught exception as soon as it starts.
pub struct RefusingFlow;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RefusingState;

impl Flow for RefusingFlow {
    type State = RefusingState;

    const CLASS: &'static str = "refusing";

    fn step(
        _state: &mut Self::State,
        _input: ResumeValue,
        _io: &mut FlowIo,
    ) -> Result<StepOutcome, StepError> {
        Err(FlowException::new("nope").into())
    }
}

/// Sleeps briefly, then finishes.
pub struct NapFlow;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct NapState;

impl Flow for NapFlow {
    type State = NapState;

    const CLASS: &'static str = "nap";

    fn step(
        _state: &mut Self::State,
        input: ResumeValue,
        _io: &mut FlowIo,
    ) -> Result<StepOutcome, StepError> {
        match input {
            ResumeValue::Start { .. } => Ok(StepOutcome::Suspend(SuspendReason::Sleep {
                until: OffsetDateTime::now_utc() + Duration::from_millis(30),
            })),
            ResumeValue::SleepFinished => Ok(StepOutcome::Finish(json!("rested"))),
            other => Err(FlowException::new(format!("unexpected resume: {other:?}")).into()),
        }
    }
}

/// Hands its arguments to the async-op runner and finishes with the result.
pub struct LookupFlow;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LookupState;

impl Flow for LookupFlow {
    type State = LookupState;

    const CLASS: &'static str = "lookup";

    fn step(
        _state: &mut Self::State,
        input: ResumeValue,
        _io: &mut FlowIo,
    ) -> Result<StepOutcome, StepError> {
        match input {
            ResumeValue::Start { args, .. } => {
                Ok(StepOutcome::Suspend(SuspendReason::AwaitAsyncOp {
                    dedup_id: "lookup-1".into(),
                    operation: args,
                }))
            }
            ResumeValue::AsyncOpResult(result) => Ok(StepOutcome::Finish(result)),
            other => Err(FlowException::new(format!("unexpected resume: {other:?}")).into()),
        }
    }
}

/// Like [`LookupFlow`] but with a short overall timeout: a slow operation
/// triggers retries from the last committed checkpoint until the result
/// arrives.
pub struct TimedLookupFlow;

impl Flow for TimedLookupFlow {
    type State = LookupState;

    const CLASS: &'static str = "timed-lookup";

    fn step(
        _state: &mut Self::State,
        input: ResumeValue,
        _io: &mut FlowIo,
    ) -> Result<StepOutcome, StepError> {
        match input {
            ResumeValue::Start { args, .. } => {
                Ok(StepOutcome::Suspend(SuspendReason::AwaitAsyncOp {
                    dedup_id: "timed-lookup-1".into(),
                    operation: args,
                }))
            }
            ResumeValue::AsyncOpResult(result) => Ok(StepOutcome::Finish(result)),
            other => Err(FlowException::new(format!("unexpected resume: {other:?}")).into()),
        }
    }

    fn timeout() -> Option<Duration> {
        Some(Duration::from_millis(80))
    }
}

/// Demands hospitalisation as soon as it starts.
pub struct StuckFlow;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StuckState;

impl Flow for StuckFlow {
    type State = StuckState;

    const CLASS: &'static str = "stuck";

    fn step(
        _state: &mut Self::State,
        _input: ResumeValue,
        _io: &mut FlowIo,
    ) -> Result<StepOutcome, StepError> {
        Err(StepError::Hospitalize("cannot make progress".into()))
    }
}
