//! Flow state machine.
//!
//! Flow logic is an async function over a [`FlowContext`]. The engine polls
//! it exactly once per event with a no-op waker: every context operation
//! either answers immediately (from the journal, or live from buffered
//! events) or parks the flow by never completing. After the poll the future
//! is dropped; the next event replays the logic against the journal and
//! picks up at the parked request.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::task::{Context, Poll};
use tracing::{debug, trace};
use uuid::Uuid;

use super::continuation::{Continuation, JournalEntry};
use crate::domain::checkpoint::{FlowState, InvocationContext};
use crate::domain::identity::{FlowId, MemberIdentity, SessionId};
use crate::domain::io_request::{FlowInfo, IoRequest, IoRequestKind, IoResult};
use crate::domain::session::SessionState;
use crate::error::{CoreError, FlowError};
use crate::types::Payload;

/// Business logic of a flow
#[async_trait]
pub trait FlowLogic: Send + Sync {
    /// Registered flow type name
    fn flow_type(&self) -> &str;

    /// Whether this flow may open sessions under its own protocol
    fn is_initiating(&self) -> bool {
        false
    }

    /// Run the flow. Must be deterministic given the results the context returns.
    async fn call(&self, ctx: &mut FlowContext) -> Result<Payload, FlowError>;
}

/// Where a fiber run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FiberOutcome {
    /// Parked on a request
    Suspended {
        /// Request the flow is waiting on
        request: IoRequest,
        /// Journal position of the request
        resume_index: usize,
        /// Whether the flow reached this request during this run
        fresh: bool,
    },
    /// Flow returned
    Completed(Payload),
    /// Flow raised an error
    Failed(FlowError),
}

/// State and journal after a fiber run
#[derive(Debug)]
pub struct FiberRun {
    /// Flow state after the run
    pub state: FlowState,
    /// Journal after the run
    pub journal: Continuation,
    /// How the run ended
    pub outcome: FiberOutcome,
}

#[derive(Debug)]
struct Parked {
    request: IoRequest,
    resume_index: usize,
    fresh: bool,
}

/// Handle flow logic uses to talk to the engine
pub struct FlowContext {
    flow_id: FlowId,
    now: DateTime<Utc>,
    state: FlowState,
    journal: Continuation,
    cursor: usize,
    injected: Option<FlowError>,
    parked: Option<Parked>,
    fault: Option<CoreError>,
}

impl FlowContext {
    fn new(
        flow_id: FlowId,
        state: FlowState,
        journal: Continuation,
        now: DateTime<Utc>,
        injected: Option<FlowError>,
    ) -> Self {
        Self {
            flow_id,
            now,
            state,
            journal,
            cursor: 0,
            injected,
            parked: None,
            fault: None,
        }
    }

    /// Id of this flow run
    pub fn flow_id(&self) -> &FlowId {
        &self.flow_id
    }

    /// Member the flow runs as
    pub fn owner(&self) -> &MemberIdentity {
        &self.state.owner
    }

    /// Arguments the top-level flow was started with
    pub fn start_args(&self) -> &Payload {
        &self.state.start_args
    }

    /// How the flow was started
    pub fn invocation_context(&self) -> &InvocationContext {
        &self.state.invocation_context
    }

    /// Session that started this flow, for responders
    pub fn initiating_session(&self) -> Option<&SessionId> {
        self.state.initiating_session.as_ref()
    }

    /// Whether the flow is re-executing journaled steps
    pub fn is_replaying(&self) -> bool {
        self.cursor < self.journal.len()
    }

    /// Single suspension point.
    ///
    /// Returns as soon as the request is satisfied. Requests with outbound
    /// effects, or with `may_skip_checkpoint == false`, always park first.
    pub async fn suspend(&mut self, request: IoRequest, may_skip_checkpoint: bool) -> Result<IoResult, FlowError> {
        match self.step(request, may_skip_checkpoint) {
            Some(outcome) => outcome,
            None => std::future::pending().await,
        }
    }

    /// Open a session with a counterparty. Requires an initiating flow on the stack.
    pub async fn initiate_session(&mut self, counterparty: MemberIdentity) -> Result<SessionId, FlowError> {
        match self.open_session(counterparty) {
            Some(outcome) => outcome,
            None => std::future::pending().await,
        }
    }

    /// Persist a checkpoint and continue
    pub async fn checkpoint(&mut self) -> Result<(), FlowError> {
        self.suspend(IoRequest::ForceCheckpoint, false).await.map(|_| ())
    }

    /// Send a payload on a session
    pub async fn send(&mut self, session_id: &SessionId, payload: Payload) -> Result<(), FlowError> {
        let mut payloads = BTreeMap::new();
        payloads.insert(session_id.clone(), payload);
        self.send_all(payloads).await
    }

    /// Send one payload per session
    pub async fn send_all(&mut self, payloads: BTreeMap<SessionId, Payload>) -> Result<(), FlowError> {
        self.suspend(IoRequest::Send { payloads }, true).await.map(|_| ())
    }

    /// Receive the next payload on a session
    pub async fn receive(&mut self, session_id: &SessionId) -> Result<Payload, FlowError> {
        let sessions: BTreeSet<SessionId> = [session_id.clone()].into_iter().collect();
        let mut received = self.receive_all(sessions).await?;
        take_payload(&mut received, session_id)
    }

    /// Receive the next payload on every session
    pub async fn receive_all(&mut self, sessions: BTreeSet<SessionId>) -> Result<BTreeMap<SessionId, Payload>, FlowError> {
        match self.suspend(IoRequest::Receive { sessions }, true).await? {
            IoResult::Received(received) => Ok(received),
            other => Err(unexpected_result(IoRequestKind::Receive, &other)),
        }
    }

    /// Send a payload and wait for the reply on the same session
    pub async fn send_and_receive(&mut self, session_id: &SessionId, payload: Payload) -> Result<Payload, FlowError> {
        let mut payloads = BTreeMap::new();
        payloads.insert(session_id.clone(), payload);
        match self.suspend(IoRequest::SendAndReceive { payloads }, true).await? {
            IoResult::Received(mut received) => take_payload(&mut received, session_id),
            other => Err(unexpected_result(IoRequestKind::SendAndReceive, &other)),
        }
    }

    /// Close sessions. The counterparties receive a close frame.
    pub async fn close_sessions(&mut self, sessions: BTreeSet<SessionId>) -> Result<(), FlowError> {
        self.suspend(IoRequest::CloseSessions { sessions }, true).await.map(|_| ())
    }

    /// Park for at least `duration`
    pub async fn sleep(&mut self, duration: Duration) -> Result<(), FlowError> {
        let wake_at = self.now + duration;
        self.suspend(IoRequest::Sleep { wake_at }, true).await.map(|_| ())
    }

    /// Describe sessions
    pub async fn flow_info(&mut self, sessions: BTreeSet<SessionId>) -> Result<BTreeMap<SessionId, FlowInfo>, FlowError> {
        match self.suspend(IoRequest::GetFlowInfo { sessions }, true).await? {
            IoResult::FlowInfo(infos) => Ok(infos),
            other => Err(unexpected_result(IoRequestKind::GetFlowInfo, &other)),
        }
    }

    /// Hand work to an external executor and resume with its result
    pub async fn execute_async(&mut self, operation: &str, input: Payload) -> Result<Payload, FlowError> {
        let request = IoRequest::ExecuteAsyncOperation {
            operation_id: Uuid::new_v4().to_string(),
            operation: operation.to_string(),
            input,
        };
        match self.suspend(request, true).await? {
            IoResult::AsyncResult(payload) => Ok(payload),
            other => Err(unexpected_result(IoRequestKind::ExecuteAsyncOperation, &other)),
        }
    }

    /// Wait until the counterparties have confirmed the sessions
    pub async fn wait_for_confirmations(&mut self, sessions: BTreeSet<SessionId>) -> Result<(), FlowError> {
        self.suspend(IoRequest::WaitForSessionConfirmations { sessions }, true)
            .await
            .map(|_| ())
    }

    /// Run a subflow in its own stack frame.
    ///
    /// The frame is pushed and checkpointed before the subflow starts, and
    /// popped whether it returns or fails.
    pub async fn call_subflow(&mut self, flow: &dyn FlowLogic) -> Result<Payload, FlowError> {
        if !self.enter_frame(flow.flow_type(), flow.is_initiating()) {
            return std::future::pending().await;
        }

        let result = match self.checkpoint().await {
            Ok(()) => flow.call(self).await,
            Err(err) => Err(err),
        };

        if !self.exit_frame(flow.flow_type()) {
            return std::future::pending().await;
        }
        result
    }

    fn halted(&self) -> bool {
        self.parked.is_some() || self.fault.is_some()
    }

    fn diverged(&mut self, message: String) {
        debug!(flow_id = %self.flow_id, "Replay diverged: {}", message);
        self.fault = Some(CoreError::NonDeterministicReplay(message));
    }

    /// Journal entry at the cursor while replaying, advancing past it
    fn replay_next(&mut self) -> Option<JournalEntry> {
        let entry = self.journal.get(self.cursor).cloned();
        if entry.is_some() {
            self.cursor += 1;
        }
        entry
    }

    /// A non-suspend operation at the frontier is only legal if the flow is not parked
    fn check_live(&mut self, operation: &str) -> bool {
        if self.state.suspended_on.is_some() {
            self.diverged(format!(
                "{} at journal position {} where the flow previously parked",
                operation, self.cursor
            ));
            return false;
        }
        true
    }

    fn record(&mut self, kind: IoRequestKind, outcome: Result<IoResult, FlowError>) -> Result<IoResult, FlowError> {
        self.journal.push(JournalEntry::Suspended {
            request: kind,
            outcome: outcome.clone(),
        });
        self.cursor += 1;
        outcome
    }

    fn step(&mut self, request: IoRequest, may_skip_checkpoint: bool) -> Option<Result<IoResult, FlowError>> {
        if self.halted() {
            return None;
        }
        let kind = request.kind();

        if self.is_replaying() {
            return match self.replay_next() {
                Some(JournalEntry::Suspended { request: recorded, outcome }) if recorded == kind => {
                    trace!(flow_id = %self.flow_id, ?kind, "Replayed suspension");
                    Some(outcome)
                }
                Some(entry) => {
                    self.diverged(format!("expected {}, flow asked to suspend on {:?}", entry.describe(), kind));
                    None
                }
                None => None,
            };
        }

        if let Some(suspended_on) = self.state.suspended_on.clone() {
            if suspended_on.resume_index != self.cursor || suspended_on.request.kind() != kind {
                self.diverged(format!(
                    "flow parked on {:?} at position {}, now suspends on {:?} at position {}",
                    suspended_on.request.kind(),
                    suspended_on.resume_index,
                    kind,
                    self.cursor
                ));
                return None;
            }

            let outcome = match self.injected.take() {
                Some(err) => Err(err),
                None => match suspended_on.request.resolve(&self.state, self.now) {
                    Some(resolution) => resolution.apply(&mut self.state),
                    None => {
                        self.parked = Some(Parked {
                            request: suspended_on.request,
                            resume_index: self.cursor,
                            fresh: false,
                        });
                        return None;
                    }
                },
            };

            debug!(flow_id = %self.flow_id, ?kind, "Resumed from parked request");
            self.state.suspended_on = None;
            return Some(self.record(kind, outcome));
        }

        if let Err(err) = request.validate(&self.state) {
            return Some(self.record(kind, Err(err)));
        }

        if may_skip_checkpoint && !request.has_outbound_effects(&self.state) {
            if let Some(resolution) = request.resolve(&self.state, self.now) {
                let outcome = resolution.apply(&mut self.state);
                return Some(self.record(kind, outcome));
            }
        }

        self.parked = Some(Parked {
            request,
            resume_index: self.cursor,
            fresh: true,
        });
        None
    }

    fn open_session(&mut self, counterparty: MemberIdentity) -> Option<Result<SessionId, FlowError>> {
        if self.halted() {
            return None;
        }

        if self.is_replaying() {
            return match self.replay_next() {
                Some(JournalEntry::SessionOpened { outcome }) => Some(outcome),
                Some(entry) => {
                    self.diverged(format!("expected {}, flow opened a session", entry.describe()));
                    None
                }
                None => None,
            };
        }

        if !self.check_live("open session") {
            return None;
        }

        let outcome = match self.state.flow_stack.nearest_initiating() {
            Some(frame) => {
                let session_id = SessionId::generate();
                let session = SessionState::initiated(session_id.clone(), counterparty, frame.flow_type.clone());
                self.state.sessions.insert(session_id.clone(), session);
                self.state.flow_stack.add_session(session_id.clone());
                Ok(session_id)
            }
            None => {
                let flow_type = self
                    .state
                    .flow_stack
                    .peek()
                    .map(|frame| frame.flow_type.clone())
                    .unwrap_or_else(|| self.state.flow_type.clone());
                Err(FlowError::NotInitiating(flow_type))
            }
        };

        self.journal.push(JournalEntry::SessionOpened {
            outcome: outcome.clone(),
        });
        self.cursor += 1;
        Some(outcome)
    }

    fn enter_frame(&mut self, flow_type: &str, is_initiating: bool) -> bool {
        if self.halted() {
            return false;
        }

        if self.is_replaying() {
            return match self.replay_next() {
                Some(JournalEntry::FrameEntered { flow_type: recorded }) if recorded == flow_type => true,
                Some(entry) => {
                    self.diverged(format!("expected {}, flow entered {}", entry.describe(), flow_type));
                    false
                }
                None => false,
            };
        }

        if !self.check_live("enter frame") {
            return false;
        }

        self.state.flow_stack.push(flow_type, is_initiating);
        self.journal.push(JournalEntry::FrameEntered {
            flow_type: flow_type.to_string(),
        });
        self.cursor += 1;
        true
    }

    fn exit_frame(&mut self, flow_type: &str) -> bool {
        if self.halted() {
            return false;
        }

        if self.is_replaying() {
            return match self.replay_next() {
                Some(JournalEntry::FrameExited { flow_type: recorded }) if recorded == flow_type => true,
                Some(entry) => {
                    self.diverged(format!("expected {}, flow exited {}", entry.describe(), flow_type));
                    false
                }
                None => false,
            };
        }

        if !self.check_live("exit frame") {
            return false;
        }

        match self.state.flow_stack.peek() {
            Some(top) if top.flow_type == flow_type => {
                self.state.flow_stack.pop();
            }
            other => {
                let top = other.map(|f| f.flow_type.clone()).unwrap_or_default();
                self.fault = Some(CoreError::FlowExecutionError(format!(
                    "Cannot exit frame {} with {} on top of the stack",
                    flow_type, top
                )));
                return false;
            }
        }

        self.journal.push(JournalEntry::FrameExited {
            flow_type: flow_type.to_string(),
        });
        self.cursor += 1;
        true
    }
}

fn take_payload(received: &mut BTreeMap<SessionId, Payload>, session_id: &SessionId) -> Result<Payload, FlowError> {
    received
        .remove(session_id)
        .ok_or_else(|| FlowError::UnknownSession(session_id.0.clone()))
}

fn unexpected_result(kind: IoRequestKind, result: &IoResult) -> FlowError {
    FlowError::Failed(format!("{:?} resumed with unexpected result {:?}", kind, result))
}

async fn run_top_level(flow: &dyn FlowLogic, ctx: &mut FlowContext) -> Result<Payload, FlowError> {
    if !ctx.enter_frame(flow.flow_type(), flow.is_initiating()) {
        return std::future::pending().await;
    }
    let result = flow.call(ctx).await;
    if !ctx.exit_frame(flow.flow_type()) {
        return std::future::pending().await;
    }
    result
}

fn poll_once<F: Future>(future: F) -> Poll<F::Output> {
    let mut future = std::pin::pin!(future);
    let mut cx = Context::from_waker(futures::task::noop_waker_ref());
    future.as_mut().poll(&mut cx)
}

/// Run flow logic against its journal until it completes, fails or parks.
///
/// `injected` resumes the parked request with an error instead of matching
/// it against buffered events. A panic in flow logic is a fatal error.
pub fn run_fiber(
    flow: &dyn FlowLogic,
    flow_id: FlowId,
    state: FlowState,
    journal: Continuation,
    now: DateTime<Utc>,
    injected: Option<FlowError>,
) -> Result<FiberRun, CoreError> {
    let mut ctx = FlowContext::new(flow_id, state, journal, now, injected);
    let poll = match panic::catch_unwind(AssertUnwindSafe(|| poll_once(run_top_level(flow, &mut ctx)))) {
        Ok(poll) => poll,
        Err(panic) => return Err(CoreError::from_panic(&format!("Flow {}", flow.flow_type()), panic)),
    };

    if let Some(fault) = ctx.fault.take() {
        return Err(fault);
    }

    let outcome = match (poll, ctx.parked.take()) {
        (Poll::Ready(Ok(result)), _) => FiberOutcome::Completed(result),
        (Poll::Ready(Err(err)), _) => FiberOutcome::Failed(err),
        (Poll::Pending, Some(parked)) => FiberOutcome::Suspended {
            request: parked.request,
            resume_index: parked.resume_index,
            fresh: parked.fresh,
        },
        (Poll::Pending, None) => {
            return Err(CoreError::FlowExecutionError(format!(
                "Flow {} awaited a future the engine does not drive",
                flow.flow_type()
            )))
        }
    };

    Ok(FiberRun {
        state: ctx.state,
        journal: ctx.journal,
        outcome,
    })
}
