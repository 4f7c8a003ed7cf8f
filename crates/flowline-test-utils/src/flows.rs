//! Sample flows used by the end-to-end tests.
//!
//! Initiating flows take their counterparty from the start arguments.
//! Responders are bound to protocols in [`sample_registry`].

use async_trait::async_trait;
use chrono::Duration;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;

use flowline_core::{FlowContext, FlowError, FlowLogic, FlowRegistry, MemberIdentity, Payload, SessionId};

#[derive(Debug, Clone, Deserialize)]
struct PeerArgs {
    peer: String,
    #[serde(default)]
    payload: serde_json::Value,
}

fn peer_args(args: &Payload) -> Result<PeerArgs, FlowError> {
    args.to()
}

fn initiating_session(ctx: &FlowContext) -> Result<SessionId, FlowError> {
    ctx.initiating_session()
        .cloned()
        .ok_or_else(|| FlowError::Failed("responder started without a session".to_string()))
}

fn single(session: &SessionId) -> BTreeSet<SessionId> {
    [session.clone()].into_iter().collect()
}

/// Sends its payload to the peer and returns the reply
pub struct PingFlow {
    peer: MemberIdentity,
    payload: serde_json::Value,
}

impl PingFlow {
    /// Build from `{"peer": ..., "payload": ...}`
    pub fn from_args(args: &Payload) -> Result<Self, FlowError> {
        let args = peer_args(args)?;
        Ok(Self {
            peer: MemberIdentity(args.peer),
            payload: args.payload,
        })
    }
}

#[async_trait]
impl FlowLogic for PingFlow {
    fn flow_type(&self) -> &str {
        "Ping"
    }

    fn is_initiating(&self) -> bool {
        true
    }

    async fn call(&self, ctx: &mut FlowContext) -> Result<Payload, FlowError> {
        let session = ctx.initiate_session(self.peer.clone()).await?;
        ctx.send_and_receive(&session, Payload::json(self.payload.clone())).await
    }
}

/// Echoes the first payload it receives
pub struct PongResponder;

#[async_trait]
impl FlowLogic for PongResponder {
    fn flow_type(&self) -> &str {
        "Pong"
    }

    async fn call(&self, ctx: &mut FlowContext) -> Result<Payload, FlowError> {
        let session = initiating_session(ctx)?;
        let request = ctx.receive(&session).await?;
        ctx.send(&session, request.clone()).await?;
        Ok(request)
    }
}

/// Waits for the responder to confirm, then pings it and reports who answered
pub struct GreeterFlow {
    peer: MemberIdentity,
}

#[async_trait]
impl FlowLogic for GreeterFlow {
    fn flow_type(&self) -> &str {
        "Greeter"
    }

    fn is_initiating(&self) -> bool {
        true
    }

    async fn call(&self, ctx: &mut FlowContext) -> Result<Payload, FlowError> {
        let session = ctx.initiate_session(self.peer.clone()).await?;
        ctx.wait_for_confirmations(single(&session)).await?;

        let info = ctx.flow_info(single(&session)).await?;
        let counterparty = info
            .get(&session)
            .map(|i| i.counterparty.0.clone())
            .unwrap_or_default();

        let reply = ctx.send_and_receive(&session, Payload::json(json!("hello"))).await?;
        Ok(Payload::json(json!({
            "counterparty": counterparty,
            "reply": reply.to_json()?,
        })))
    }
}

/// Sends two payloads and finishes without waiting for an answer
pub struct SendTwiceFlow {
    peer: MemberIdentity,
}

#[async_trait]
impl FlowLogic for SendTwiceFlow {
    fn flow_type(&self) -> &str {
        "SendTwice"
    }

    fn is_initiating(&self) -> bool {
        true
    }

    async fn call(&self, ctx: &mut FlowContext) -> Result<Payload, FlowError> {
        let session = ctx.initiate_session(self.peer.clone()).await?;
        ctx.send(&session, Payload::json(json!("first"))).await?;
        ctx.send(&session, Payload::json(json!("second"))).await?;
        Ok(Payload::json(json!(2)))
    }
}

/// Receives two payloads in order
pub struct ReceiveTwiceResponder;

#[async_trait]
impl FlowLogic for ReceiveTwiceResponder {
    fn flow_type(&self) -> &str {
        "ReceiveTwice"
    }

    async fn call(&self, ctx: &mut FlowContext) -> Result<Payload, FlowError> {
        let session = initiating_session(ctx)?;
        let first = ctx.receive(&session).await?;
        let second = ctx.receive(&session).await?;
        if first.to_json()? != json!("first") || second.to_json()? != json!("second") {
            return Err(FlowError::Failed("payloads arrived out of order".to_string()));
        }
        Ok(Payload::json(json!([first.to_json()?, second.to_json()?])))
    }
}

/// Top of a three-level subflow chain whose innermost level fails
pub struct OuterFlow {
    peer: MemberIdentity,
}

#[async_trait]
impl FlowLogic for OuterFlow {
    fn flow_type(&self) -> &str {
        "Outer"
    }

    fn is_initiating(&self) -> bool {
        true
    }

    async fn call(&self, ctx: &mut FlowContext) -> Result<Payload, FlowError> {
        let middle = MiddleFlow {
            peer: self.peer.clone(),
        };
        ctx.call_subflow(&middle).await
    }
}

/// Opens a session, greets the peer and delegates to [`InnerFlow`]
pub struct MiddleFlow {
    peer: MemberIdentity,
}

#[async_trait]
impl FlowLogic for MiddleFlow {
    fn flow_type(&self) -> &str {
        "Middle"
    }

    async fn call(&self, ctx: &mut FlowContext) -> Result<Payload, FlowError> {
        let session = ctx.initiate_session(self.peer.clone()).await?;
        ctx.send(&session, Payload::json(json!("hello"))).await?;
        ctx.call_subflow(&InnerFlow).await
    }
}

/// Checkpoints once and fails
pub struct InnerFlow;

#[async_trait]
impl FlowLogic for InnerFlow {
    fn flow_type(&self) -> &str {
        "Inner"
    }

    async fn call(&self, ctx: &mut FlowContext) -> Result<Payload, FlowError> {
        ctx.checkpoint().await?;
        Err(FlowError::Failed("inner failed".to_string()))
    }
}

/// Keeps receiving until the session fails
pub struct ListenerResponder;

#[async_trait]
impl FlowLogic for ListenerResponder {
    fn flow_type(&self) -> &str {
        "Listener"
    }

    async fn call(&self, ctx: &mut FlowContext) -> Result<Payload, FlowError> {
        let session = initiating_session(ctx)?;
        loop {
            ctx.receive(&session).await?;
        }
    }
}

/// Catches the failure of [`InnerFlow`] and carries on
pub struct RecoveringFlow;

#[async_trait]
impl FlowLogic for RecoveringFlow {
    fn flow_type(&self) -> &str {
        "Recovering"
    }

    async fn call(&self, ctx: &mut FlowContext) -> Result<Payload, FlowError> {
        match ctx.call_subflow(&InnerFlow).await {
            Ok(_) => Err(FlowError::Failed("inner flow was expected to fail".to_string())),
            Err(err) => {
                ctx.checkpoint().await?;
                Ok(Payload::json(json!({ "recovered": err.to_string() })))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct CounterArgs {
    steps: u32,
}

/// Checkpoints `steps` times and returns the count
pub struct CounterFlow {
    steps: u32,
}

#[async_trait]
impl FlowLogic for CounterFlow {
    fn flow_type(&self) -> &str {
        "Counter"
    }

    async fn call(&self, ctx: &mut FlowContext) -> Result<Payload, FlowError> {
        for _ in 0..self.steps {
            ctx.checkpoint().await?;
        }
        Ok(Payload::json(json!(self.steps)))
    }
}

#[derive(Debug, Deserialize)]
struct NapArgs {
    seconds: i64,
}

/// Sleeps and returns "rested"
pub struct NapFlow {
    seconds: i64,
}

#[async_trait]
impl FlowLogic for NapFlow {
    fn flow_type(&self) -> &str {
        "Nap"
    }

    async fn call(&self, ctx: &mut FlowContext) -> Result<Payload, FlowError> {
        ctx.sleep(Duration::seconds(self.seconds)).await?;
        Ok(Payload::json(json!("rested")))
    }
}

/// Hands its start arguments to the "double" operation
pub struct AsyncDoubleFlow;

#[async_trait]
impl FlowLogic for AsyncDoubleFlow {
    fn flow_type(&self) -> &str {
        "AsyncDouble"
    }

    async fn call(&self, ctx: &mut FlowContext) -> Result<Payload, FlowError> {
        let input = ctx.start_args().clone();
        ctx.execute_async("double", input).await
    }
}

fn peer_of(args: &Payload) -> Result<MemberIdentity, FlowError> {
    Ok(MemberIdentity(peer_args(args)?.peer))
}

/// Registry with every sample flow and its responder bindings
pub fn sample_registry() -> FlowRegistry {
    FlowRegistry::new()
        .register("Ping", |args: &Payload| {
            Ok(Arc::new(PingFlow::from_args(args)?) as Arc<dyn FlowLogic>)
        })
        .register("Pong", |_: &Payload| Ok(Arc::new(PongResponder) as Arc<dyn FlowLogic>))
        .register("Greeter", |args: &Payload| {
            Ok(Arc::new(GreeterFlow { peer: peer_of(args)? }) as Arc<dyn FlowLogic>)
        })
        .register("SendTwice", |args: &Payload| {
            Ok(Arc::new(SendTwiceFlow { peer: peer_of(args)? }) as Arc<dyn FlowLogic>)
        })
        .register("ReceiveTwice", |_: &Payload| {
            Ok(Arc::new(ReceiveTwiceResponder) as Arc<dyn FlowLogic>)
        })
        .register("Outer", |args: &Payload| {
            Ok(Arc::new(OuterFlow { peer: peer_of(args)? }) as Arc<dyn FlowLogic>)
        })
        .register("Listener", |_: &Payload| Ok(Arc::new(ListenerResponder) as Arc<dyn FlowLogic>))
        .register("Recovering", |_: &Payload| Ok(Arc::new(RecoveringFlow) as Arc<dyn FlowLogic>))
        .register("Counter", |args: &Payload| {
            let args: CounterArgs = args.to()?;
            Ok(Arc::new(CounterFlow { steps: args.steps }) as Arc<dyn FlowLogic>)
        })
        .register("Nap", |args: &Payload| {
            let args: NapArgs = args.to()?;
            Ok(Arc::new(NapFlow { seconds: args.seconds }) as Arc<dyn FlowLogic>)
        })
        .register("AsyncDouble", |_: &Payload| Ok(Arc::new(AsyncDoubleFlow) as Arc<dyn FlowLogic>))
        .register_responder("Ping", "Pong")
        .register_responder("Greeter", "Pong")
        .register_responder("SendTwice", "ReceiveTwice")
        .register_responder("Outer", "Listener")
}
