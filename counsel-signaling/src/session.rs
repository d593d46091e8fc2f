use async_trait::async_trait;
use counsel_core::config::CallConfig;
use futures::stream::{BoxStream, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep_until, Duration, Instant};
use tracing;
use uuid::Uuid;

use crate::error::{CallError, CallResult};
use crate::ice::{IceBuffer, IceDisposition};
use crate::peer::{PeerConnection, PeerConnectionFactory, SessionDescription};
use crate::relay::SignalRelay;
use crate::signal::{IceCandidate, Signal, SignalEnvelope};
use crate::{DECLINED_CALL_TEXT, MISSED_CALL_TEXT};

const COMMAND_BUFFER: usize = 32;
const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Local hang up.
    HungUp,
    /// The peer sent `end-call` after the call was established or while we rang.
    RemoteHungUp,
    /// The callee answered `busy`.
    Declined,
    /// We rejected an incoming call.
    Rejected,
    /// The ring timeout elapsed, on either side.
    Missed,
    /// The caller withdrew the offer before we answered.
    Retracted,
    Failed,
}

/// One identity's call session. At most one peer is ringing or connected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CallState {
    Idle,
    RingingOut { peer: Uuid },
    RingingIn { peer: Uuid },
    Connected { peer: Uuid },
    Ended { peer: Uuid, reason: EndReason },
}

impl CallState {
    /// Peer of a ringing or connected call.
    pub fn active_peer(&self) -> Option<Uuid> {
        match self {
            CallState::RingingOut { peer } | CallState::RingingIn { peer } | CallState::Connected { peer } => {
                Some(*peer)
            }
            CallState::Idle | CallState::Ended { .. } => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active_peer().is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CallEvent {
    /// Show the incoming call prompt.
    IncomingCall { from: Uuid },
    /// Hide the incoming call prompt.
    PromptDismissed { from: Uuid },
    Connected { peer: Uuid },
    Ended { peer: Uuid, reason: EndReason },
}

/// Appends `call_log` messages to the conversation between two identities.
#[async_trait]
pub trait CallLog: Send + Sync {
    async fn log_call(&self, author: Uuid, peer: Uuid, text: &str) -> counsel_core::Result<()>;
}

#[derive(Debug, Clone)]
pub struct CallSettings {
    pub ring_timeout: Duration,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&CallConfig> for CallSettings {
    fn from(config: &CallConfig) -> Self {
        Self {
            ring_timeout: Duration::from_secs(config.ring_timeout_secs),
        }
    }
}

type Reply = oneshot::Sender<CallResult<()>>;

enum Command {
    Dial { peer: Uuid, reply: Reply },
    Accept { reply: Reply },
    Reject { reply: Reply },
    HangUp { reply: Reply },
    LocalCandidate { candidate: IceCandidate, reply: Reply },
    RestartIce { reply: Reply },
}

/// Handle to a running call session task.
///
/// The task owns the state machine; this handle sends it commands and
/// observes it. The task stops once every handle is dropped.
#[derive(Clone)]
pub struct CallAgent {
    user_id: Uuid,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<CallState>,
    events: broadcast::Sender<CallEvent>,
}

impl CallAgent {
    /// Subscribes to the signal mailbox of `user_id` and starts the session task.
    pub async fn spawn(
        user_id: Uuid,
        relay: SignalRelay,
        peers: Arc<dyn PeerConnectionFactory>,
        call_log: Arc<dyn CallLog>,
        settings: CallSettings,
    ) -> CallResult<Self> {
        let inbox = relay.inbox(user_id).await?;
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (state_tx, state_rx) = watch::channel(CallState::Idle);
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

        let session = Session {
            user_id,
            relay,
            peers,
            call_log,
            settings,
            state: state_tx,
            events: event_tx.clone(),
            connection: None,
            remote_offer: None,
            ice: IceBuffer::new(),
            ring_deadline: None,
        };
        tokio::spawn(session.run(command_rx, inbox));

        tracing::debug!(user_id = %user_id, "Call agent started");
        Ok(Self {
            user_id,
            commands: command_tx,
            state: state_rx,
            events: event_tx,
        })
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn state(&self) -> CallState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<CallState> {
        self.state.clone()
    }

    /// Events published from now on.
    pub fn events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub async fn dial(&self, peer: Uuid) -> CallResult<()> {
        self.request(|reply| Command::Dial { peer, reply }).await
    }

    pub async fn accept(&self) -> CallResult<()> {
        self.request(|reply| Command::Accept { reply }).await
    }

    pub async fn reject(&self) -> CallResult<()> {
        self.request(|reply| Command::Reject { reply }).await
    }

    pub async fn hang_up(&self) -> CallResult<()> {
        self.request(|reply| Command::HangUp { reply }).await
    }

    /// Forwards a locally gathered ICE candidate to the peer.
    pub async fn send_local_candidate(&self, candidate: IceCandidate) -> CallResult<()> {
        self.request(|reply| Command::LocalCandidate { candidate, reply }).await
    }

    /// Manual recovery after ICE connectivity failure.
    pub async fn restart_ice(&self) -> CallResult<()> {
        self.request(|reply| Command::RestartIce { reply }).await
    }

    async fn request(&self, command: impl FnOnce(Reply) -> Command) -> CallResult<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| CallError::AgentStopped)?;
        response.await.map_err(|_| CallError::AgentStopped)?
    }
}

struct Session {
    user_id: Uuid,
    relay: SignalRelay,
    peers: Arc<dyn PeerConnectionFactory>,
    call_log: Arc<dyn CallLog>,
    settings: CallSettings,
    state: watch::Sender<CallState>,
    events: broadcast::Sender<CallEvent>,
    connection: Option<Box<dyn PeerConnection>>,
    /// Offer of the ringing incoming call, applied on accept.
    remote_offer: Option<String>,
    ice: IceBuffer,
    ring_deadline: Option<Instant>,
}

async fn ring_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Session {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut inbox: BoxStream<'static, SignalEnvelope>) {
        loop {
            let deadline = self.ring_deadline;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                envelope = inbox.next() => match envelope {
                    Some(envelope) => self.handle_signal(envelope).await,
                    None => {
                        tracing::warn!(user_id = %self.user_id, "Signal mailbox closed, stopping call agent");
                        break;
                    }
                },
                _ = ring_timer(deadline) => self.ring_timeout().await,
            }
        }

        if let Some(peer) = self.current().active_peer() {
            self.send(peer, Signal::EndCall).await;
            self.finish(peer, EndReason::HungUp).await;
        }
        tracing::debug!(user_id = %self.user_id, "Call agent stopped");
    }

    fn current(&self) -> CallState {
        self.state.borrow().clone()
    }

    fn set_state(&self, state: CallState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: CallEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Fire and forget; failures are only logged.
    async fn send(&self, to: Uuid, signal: Signal) {
        let kind = signal.kind();
        if let Err(e) = self.relay.send(self.user_id, to, signal).await {
            tracing::error!(user_id = %self.user_id, peer = %to, kind, "Failed to send signal: {}", e);
        }
    }

    fn connection(&mut self) -> CallResult<&mut Box<dyn PeerConnection>> {
        self.connection
            .as_mut()
            .ok_or_else(|| CallError::InvalidState("no peer connection".to_string()))
    }

    async fn finish(&mut self, peer: Uuid, reason: EndReason) {
        self.ring_deadline = None;
        self.remote_offer = None;
        self.ice = IceBuffer::new();
        if let Some(mut connection) = self.connection.take() {
            connection.close().await;
        }
        self.set_state(CallState::Ended { peer, reason });
        self.emit(CallEvent::Ended { peer, reason });
        tracing::info!(user_id = %self.user_id, peer = %peer, ?reason, "Call ended");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Dial { peer, reply } => {
                let _ = reply.send(self.dial(peer).await);
            }
            Command::Accept { reply } => {
                let _ = reply.send(self.accept().await);
            }
            Command::Reject { reply } => {
                let _ = reply.send(self.reject().await);
            }
            Command::HangUp { reply } => {
                let _ = reply.send(self.hang_up().await);
            }
            Command::LocalCandidate { candidate, reply } => {
                let _ = reply.send(self.send_local_candidate(candidate).await);
            }
            Command::RestartIce { reply } => {
                let _ = reply.send(self.restart_ice().await);
            }
        }
    }

    async fn dial(&mut self, peer: Uuid) -> CallResult<()> {
        if peer == self.user_id {
            return Err(CallError::InvalidState("cannot call yourself".to_string()));
        }
        if let Some(active) = self.current().active_peer() {
            return Err(CallError::InvalidState(format!("already in a call with {}", active)));
        }

        let mut connection = self.peers.create(peer).await?;
        let sdp = match connection.create_offer().await {
            Ok(sdp) => sdp,
            Err(e) => {
                connection.close().await;
                return Err(e);
            }
        };

        self.ice = IceBuffer::new();
        self.connection = Some(connection);
        self.set_state(CallState::RingingOut { peer });

        if let Err(e) = self.relay.send(self.user_id, peer, Signal::Offer { sdp }).await {
            self.finish(peer, EndReason::Failed).await;
            return Err(e.into());
        }
        tracing::info!(user_id = %self.user_id, peer = %peer, "Calling");
        Ok(())
    }

    async fn accept(&mut self) -> CallResult<()> {
        let CallState::RingingIn { peer } = self.current() else {
            return Err(CallError::InvalidState("no incoming call to accept".to_string()));
        };
        self.ring_deadline = None;
        self.emit(CallEvent::PromptDismissed { from: peer });

        match self.answer_incoming(peer).await {
            Ok(()) => {
                self.set_state(CallState::Connected { peer });
                self.emit(CallEvent::Connected { peer });
                tracing::info!(user_id = %self.user_id, peer = %peer, "Call accepted");
                Ok(())
            }
            Err(e) => {
                tracing::error!(user_id = %self.user_id, peer = %peer, "Failed to answer call: {}", e);
                self.send(peer, Signal::EndCall).await;
                self.finish(peer, EndReason::Failed).await;
                Err(e)
            }
        }
    }

    /// Applies the buffered offer, flushes queued candidates, then answers.
    async fn answer_incoming(&mut self, peer: Uuid) -> CallResult<()> {
        let offer = self
            .remote_offer
            .take()
            .ok_or_else(|| CallError::InvalidState("incoming call has no offer".to_string()))?;

        self.connection = Some(self.peers.create(peer).await?);
        self.connection()?
            .set_remote_description(SessionDescription::offer(offer))
            .await?;

        let queued = self.ice.flush();
        let connection = self.connection()?;
        for candidate in queued {
            connection.add_ice_candidate(candidate).await?;
        }

        let sdp = connection.create_answer().await?;
        self.relay.send(self.user_id, peer, Signal::Answer { sdp }).await?;
        Ok(())
    }

    async fn reject(&mut self) -> CallResult<()> {
        let CallState::RingingIn { peer } = self.current() else {
            return Err(CallError::InvalidState("no incoming call to reject".to_string()));
        };
        self.ring_deadline = None;
        self.emit(CallEvent::PromptDismissed { from: peer });
        self.send(peer, Signal::Busy).await;
        self.finish(peer, EndReason::Rejected).await;
        Ok(())
    }

    async fn hang_up(&mut self) -> CallResult<()> {
        match self.current() {
            CallState::RingingIn { .. } => self.reject().await,
            CallState::RingingOut { peer } | CallState::Connected { peer } => {
                self.send(peer, Signal::EndCall).await;
                self.finish(peer, EndReason::HungUp).await;
                Ok(())
            }
            CallState::Idle | CallState::Ended { .. } => {
                Err(CallError::InvalidState("no call to hang up".to_string()))
            }
        }
    }

    async fn send_local_candidate(&mut self, candidate: IceCandidate) -> CallResult<()> {
        match self.current() {
            CallState::RingingOut { peer } | CallState::Connected { peer } => {
                self.relay
                    .send(self.user_id, peer, Signal::IceCandidate { candidate })
                    .await?;
                Ok(())
            }
            _ => Err(CallError::InvalidState("no outgoing media session".to_string())),
        }
    }

    async fn restart_ice(&mut self) -> CallResult<()> {
        let CallState::Connected { peer } = self.current() else {
            return Err(CallError::InvalidState("ICE restart needs a connected call".to_string()));
        };
        let sdp = self.connection()?.restart_ice().await?;
        self.relay.send(self.user_id, peer, Signal::Offer { sdp }).await?;
        tracing::info!(user_id = %self.user_id, peer = %peer, "ICE restart offered");
        Ok(())
    }

    async fn handle_signal(&mut self, envelope: SignalEnvelope) {
        let SignalEnvelope { from, signal, .. } = envelope;
        let state = self.current();

        match signal {
            Signal::Offer { sdp } => self.on_offer(from, sdp, state).await,
            Signal::Answer { sdp } => self.on_answer(from, sdp, state).await,
            Signal::IceCandidate { candidate } => self.on_remote_candidate(from, candidate, state).await,
            Signal::EndCall => match state {
                CallState::RingingIn { peer } if peer == from => {
                    self.emit(CallEvent::PromptDismissed { from });
                    self.finish(from, EndReason::Retracted).await;
                }
                CallState::RingingOut { peer } | CallState::Connected { peer } if peer == from => {
                    self.finish(from, EndReason::RemoteHungUp).await;
                }
                _ => self.ignore(from, "end-call"),
            },
            Signal::Busy => match state {
                CallState::RingingOut { peer } if peer == from => {
                    self.finish(from, EndReason::Declined).await;
                    if let Err(e) = self.call_log.log_call(self.user_id, from, DECLINED_CALL_TEXT).await {
                        tracing::error!(user_id = %self.user_id, peer = %from, "Failed to log declined call: {}", e);
                    }
                }
                _ => self.ignore(from, "busy"),
            },
            Signal::MissedCall => match state {
                CallState::RingingOut { peer } if peer == from => {
                    self.finish(from, EndReason::Missed).await;
                }
                _ => self.ignore(from, "missed-call"),
            },
        }
    }

    fn ignore(&self, from: Uuid, kind: &str) {
        tracing::debug!(user_id = %self.user_id, from = %from, kind, "Ignoring signal from unrelated peer");
    }

    async fn on_offer(&mut self, from: Uuid, sdp: String, state: CallState) {
        match state {
            CallState::Idle | CallState::Ended { .. } => {
                self.ice = IceBuffer::new();
                self.remote_offer = Some(sdp);
                self.ring_deadline = Some(Instant::now() + self.settings.ring_timeout);
                self.set_state(CallState::RingingIn { peer: from });
                self.emit(CallEvent::IncomingCall { from });
                tracing::info!(user_id = %self.user_id, from = %from, "Incoming call");
            }
            CallState::RingingIn { peer } if peer == from => {
                self.remote_offer = Some(sdp);
            }
            CallState::Connected { peer } if peer == from => {
                if let Err(e) = self.renegotiate(from, sdp).await {
                    tracing::error!(user_id = %self.user_id, peer = %from, "Renegotiation failed: {}", e);
                }
            }
            _ => {
                tracing::info!(user_id = %self.user_id, from = %from, "Busy, auto-rejecting offer");
                self.send(from, Signal::Busy).await;
            }
        }
    }

    async fn renegotiate(&mut self, peer: Uuid, sdp: String) -> CallResult<()> {
        let connection = self.connection()?;
        connection
            .set_remote_description(SessionDescription::offer(sdp))
            .await?;
        let answer = connection.create_answer().await?;
        self.relay.send(self.user_id, peer, Signal::Answer { sdp: answer }).await?;
        Ok(())
    }

    async fn on_answer(&mut self, from: Uuid, sdp: String, state: CallState) {
        match state {
            CallState::RingingOut { peer } if peer == from => match self.apply_answer(sdp).await {
                Ok(()) => {
                    self.set_state(CallState::Connected { peer });
                    self.emit(CallEvent::Connected { peer });
                    tracing::info!(user_id = %self.user_id, peer = %peer, "Call connected");
                }
                Err(e) => {
                    tracing::error!(user_id = %self.user_id, peer = %peer, "Failed to apply answer: {}", e);
                    self.send(peer, Signal::EndCall).await;
                    self.finish(peer, EndReason::Failed).await;
                }
            },
            CallState::Connected { peer } if peer == from => {
                let applied = match self.connection() {
                    Ok(connection) => connection.set_remote_description(SessionDescription::answer(sdp)).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = applied {
                    tracing::error!(user_id = %self.user_id, peer = %peer, "Failed to apply renegotiation answer: {}", e);
                }
            }
            _ => self.ignore(from, "answer"),
        }
    }

    async fn apply_answer(&mut self, sdp: String) -> CallResult<()> {
        self.connection()?
            .set_remote_description(SessionDescription::answer(sdp))
            .await?;
        let queued = self.ice.flush();
        let connection = self.connection()?;
        for candidate in queued {
            connection.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    async fn on_remote_candidate(&mut self, from: Uuid, candidate: IceCandidate, state: CallState) {
        if state.active_peer() != Some(from) {
            self.ignore(from, "ice-candidate");
            return;
        }
        match self.ice.accept(candidate) {
            IceDisposition::Queued => {
                tracing::debug!(user_id = %self.user_id, from = %from, queued = self.ice.queued(), "ICE candidate queued");
            }
            IceDisposition::Apply(candidate) => {
                let applied = match self.connection() {
                    Ok(connection) => connection.add_ice_candidate(candidate).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = applied {
                    tracing::warn!(user_id = %self.user_id, from = %from, "Failed to add ICE candidate: {}", e);
                }
            }
        }
    }

    async fn ring_timeout(&mut self) {
        self.ring_deadline = None;
        let CallState::RingingIn { peer } = self.current() else {
            return;
        };

        tracing::info!(user_id = %self.user_id, peer = %peer, "Incoming call not answered in time");
        self.send(peer, Signal::MissedCall).await;
        self.emit(CallEvent::PromptDismissed { from: peer });
        if let Err(e) = self.call_log.log_call(self.user_id, peer, MISSED_CALL_TEXT).await {
            tracing::error!(user_id = %self.user_id, peer = %peer, "Failed to log missed call: {}", e);
        }
        self.finish(peer, EndReason::Missed).await;
    }
}
