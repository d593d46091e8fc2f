use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CallResult;
use crate::signal::IceCandidate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Answer, sdp: sdp.into() }
    }
}

/// Media session with one remote peer. Capture, codecs, NAT traversal and
/// encrypted transport all live behind this trait.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Creates and applies a local offer, returning its SDP.
    async fn create_offer(&mut self) -> CallResult<String>;

    /// Creates and applies a local answer to the current remote offer.
    async fn create_answer(&mut self) -> CallResult<String>;

    async fn set_remote_description(&mut self, description: SessionDescription) -> CallResult<()>;

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> CallResult<()>;

    /// Restarts ICE gathering and returns the renegotiation offer SDP.
    async fn restart_ice(&mut self) -> CallResult<String>;

    async fn close(&mut self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self, peer: Uuid) -> CallResult<Box<dyn PeerConnection>>;
}
