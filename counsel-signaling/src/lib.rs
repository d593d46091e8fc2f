//! Call signaling: the server-side mailbox relay and the per-identity call
//! session that drives a media peer connection through offer, answer and ICE
//! exchange.

pub mod error;
pub mod ice;
pub mod peer;
pub mod relay;
pub mod session;
pub mod signal;

pub use error::CallError;
pub use ice::{IceBuffer, IceDisposition};
pub use peer::{PeerConnection, PeerConnectionFactory, SdpKind, SessionDescription};
pub use relay::SignalRelay;
pub use session::{CallAgent, CallEvent, CallLog, CallSettings, CallState, EndReason};
pub use signal::{IceCandidate, Signal, SignalEnvelope};

/// Call log text written by the callee when a ringing call times out.
pub const MISSED_CALL_TEXT: &str = "Missed video call";

/// Call log text written by the caller when the callee answers `busy`.
pub const DECLINED_CALL_TEXT: &str = "Video call declined";
