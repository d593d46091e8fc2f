pub mod chat;
pub mod connections;

pub use chat::{Attachment, AttachmentKind, ChatService, ChatSummary};
pub use connections::{ConnectionService, IncomingRequest, SendOutcome};
