pub mod billing;
pub mod service;

pub use service::{CrmService, NewCase, NewDocument};
