pub mod service;

pub use counsel_core::types::{LawyerProfileUpdate, ProfileUpdate};
pub use service::{ProfileService, Registration};
