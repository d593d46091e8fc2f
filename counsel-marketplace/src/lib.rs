pub mod service;

pub use service::{MarketplaceService, NewProposal, NewRequest};
