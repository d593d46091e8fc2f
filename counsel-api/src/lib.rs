pub mod auth;
pub mod error;
pub mod handlers;
pub mod server;
pub mod state;
pub mod websocket;

pub use auth::{generate_token, verify_token, AuthenticatedUser, Claims};
pub use error::ApiError;
pub use server::{router, run};
pub use state::AppState;
