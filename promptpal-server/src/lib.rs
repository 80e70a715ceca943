pub mod auth;
pub mod error;
pub mod http;

pub use error::ApiError;
pub use http::{build_router, AppState};
