pub mod error;
pub mod routes;
pub mod server;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use server::run;
pub use state::AppState;

// Re-export commonly used types
pub use scribe_core::*;
