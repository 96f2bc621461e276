pub mod auth;
pub mod billing;
pub mod cache;
pub mod config;
pub mod deferred;
pub mod error;
pub mod logging;
pub mod models;
pub mod providers;
pub mod proxy;
pub mod rate_limit;
pub mod router;
pub mod secrets;
pub mod server;
pub mod store;
pub mod tokens;
pub mod translate;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use proxy::Gateway;
pub use server::{build_router, AppState};
