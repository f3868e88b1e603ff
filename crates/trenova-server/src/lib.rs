pub mod config;
pub mod handlers;
pub mod lifecycle;
pub mod middleware;
pub mod observability;
pub mod server;
pub mod websocket;

pub use config::{AppConfig, ConfigError, LoggingConfig, ServerConfig, WebSocketConfig};
pub use lifecycle::{Hook, Lifecycle};
pub use observability::{LogHandle, init_logging};
pub use server::{AppState, ServerBuilder, TrenovaServer, build_app};
pub use websocket::Hub;
