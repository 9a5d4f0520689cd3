pub use app_error::{AppError, AppResult};
pub use client::Client;
pub use config::{ClientConfig, FramewireConfig, ServerConfig};
pub use handler::{ClientHandler, ServerHandler};
pub use server::{Server, ServerWriter};
pub use tracing_config::{setup_local_tracing, setup_tracing};

mod app_error;
mod client;
mod config;
mod handler;
mod server;
mod tracing_config;
