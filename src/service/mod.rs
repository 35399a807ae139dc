pub use app_error::{TransportError, TransportResult};
pub use client::{Client, ClientHandle};
pub use config::{NetworkConfig, TransportConfig};
pub use listener::{ClientListener, ServerListener};
pub use server::{Server, ServerHandle};
pub use shutdown::Shutdown;
pub use timer::TimerHandle;
pub use tracing_config::{setup_file_tracing, setup_local_tracing};

mod app_error;
mod client;
mod config;
mod listener;
mod server;
mod shutdown;
mod timer;
mod tracing_config;
