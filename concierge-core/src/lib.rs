pub mod completion;
pub mod config;
pub mod db;
pub mod durable;
pub mod error;
pub mod ipc;
pub mod models;
pub mod scheduling;
pub mod timeparse;

pub use completion::{ChatCompletionClient, CompletionBackend, CompletionError, CompletionOutput};
pub use config::ConciergeConfig;
pub use durable::{ContextRecord, DurableError, DurableStore, InMemoryDurableStore, PgDurableStore};
pub use error::ConciergeError;
pub use ipc::{ClientEvent, ServerEvent};
pub use scheduling::{HttpSchedulingClient, SchedulingApi, SchedulingError};
