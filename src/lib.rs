//! Goal-driven page automation: perceive the page as an image, ask a
//! decision engine what to do, and carry it out behind a safety gate.

pub mod brain;
pub mod config;
pub mod controller;
pub mod credentials;
pub mod dom;
pub mod error;
pub mod executor;
pub mod journal;
pub mod parser;
pub mod perception;
pub mod safety;
pub mod surface;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use brain::{Brain, EngineTransport, HttpTransport};
pub use config::AgentConfig;
pub use controller::RunController;
pub use error::{AgentError, PerceptionError};
pub use journal::Journal;
pub use surface::{ActiveSurface, PageSurface, Readiness};
pub use types::{Action, LogEntry, LogKind, ModelResponse, RunState, RunStatus, Snapshot, Viewport};
