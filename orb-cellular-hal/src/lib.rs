//! Hardware abstraction for a single cellular modem.
//!
//! [`CellularHal`] owns the modem through a [`transport::Transport`] and
//! serializes every state change on one task. Callers submit requests through
//! the handle and learn about outcomes through the handlers in [`callbacks`].

pub mod callbacks;
pub mod config;
pub mod daemon;
pub mod device;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod profile;
pub mod registration;
pub mod session;
pub mod telemetry;
pub mod transport;
pub mod uicc;

mod utils;

pub use config::Config;
pub use error::{HalError, Result};
pub use orchestrator::{CellularHal, Snapshot};
