#![doc = include_str!("../README.md")]
#![warn(rustdoc::broken_intra_doc_links)]
pub mod backend;
pub mod config;
pub mod correlation;
pub mod error;
pub mod forwarding;
pub mod gateway;
pub mod messages;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod responder;
pub mod session;
pub mod watchdog;

pub use backend::{make_backend, HttpSystemOfRecord, JournalSystemOfRecord, NullSystemOfRecord, SystemOfRecord};
pub use config::{AsyncRuntime, BackendConfig, GatewayConfig, WatchdogConfig};
pub use correlation::CallOutcome;
pub use error::{OcppgError, Result};
pub use forwarding::{Direction, ForwardRecord, ForwardingConfig, ForwardingStats};
pub use gateway::{Gateway, GatewayEvent, GatewayHandle};
pub use messages::Action;
pub use protocol::{ErrorCode, Message};
pub use queue::CommandTicket;
pub use session::{DisconnectReason, SessionSnapshot, SessionState};
