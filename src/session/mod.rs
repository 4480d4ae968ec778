//! Interactive access sessions

mod attach;
mod manager;

pub use attach::{pump, RawModeGuard, TerminalStreams};
pub use manager::{SessionManager, SessionSettings};
