//! TCP Forwarder
//!
//! Listens on one address and relays every accepted connection, byte for byte,
//! to a fixed forward target over a fresh outbound connection.

pub mod config;
pub mod listener;
pub mod proxy;

// Re-export commonly used types and functions
pub use config::{Args, Config, FileConfig, Protocol, load_config};
pub use listener::{Accept, bind, serve};
pub use proxy::{
    BUFFER_SIZE, Direction, RelayEnd, RelayStats, SessionStats, handle_connection,
    is_expected_close, relay,
};
