//! `so100-cockpit` – the observer web server.
//!
//! Boots a lightweight HTTP + WebSocket server (default port `8000`) that:
//!
//! 1. **Serves** the embedded cockpit page at every non-WebSocket HTTP path.
//! 2. **Registers** one observer per WebSocket connection with the
//!    [`Session`], forwarding every broadcast event (`frame`, `status`,
//!    `reasoning`, `chat`, `error`) as a JSON text frame.
//! 3. **Routes** inbound text frames (`chat` and `command` messages) to
//!    [`Session::handle_message`], and detaches the observer when the
//!    socket closes.
//!
//! [`Session`]: so100_runtime::Session
//! [`Session::handle_message`]: so100_runtime::Session::handle_message

pub mod server;

pub use server::{CockpitError, CockpitServer, DEFAULT_PORT};
