//! Realtime voice service connection
//!
//! A [`SessionRelay`] trades configuration for a short-lived [`SessionTicket`],
//! a [`Connector`] turns the ticket into an open channel, and
//! [`RealtimeConnection`] pumps capture frames out and server events in.

mod connection;
mod protocol;
mod relay;
mod retry;
mod websocket;

pub use connection::{
    ConnectionEvent, Connector, LinkStatus, RealtimeChannel, RealtimeConnection, SessionConfig,
};
pub use protocol::{ClientMessage, Role, ServerEvent, classify_error};
pub use relay::{HttpSessionRelay, SessionRelay, SessionRequest, SessionTicket};
pub use retry::{ReconnectBackoff, RetryPolicy, is_recoverable_status};
pub use websocket::WebSocketConnector;
