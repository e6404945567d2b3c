//! Signaling relay client (SignalR JSON hub protocol over WebSocket)

pub mod binding;
pub mod hub;
pub mod protocol;
pub mod reconnect;

pub use binding::bind;
pub use hub::{HubConnection, HubOptions};
pub use reconnect::{ConnectRetry, ReconnectPolicy};
