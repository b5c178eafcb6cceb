//! gRPC relay exposing registered sessions to remote callers

pub mod client;
pub mod messages;
pub mod server;
pub mod system;

pub use client::RelayClient;
pub use messages::SystemAction;
pub use server::{Connector, DirectConnector, Relay};
