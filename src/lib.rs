pub mod config;
pub mod connection;
pub mod error;
pub mod framing;
pub mod registry;
pub mod relay;
pub mod scan;
pub mod transport;

pub use config::{
    ConnectConfig, InterfaceType, NetworkConfig, RelayTarget, SerialConfig, TimeoutPolicy,
};
pub use connection::{Connection, DeviceClass, InitSequence, StringDatagram};
pub use error::{Error, Result};
pub use registry::{RegisterPolicy, Session, SessionRegistry};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
