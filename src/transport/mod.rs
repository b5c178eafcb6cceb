//! Byte-level transports to instruments

use async_trait::async_trait;

mod relay;
mod serial;
mod socket;
mod usbtmc;
mod vxi11;

#[cfg(test)]
pub(crate) mod mock;

pub use relay::RelayTransport;
pub use serial::{SerialTransport, list_serial_ports};
pub use socket::SocketTransport;
pub use usbtmc::{UsbtmcTransport, list_usbtmc_devices};
pub use vxi11::{Vxi11Transport, discover_vxi11, portmap::PORTMAP_PORT};

use crate::{
    config::{ConnectConfig, InterfaceType, TimeoutPolicy},
    error::Result,
};

/// Maximum amount requested from a backend in a single read
pub const READ_CHUNK: usize = 20480;

/// Raw byte pipe to one instrument. Framing and deadlines are applied by
/// [`crate::Connection`]; a backend only moves bytes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Acquire the underlying resource (port, socket, device, link)
    async fn open(&mut self, timeouts: &TimeoutPolicy) -> Result<()>;

    /// Release the underlying resource. Closing a closed transport is a no-op.
    async fn close(&mut self) -> Result<()>;

    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Single backend-native read of at most `max_len` bytes. An empty result
    /// means the peer signalled end of stream.
    async fn read(&mut self, max_len: usize) -> Result<Vec<u8>>;

    /// Short description for logs
    fn describe(&self) -> String;
}

/// Build the backend a config resolves to. The backend is chosen once here
/// and never inspected again.
pub fn from_config(config: &ConnectConfig) -> Result<Box<dyn Transport>> {
    let transport: Box<dyn Transport> = match config.interface_type()? {
        InterfaceType::Serial => Box::new(SerialTransport::new(
            config.serial_path()?,
            config.serial.clone(),
        )),
        InterfaceType::Socket => {
            let net = config.socket_target()?;
            Box::new(SocketTransport::new(&net.host, net.port))
        }
        InterfaceType::Usbtmc => Box::new(UsbtmcTransport::new(config.usb_id()?)),
        InterfaceType::Vxi11 => {
            let (host, device) = config.vxi11_target()?;
            Box::new(Vxi11Transport::new(host, device))
        }
        InterfaceType::Relay => Box::new(RelayTransport::new(config)?),
    };

    Ok(transport)
}

/// Render raw traffic for debug logs, with line endings made visible
pub(crate) fn escape(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .replace('\n', "␤")
        .replace('\r', "␍")
}
