//! VXI-11 protocol, referencing VXI-11 1.0 specification

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::net::TcpStream;

use crate::{
    config::{InterfaceType, TimeoutPolicy},
    error::{Error, Result},
    scan::DiscoveredResource,
};

use self::{
    onc::OncClient,
    rpc::{
        CoreCall, DEVICE_CORE_PROG, DEVICE_CORE_VERS, DeviceError, FLAG_END, REASON_END,
        parse_create_link, parse_error, parse_read, parse_write,
    },
};

use super::{Transport, escape};

mod onc;
pub mod portmap;
mod rpc;
mod xdr;

/// Largest `device_read` request
const READ_SIZE: usize = 65536;

/// Established device link
struct Link {
    client: OncClient,
    lid: i32,
    max_recv_size: usize,
    /// A call was dropped before its reply arrived, the device may still be
    /// working on it
    in_flight: bool,
}
impl Link {
    async fn call(&mut self, call: CoreCall<'_>) -> Result<Vec<u8>> {
        let proc = call.procedure();
        self.in_flight = true;
        let res = self
            .client
            .call(DEVICE_CORE_PROG, DEVICE_CORE_VERS, proc, call)
            .await;
        self.in_flight = false;

        res?.map_err(|e| Error::BadResponse(format!("Core procedure {proc} failed: {e}")))
    }
}

pub struct Vxi11Transport {
    host: String,
    device: String,
    portmap_port: u16,
    timeouts: TimeoutPolicy,
    link: Option<Link>,
}
impl Vxi11Transport {
    pub fn new(host: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            device: device.into(),
            portmap_port: portmap::PORTMAP_PORT,
            timeouts: TimeoutPolicy::default(),
            link: None,
        }
    }

    /// Use a portmapper on another port than 111
    pub fn with_portmap_port(mut self, port: u16) -> Self {
        self.portmap_port = port;
        self
    }

    async fn connect(&self, port: u16) -> Result<OncClient> {
        let stream = TcpStream::connect((self.host.as_str(), port))
            .await
            .map_err(|e| Error::Connect(format!("{}:{port}: {e}", self.host)))?;
        stream.set_nodelay(true)?;
        Ok(OncClient::new(stream))
    }

    /// Portmap lookup, core channel connection and `create_link`
    async fn establish(&self) -> Result<Link> {
        let port = {
            let mut pmap = self.connect(self.portmap_port).await?;
            portmap::request_port(&mut pmap, DEVICE_CORE_PROG, DEVICE_CORE_VERS).await?
        };
        if port == 0 {
            return Err(Error::Connect(format!(
                "{} has no VXI-11 core channel registered",
                self.host
            )));
        }

        let mut client = self.connect(port).await?;
        let call = CoreCall::CreateLink {
            device: &self.device,
        };
        let results = client
            .call(DEVICE_CORE_PROG, DEVICE_CORE_VERS, call.procedure(), call)
            .await?
            .map_err(|e| Error::LinkCreateFailed(format!("{}: {e}", self.describe())))?;
        let parms = parse_create_link(&results)?
            .map_err(|e| Error::LinkCreateFailed(format!("{}: {e}", self.describe())))?;

        debug!(
            "Link {} to {} accepts {} bytes per write",
            parms.lid,
            self.describe(),
            parms.max_recv_size
        );

        Ok(Link {
            client,
            lid: parms.lid,
            /* A zero size would never make progress */
            max_recv_size: (parms.max_recv_size as usize).max(1),
            in_flight: false,
        })
    }
}
#[async_trait]
impl Transport for Vxi11Transport {
    async fn open(&mut self, timeouts: &TimeoutPolicy) -> Result<()> {
        if self.link.is_some() {
            return Err(Error::AlreadyOpen);
        }

        let timeout = timeouts.connect();
        let link = match tokio::time::timeout(timeout, self.establish()).await {
            Err(_) => {
                return Err(Error::ConnectTimeout {
                    target: self.describe(),
                    timeout,
                });
            }
            Ok(res) => res?,
        };

        info!("Created link {} to {}", link.lid, self.describe());
        self.timeouts = *timeouts;
        self.link = Some(link);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let Some(mut link) = self.link.take() else {
            return Ok(());
        };

        let lid = link.lid;
        if link.in_flight {
            /* destroy_link would queue behind the abandoned call. Closing the
             * channel releases the link on the device side. */
            warn!(
                "Dropping link {lid} to {} with a call still pending",
                self.describe()
            );
            return Ok(());
        }

        let res =
            tokio::time::timeout(self.timeouts.send(), link.call(CoreCall::DestroyLink { lid }))
                .await;
        let outcome = match res {
            Err(_) => Err("timed out".to_string()),
            Ok(results) => results
                .and_then(|results| parse_error(&results))
                .map_err(|e| e.to_string())
                .and_then(|res| res.map_err(|e| e.to_string())),
        };
        if let Err(e) = outcome {
            warn!("destroy_link on {}: {e}", self.describe());
        }

        Ok(())
    }

    /// Write in chunks no larger than the link accepts, END set on the last
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let timeout = self.timeouts.send();
        let Some(link) = &mut self.link else {
            return Err(Error::NotOpen);
        };

        debug!("vxi11 write: {}", escape(data));

        let n_chunks = data.len().div_ceil(link.max_recv_size).max(1);
        for (index, chunk) in data.chunks(link.max_recv_size).enumerate() {
            let flags = if index == n_chunks - 1 { FLAG_END } else { 0 };
            let call = CoreCall::Write {
                lid: link.lid,
                io_timeout: millis(timeout),
                flags,
                data: chunk,
            };
            let results = link.call(call).await?;

            match parse_write(&results)? {
                Ok(size) if size as usize != chunk.len() => {
                    return Err(Error::Write(format!(
                        "device_write accepted {size} of {} bytes",
                        chunk.len()
                    )));
                }
                Ok(_) => (),
                Err(DeviceError::IO_TIMEOUT) => return Err(Error::WriteTimeout(timeout)),
                Err(e) => return Err(Error::Write(format!("device_write failed: {e}"))),
            }
        }

        Ok(())
    }

    /// Issue device reads until END or `max_len` bytes
    async fn read(&mut self, max_len: usize) -> Result<Vec<u8>> {
        let timeout = self.timeouts.recv();
        let Some(link) = &mut self.link else {
            return Err(Error::NotOpen);
        };

        let mut data = vec![];
        loop {
            let call = CoreCall::Read {
                lid: link.lid,
                request_size: (max_len - data.len()).min(READ_SIZE) as u32,
                io_timeout: millis(timeout),
            };
            let results = link.call(call).await?;

            let (reason, chunk) = match parse_read(&results)? {
                Ok(read) => read,
                Err(DeviceError::IO_TIMEOUT) => {
                    return Err(Error::ReceiveTimeout {
                        timeout,
                        partial: data,
                    });
                }
                Err(e) => return Err(Error::Read(format!("device_read failed: {e}"))),
            };

            data.extend(chunk);
            if reason & REASON_END != 0 || data.len() >= max_len {
                break;
            }
        }

        debug!("vxi11 read: {}", escape(&data));

        Ok(data)
    }

    fn describe(&self) -> String {
        format!("vxi11:{}/{}", self.host, self.device)
    }
}

fn millis(timeout: Duration) -> u32 {
    timeout.as_millis().try_into().unwrap_or(u32::MAX)
}

/// Find VXI-11 instruments on the local network by broadcasting a portmap
/// query for the core channel
pub async fn discover_vxi11(timeout: Duration) -> Result<Vec<DiscoveredResource>> {
    let found = portmap::broadcast_getport(
        portmap::PORTMAP_PORT,
        DEVICE_CORE_PROG,
        DEVICE_CORE_VERS,
        timeout,
    )
    .await?;

    Ok(found
        .into_iter()
        .map(|(ip, port)| DiscoveredResource {
            interface: InterfaceType::Vxi11,
            resource: format!("TCPIP0::{ip}::inst0::INSTR"),
            detail: Some(format!("core channel on port {port}")),
        })
        .collect())
}
