//! Uniform send/receive/query contract over any [`Transport`]

use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::{
    config::{ConnectConfig, TimeoutPolicy},
    error::{Error, Result},
    framing::{RxBuffer, Terminators, deframe, frame},
    transport::{self, Transport},
};

/// SCPI commands optionally issued right after a session is opened
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitSequence {
    /// `*RST`
    pub reset: bool,
    /// `*CLS`
    pub clear: bool,
    /// `*IDN?`
    pub idn: bool,
}
impl InitSequence {
    pub fn is_empty(&self) -> bool {
        !(self.reset || self.clear || self.idn)
    }
}

/// Kind of instrument behind a connection. Only SCPI devices understand the
/// init sequence.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    #[default]
    Scpi,
    RelayBoard,
    LightPanel,
    TempChamber,
    OtherNonScpi,
}
impl DeviceClass {
    pub fn is_scpi(&self) -> bool {
        matches!(self, Self::Scpi)
    }
}

/// Payload with per-call terminator overrides. `None` terminators fall back
/// to the connection's, an empty one disables framing for that call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StringDatagram {
    pub send_term: Option<Vec<u8>>,
    pub recv_term: Option<Vec<u8>>,
    pub str_data: String,
    pub bytes_data: Vec<u8>,
}
impl StringDatagram {
    pub fn text(data: impl Into<String>) -> Self {
        Self {
            str_data: data.into(),
            ..Default::default()
        }
    }

    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes_data: data.into(),
            ..Default::default()
        }
    }

    pub fn with_send_term(mut self, term: impl AsRef<[u8]>) -> Self {
        self.send_term = Some(term.as_ref().to_vec());
        self
    }

    pub fn with_recv_term(mut self, term: impl AsRef<[u8]>) -> Self {
        self.recv_term = Some(term.as_ref().to_vec());
        self
    }

    /// Content to send, exactly one of `str_data`/`bytes_data` must be set
    pub fn payload(&self) -> Result<&[u8]> {
        match (self.str_data.is_empty(), self.bytes_data.is_empty()) {
            (false, true) => Ok(self.str_data.as_bytes()),
            (true, false) => Ok(&self.bytes_data),
            _ => Err(Error::Config(
                "Datagram needs exactly one of string or bytes data".into(),
            )),
        }
    }

    /// Datagram holding a received message, with the text form filled in
    /// when the bytes are valid UTF-8
    fn received(&self, data: Vec<u8>) -> Self {
        Self {
            send_term: self.send_term.clone(),
            recv_term: self.recv_term.clone(),
            str_data: String::from_utf8(data.clone()).unwrap_or_default(),
            bytes_data: data,
        }
    }
}

/// One instrument: a transport plus message framing and timeouts
pub struct Connection {
    transport: Box<dyn Transport>,
    terminators: Terminators,
    timeouts: TimeoutPolicy,
    buffer: RxBuffer,
    open: bool,
}
impl Connection {
    /// Closed connection over the backend `config` resolves to
    pub fn from_config(config: &ConnectConfig) -> Result<Self> {
        Ok(Self::with_transport(
            transport::from_config(config)?,
            config.terminators(),
            config.timeout,
        ))
    }

    pub fn with_transport(
        transport: Box<dyn Transport>,
        terminators: Terminators,
        timeouts: TimeoutPolicy,
    ) -> Self {
        Self {
            transport,
            terminators,
            timeouts,
            buffer: RxBuffer::new(),
            open: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn terminators(&self) -> &Terminators {
        &self.terminators
    }

    pub fn timeouts(&self) -> &TimeoutPolicy {
        &self.timeouts
    }

    pub fn describe(&self) -> String {
        self.transport.describe()
    }

    pub async fn open(&mut self) -> Result<()> {
        if self.open {
            return Err(Error::AlreadyOpen);
        }

        self.transport.open(&self.timeouts).await?;
        self.buffer.clear();
        self.open = true;

        info!("Opened {}", self.describe());
        Ok(())
    }

    /// Release the transport. Closing a closed connection does nothing.
    pub async fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }

        self.open = false;
        self.buffer.clear();
        self.transport.close().await?;

        info!("Closed {}", self.describe());
        Ok(())
    }

    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let term = self.terminators.send.clone();
        self.send_with(payload, &term).await
    }

    /// Receive one message delimited by the receive terminator
    pub async fn recv(&mut self) -> Result<Vec<u8>> {
        let term = self.terminators.recv.clone();
        self.recv_with(&term, None).await
    }

    /// Receive exactly `len` bytes, ignoring terminators
    pub async fn recv_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        self.recv_with(&[], Some(len)).await
    }

    /// Send then receive as one operation
    pub async fn query(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        self.send(payload).await?;
        self.recv().await
    }

    pub async fn send_data(&mut self, datagram: &StringDatagram) -> Result<()> {
        let term = datagram
            .send_term
            .clone()
            .unwrap_or_else(|| self.terminators.send.clone());
        self.send_with(datagram.payload()?, &term).await
    }

    /// Receive one message using the datagram's receive terminator override
    pub async fn recv_data(&mut self, datagram: &StringDatagram) -> Result<StringDatagram> {
        let term = datagram
            .recv_term
            .clone()
            .unwrap_or_else(|| self.terminators.recv.clone());
        let data = self.recv_with(&term, None).await?;
        Ok(datagram.received(data))
    }

    pub async fn query_data(&mut self, datagram: &StringDatagram) -> Result<StringDatagram> {
        self.send_data(datagram).await?;
        self.recv_data(datagram).await
    }

    /// Run the enabled steps of `init` in the order reset, clear, identify.
    /// Returns the identification string if it was queried.
    pub async fn initialize(
        &mut self,
        init: &InitSequence,
        class: DeviceClass,
    ) -> Result<Option<String>> {
        if init.is_empty() {
            return Ok(None);
        }
        if !class.is_scpi() {
            return Err(Error::InvalidInitForNonScpiDevice(class.to_string()));
        }

        if init.reset {
            self.send(b"*RST").await?;
        }
        if init.clear {
            self.send(b"*CLS").await?;
        }
        if init.idn {
            let idn = self.query(b"*IDN?").await?;
            let idn = String::from_utf8_lossy(&idn).trim().to_string();
            debug!("{} identifies as {idn}", self.describe());
            return Ok(Some(idn));
        }

        Ok(None)
    }

    async fn send_with(&mut self, payload: &[u8], term: &[u8]) -> Result<()> {
        if !self.open {
            return Err(Error::NotOpen);
        }

        let data = frame(payload, term);
        let timeout = self.timeouts.send();
        match tokio::time::timeout(timeout, self.transport.write(&data)).await {
            Err(_) => Err(Error::WriteTimeout(timeout)),
            Ok(res) => res,
        }
    }

    async fn recv_with(&mut self, term: &[u8], len: Option<usize>) -> Result<Vec<u8>> {
        if !self.open {
            return Err(Error::NotOpen);
        }

        let timeout: Duration = self.timeouts.recv();
        deframe(
            &mut *self.transport,
            &mut self.buffer,
            term,
            len,
            timeout,
        )
        .await
    }
}
