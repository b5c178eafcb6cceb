use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tonic::Code;

use crate::{
    config::{ConnectConfig, TimeoutPolicy},
    connection::{DeviceClass, InitSequence},
    error::{Error, Result},
    registry::RegisterPolicy,
    relay::RelayClient,
};

use super::{Transport, escape};

/// Instrument owned by a remote relay. The session is opened there without
/// terminators, so framing stays with the local [`crate::Connection`].
pub struct RelayTransport {
    address: String,
    session: String,
    remote: ConnectConfig,
    client: Option<RelayClient>,
    recv_timeout: Duration,
}
impl RelayTransport {
    pub fn new(config: &ConnectConfig) -> Result<Self> {
        let (address, session) = config.relay_target()?;
        let mut remote = config.clone().with_terminators("", "");
        remote.relay = None;

        Ok(Self {
            address: address.to_string(),
            session,
            remote,
            client: None,
            recv_timeout: config.timeout.recv(),
        })
    }

    fn client(&mut self) -> Result<&mut RelayClient> {
        self.client.as_mut().ok_or(Error::NotOpen)
    }
}
#[async_trait]
impl Transport for RelayTransport {
    async fn open(&mut self, timeouts: &TimeoutPolicy) -> Result<()> {
        if self.client.is_some() {
            return Err(Error::AlreadyOpen);
        }

        let timeout = timeouts.connect();
        let mut client =
            match tokio::time::timeout(timeout, RelayClient::connect(&self.address)).await {
                Err(_) => {
                    return Err(Error::ConnectTimeout {
                        target: self.address.clone(),
                        timeout,
                    });
                }
                Ok(res) => res?,
            };
        client
            .init(
                &self.session,
                &self.remote,
                &InitSequence::default(),
                DeviceClass::Scpi,
                RegisterPolicy::Reject,
            )
            .await?;
        self.recv_timeout = timeouts.recv();
        self.client = Some(client);

        info!("Opened {} on relay {}", self.session, self.address);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let Some(mut client) = self.client.take() else {
            return Ok(());
        };

        if let Err(e) = client.close(&self.session).await {
            warn!("Closing {} on relay {} failed: {e}", self.session, self.address);
            return Err(e);
        }
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        debug!("relay write: {}", escape(data));

        let session = self.session.clone();
        self.client()?.send(&session, data).await
    }

    /* The relay reads at most one backend chunk per call, so `max_len` is
     * left to the remote side */
    async fn read(&mut self, _max_len: usize) -> Result<Vec<u8>> {
        let session = self.session.clone();
        let timeout = self.recv_timeout;
        let data = match self.client()?.recv(&session).await {
            Err(Error::Relay {
                code: Code::DeadlineExceeded,
                ..
            }) => {
                return Err(Error::ReceiveTimeout {
                    timeout,
                    partial: vec![],
                });
            }
            res => res?,
        };

        debug!("relay read: {}", escape(&data));
        Ok(data)
    }

    fn describe(&self) -> String {
        format!("relay:{}/{}", self.address, self.session)
    }
}
