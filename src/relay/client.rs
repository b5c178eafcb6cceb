//! Remote access to instruments attached to a relay

use log::debug;
use tonic::{Status, transport::Channel};

use super::messages::{
    self, CloseRequest, InstRequest, RecvDataRequest, RecvRequest, SendDataRequest, SendRequest,
    SystemAction, SystemRequest, SystemResponse, basic_system_client::BasicSystemClient,
    instrument_client::InstrumentClient,
};
use crate::{
    config::ConnectConfig,
    connection::{DeviceClass, InitSequence, StringDatagram},
    error::{Error, Result},
    registry::RegisterPolicy,
};

/// gRPC channel to a relay. Clones share the channel.
#[derive(Clone)]
pub struct RelayClient {
    instrument: InstrumentClient<Channel>,
    system: BasicSystemClient<Channel>,
}
impl RelayClient {
    /// Connect to `address`, either `host:port` or a full `http://` URI
    pub async fn connect(address: &str) -> Result<Self> {
        let uri = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };
        let channel = Channel::from_shared(uri)
            .map_err(|e| Error::Config(format!("Invalid relay address {address}: {e}")))?
            .connect()
            .await?;
        debug!("Connected to relay {address}");

        Ok(Self {
            instrument: InstrumentClient::new(channel.clone()),
            system: BasicSystemClient::new(channel),
        })
    }

    /// Open `config` on the relay side and register it as `name`. Returns
    /// the identification string if `init` queried it.
    pub async fn init(
        &mut self,
        name: &str,
        config: &ConnectConfig,
        init: &InitSequence,
        class: DeviceClass,
        policy: RegisterPolicy,
    ) -> Result<Option<String>> {
        let mut req = InstRequest::from_config(name, config);
        req.init = Some(init.into());
        req.device_class = messages::DeviceClass::from(class) as i32;
        req.force = policy == RegisterPolicy::Replace;

        let resp = self
            .instrument
            .init(req)
            .await
            .map_err(|s| remote(&s, name))?
            .into_inner();
        if !resp.result {
            return Err(Error::BadResponse(format!("Init of {name} was refused")));
        }

        Ok(Some(resp.idn).filter(|idn| !idn.is_empty()))
    }

    pub async fn close(&mut self, name: &str) -> Result<()> {
        let req = CloseRequest { name: name.into() };
        let resp = self
            .instrument
            .close(req)
            .await
            .map_err(|s| remote(&s, name))?
            .into_inner();
        if !resp.status {
            return Err(Error::BadResponse(format!("Close of {name} failed")));
        }
        Ok(())
    }

    pub async fn send(&mut self, name: &str, payload: &[u8]) -> Result<()> {
        let req = SendRequest {
            name: name.into(),
            send: payload.to_vec(),
        };
        self.instrument
            .send(req)
            .await
            .map_err(|s| remote(&s, name))?;
        Ok(())
    }

    pub async fn recv(&mut self, name: &str) -> Result<Vec<u8>> {
        let req = RecvRequest { name: name.into() };
        let resp = self
            .instrument
            .recv(req)
            .await
            .map_err(|s| remote(&s, name))?;
        Ok(resp.into_inner().read)
    }

    pub async fn query(&mut self, name: &str, payload: &[u8]) -> Result<Vec<u8>> {
        let req = SendRequest {
            name: name.into(),
            send: payload.to_vec(),
        };
        let resp = self
            .instrument
            .query(req)
            .await
            .map_err(|s| remote(&s, name))?;
        Ok(resp.into_inner().read)
    }

    pub async fn send_data(&mut self, name: &str, datagram: &StringDatagram) -> Result<()> {
        /* Catch an empty or ambiguous payload before the round trip */
        datagram.payload()?;
        let req = SendDataRequest {
            name: name.into(),
            string_datagram: Some(datagram.into()),
        };
        self.instrument
            .send_data(req)
            .await
            .map_err(|s| remote(&s, name))?;
        Ok(())
    }

    /// Receive using the terminator overrides of `datagram`, its payload is
    /// ignored
    pub async fn recv_data(
        &mut self,
        name: &str,
        datagram: &StringDatagram,
    ) -> Result<StringDatagram> {
        let req = RecvDataRequest {
            name: name.into(),
            string_datagram: Some(datagram.into()),
        };
        let resp = self
            .instrument
            .recv_data(req)
            .await
            .map_err(|s| remote(&s, name))?;
        received(resp.into_inner().string_datagram)
    }

    pub async fn query_data(
        &mut self,
        name: &str,
        datagram: &StringDatagram,
    ) -> Result<StringDatagram> {
        datagram.payload()?;
        let req = SendDataRequest {
            name: name.into(),
            string_datagram: Some(datagram.into()),
        };
        let resp = self
            .instrument
            .query_data(req)
            .await
            .map_err(|s| remote(&s, name))?;
        received(resp.into_inner().string_datagram)
    }

    pub async fn system(&mut self, action: SystemAction) -> Result<SystemResponse> {
        let req = SystemRequest {
            action: action as i32,
        };
        let resp = self
            .system
            .basic_system(req)
            .await
            .map_err(|s| remote(&s, ""))?;
        Ok(resp.into_inner())
    }
}

fn remote(status: &Status, name: &str) -> Error {
    debug!("Relay call on {name} failed with {:?}: {}", status.code(), status.message());
    Error::from_status(status, name)
}

fn received(dg: Option<messages::StringDatagram>) -> Result<StringDatagram> {
    dg.map(StringDatagram::from)
        .ok_or_else(|| Error::BadResponse("Response carries no string datagram".into()))
}
