//! Protobuf messages and gRPC services of the relay, generated from
//! `proto/py_lab_hal.proto`

use std::time::Duration;

use crate::{
    config::{
        ConnectConfig, FlowControl, InterfaceType, NetworkConfig, Parity, StopBits,
        TerminatorConfig, TimeoutPolicy,
    },
    connection,
    error::{Error, Result},
};

tonic::include_proto!("py_lab_hal");

fn secs(value: f64, what: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| Error::Config(format!("Invalid {what} timeout {value}: {e}")))
}

impl InstRequest {
    /// Connection parameters between the relay and the instrument
    pub fn connect_config(&self) -> Result<ConnectConfig> {
        let tag = if self.board_interface_type.is_empty() {
            &self.interface_type
        } else {
            &self.board_interface_type
        };
        let interface_type = if tag.is_empty() {
            None
        } else {
            let itype = tag
                .parse::<InterfaceType>()
                .map_err(|_| Error::Config(format!("Unknown interface type {tag}")))?;
            /* The caller came through a relay, detect the instrument side from
             * the resource */
            Some(itype).filter(|itype| *itype != InterfaceType::Relay)
        };

        let network = if self.socket_host.is_empty() {
            None
        } else {
            let port = u16::try_from(self.socket_port)
                .map_err(|_| Error::Config(format!("Invalid port {}", self.socket_port)))?;
            Some(NetworkConfig {
                host: self.socket_host.clone(),
                port,
            })
        };

        let serial = match &self.serial_config {
            Some(cfg) => cfg.to_config()?,
            None => Default::default(),
        };

        let defaults = TerminatorConfig::default();
        let terminator = TerminatorConfig {
            read: self.read_terminator.clone().unwrap_or(defaults.read),
            write: self.write_terminator.clone().unwrap_or(defaults.write),
        };

        Ok(ConnectConfig {
            resource: self.visa_resource.clone(),
            interface_type,
            serial,
            network,
            terminator,
            relay: None,
            timeout: TimeoutPolicy::new(
                secs(self.connect_timeout, "connect")?,
                secs(self.send_timeout, "send")?,
                secs(self.recv_timeout, "receive")?,
            ),
        })
    }

    pub fn from_config(name: &str, config: &ConnectConfig) -> Self {
        Self {
            socket_host: config
                .network
                .as_ref()
                .map(|net| net.host.clone())
                .unwrap_or_default(),
            socket_port: config.network.as_ref().map(|net| net.port as i32).unwrap_or(0),
            visa_resource: config.resource.clone(),
            serial_config: Some(SerialConfig::from_config(&config.serial)),
            interface_type: InterfaceType::Relay.to_string(),
            read_terminator: Some(config.terminator.read.clone()),
            write_terminator: Some(config.terminator.write.clone()),
            connect_timeout: config.timeout.connect.as_secs_f64(),
            recv_timeout: config.timeout.recv.as_secs_f64(),
            send_timeout: config.timeout.send.as_secs_f64(),
            name: name.to_string(),
            board_interface_type: config
                .interface_type
                .filter(|itype| *itype != InterfaceType::Relay)
                .map(|itype| itype.to_string())
                .unwrap_or_default(),
            init: None,
            device_class: DeviceClass::Scpi as i32,
            force: false,
        }
    }

    pub fn init_sequence(&self) -> connection::InitSequence {
        match &self.init {
            Some(init) => connection::InitSequence {
                reset: init.reset,
                clear: init.clear,
                idn: init.idn,
            },
            None => Default::default(),
        }
    }

    pub fn class(&self) -> connection::DeviceClass {
        self.device_class().into()
    }
}

impl SerialConfig {
    fn to_config(&self) -> Result<crate::config::SerialConfig> {
        let defaults = crate::config::SerialConfig::default();

        let baud_rate = match self.baud_rate {
            0 => defaults.baud_rate,
            baud => u32::try_from(baud)
                .map_err(|_| Error::Config(format!("Invalid baud rate {baud}")))?,
        };
        let data_bits = match self.data_bits {
            0 => defaults.data_bits,
            bits => u8::try_from(bits)
                .map_err(|_| Error::Config(format!("Invalid data bits {bits}")))?,
        };
        let stop_bits = if self.stop_bits == 0.0 {
            defaults.stop_bits
        } else {
            StopBits::try_from(self.stop_bits)?
        };
        let parity = match self.parity.as_str() {
            "" => defaults.parity,
            p => p
                .parse::<Parity>()
                .map_err(|_| Error::Config(format!("Invalid parity {p}")))?,
        };

        Ok(crate::config::SerialConfig {
            baud_rate,
            data_bits,
            stop_bits,
            parity,
            flow_control: FlowControl::try_from(self.flow_control)?,
        })
    }

    fn from_config(config: &crate::config::SerialConfig) -> Self {
        Self {
            baud_rate: config.baud_rate as i32,
            data_bits: config.data_bits as i32,
            stop_bits: config.stop_bits.into(),
            parity: config.parity.to_string(),
            flow_control: config.flow_control.into(),
        }
    }
}

impl From<DeviceClass> for connection::DeviceClass {
    fn from(value: DeviceClass) -> Self {
        match value {
            DeviceClass::Scpi => Self::Scpi,
            DeviceClass::RelayBoard => Self::RelayBoard,
            DeviceClass::LightPanel => Self::LightPanel,
            DeviceClass::TempChamber => Self::TempChamber,
            DeviceClass::OtherNonScpi => Self::OtherNonScpi,
        }
    }
}

impl From<connection::DeviceClass> for DeviceClass {
    fn from(value: connection::DeviceClass) -> Self {
        match value {
            connection::DeviceClass::Scpi => Self::Scpi,
            connection::DeviceClass::RelayBoard => Self::RelayBoard,
            connection::DeviceClass::LightPanel => Self::LightPanel,
            connection::DeviceClass::TempChamber => Self::TempChamber,
            connection::DeviceClass::OtherNonScpi => Self::OtherNonScpi,
        }
    }
}

impl From<&connection::InitSequence> for InitSequence {
    fn from(value: &connection::InitSequence) -> Self {
        Self {
            reset: value.reset,
            clear: value.clear,
            idn: value.idn,
        }
    }
}

impl From<&connection::StringDatagram> for StringDatagram {
    fn from(value: &connection::StringDatagram) -> Self {
        let term = |t: &Option<Vec<u8>>| t.as_ref().map(|t| String::from_utf8_lossy(t).to_string());
        Self {
            send_term: term(&value.send_term),
            recv_term: term(&value.recv_term),
            str_data: value.str_data.clone(),
            bytes_data: value.bytes_data.clone(),
        }
    }
}

impl From<StringDatagram> for connection::StringDatagram {
    fn from(value: StringDatagram) -> Self {
        Self {
            send_term: value.send_term.map(String::into_bytes),
            recv_term: value.recv_term.map(String::into_bytes),
            str_data: value.str_data,
            bytes_data: value.bytes_data,
        }
    }
}
