//! Connection and relay configuration

use std::{
    net::{Ipv4Addr, SocketAddr},
    path::Path,
    time::Duration,
};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

use crate::{
    connection::{DeviceClass, InitSequence},
    error::{Error, Result},
    framing::Terminators,
};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(15);

pub const DEFAULT_READ_TERMINATOR: &str = "\n";
pub const DEFAULT_WRITE_TERMINATOR: &str = "\r\n";

/// Default listen port of the relay
pub const DEFAULT_RELAY_PORT: u16 = 50051;

/// Transport backend a [`ConnectConfig`] resolves to
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Display, AsRefStr, EnumString, EnumIter, Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceType {
    Serial,
    Socket,
    Usbtmc,
    Vxi11,
    /// Session opened on a remote relay, see [`RelayTarget`]
    Relay,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "f32", into = "f32")]
pub enum StopBits {
    One,
    OnePointFive,
    Two,
}
impl TryFrom<f32> for StopBits {
    type Error = Error;

    fn try_from(value: f32) -> Result<Self> {
        if value == 1.0 {
            Ok(Self::One)
        } else if value == 1.5 {
            Ok(Self::OnePointFive)
        } else if value == 2.0 {
            Ok(Self::Two)
        } else {
            Err(Error::Config(format!("Invalid stop bits {value}")))
        }
    }
}
impl From<StopBits> for f32 {
    fn from(value: StopBits) -> Self {
        match value {
            StopBits::One => 1.0,
            StopBits::OnePointFive => 1.5,
            StopBits::Two => 2.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
pub enum Parity {
    #[strum(serialize = "N")]
    #[serde(rename = "N")]
    None,
    #[strum(serialize = "O")]
    #[serde(rename = "O")]
    Odd,
    #[strum(serialize = "E")]
    #[serde(rename = "E")]
    Even,
    #[strum(serialize = "M")]
    #[serde(rename = "M")]
    Mark,
    #[strum(serialize = "S")]
    #[serde(rename = "S")]
    Space,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum FlowControl {
    None,
    XonXoff,
    RtsCts,
    DtrDsr,
}
impl TryFrom<i32> for FlowControl {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::XonXoff),
            2 => Ok(Self::RtsCts),
            /* 4 is VI_ASRL_FLOW_DTR_DSR */
            3 | 4 => Ok(Self::DtrDsr),
            i => Err(Error::Config(format!("Invalid flow control {i}"))),
        }
    }
}
impl From<FlowControl> for i32 {
    fn from(value: FlowControl) -> Self {
        match value {
            FlowControl::None => 0,
            FlowControl::XonXoff => 1,
            FlowControl::RtsCts => 2,
            FlowControl::DtrDsr => 3,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: StopBits,
    pub parity: Parity,
    pub flow_control: FlowControl,
}
impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: StopBits::One,
            parity: Parity::None,
            flow_control: FlowControl::None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
}
impl NetworkConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminatorConfig {
    pub read: String,
    pub write: String,
}
impl Default for TerminatorConfig {
    fn default() -> Self {
        Self {
            read: DEFAULT_READ_TERMINATOR.into(),
            write: DEFAULT_WRITE_TERMINATOR.into(),
        }
    }
}
impl From<&TerminatorConfig> for Terminators {
    fn from(value: &TerminatorConfig) -> Self {
        Terminators::new(value.write.as_bytes(), value.read.as_bytes())
    }
}

/// Connect/send/receive timeouts. Zero means "use the default".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutPolicy {
    #[serde(with = "secs")]
    pub connect: Duration,
    #[serde(with = "secs")]
    pub send: Duration,
    #[serde(with = "secs")]
    pub recv: Duration,
}
impl TimeoutPolicy {
    pub fn new(connect: Duration, send: Duration, recv: Duration) -> Self {
        Self {
            connect,
            send,
            recv,
        }
    }

    pub fn connect(&self) -> Duration {
        or_default(self.connect, DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn send(&self) -> Duration {
        or_default(self.send, DEFAULT_SEND_TIMEOUT)
    }

    pub fn recv(&self) -> Duration {
        or_default(self.recv, DEFAULT_RECV_TIMEOUT)
    }
}

fn or_default(value: Duration, default: Duration) -> Duration {
    if value.is_zero() { default } else { value }
}

/// Durations as (fractional) seconds in config files
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(de)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

/// Relay that owns the instrument. The rest of the [`ConnectConfig`]
/// describes how the relay reaches it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayTarget {
    /// `host:port` or `http://host:port`
    pub address: String,
    /// Name to register on the relay, defaults to the target name
    #[serde(default)]
    pub session: Option<String>,
}

/// How to reach one instrument
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    /// VISA-style resource string, e.g. `ASRL/dev/ttyUSB0::INSTR`
    pub resource: String,
    /// Explicit backend, overrides detection from `resource`/`network`
    pub interface_type: Option<InterfaceType>,
    pub serial: SerialConfig,
    pub network: Option<NetworkConfig>,
    pub terminator: TerminatorConfig,
    pub timeout: TimeoutPolicy,
    /// Go through a relay instead of opening the instrument locally
    pub relay: Option<RelayTarget>,
}
impl ConnectConfig {
    pub fn from_resource(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            ..Default::default()
        }
    }

    pub fn serial(resource: impl Into<String>, serial: SerialConfig) -> Self {
        Self {
            resource: resource.into(),
            serial,
            ..Default::default()
        }
    }

    pub fn socket(host: impl Into<String>, port: u16) -> Self {
        Self {
            network: Some(NetworkConfig {
                host: host.into(),
                port,
            }),
            ..Default::default()
        }
    }

    pub fn with_terminators(mut self, read: &str, write: &str) -> Self {
        self.terminator = TerminatorConfig {
            read: read.into(),
            write: write.into(),
        };
        self
    }

    pub fn with_timeouts(mut self, timeout: TimeoutPolicy) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn via_relay(mut self, address: impl Into<String>, session: Option<String>) -> Self {
        self.relay = Some(RelayTarget {
            address: address.into(),
            session,
        });
        self
    }

    /// Human readable target, used in logs
    pub fn name(&self) -> String {
        match &self.network {
            Some(net) if !net.host.is_empty() => net.address(),
            _ => self.resource.clone(),
        }
    }

    pub fn terminators(&self) -> Terminators {
        (&self.terminator).into()
    }

    fn host(&self) -> Option<&NetworkConfig> {
        self.network.as_ref().filter(|net| !net.host.is_empty())
    }

    /// Resolve which backend this config describes
    pub fn interface_type(&self) -> Result<InterfaceType> {
        if self.relay.is_some() {
            return Ok(InterfaceType::Relay);
        }
        if let Some(itype) = self.interface_type {
            return Ok(itype);
        }

        match (self.host(), self.resource.is_empty()) {
            (Some(_), true) => Ok(InterfaceType::Socket),
            (None, false) => {
                let res = self.resource.as_str();
                if res.starts_with("USB") {
                    Ok(InterfaceType::Usbtmc)
                } else if res.starts_with("ASRL") || res.starts_with("/dev/") {
                    Ok(InterfaceType::Serial)
                } else if res.starts_with("TCPIP") {
                    Ok(InterfaceType::Vxi11)
                } else {
                    Err(Error::Config(format!("Resource {res} is invalid")))
                }
            }
            (Some(net), false) => Err(Error::Config(format!(
                "Only one of network host ({}) or resource ({}) may be given",
                net.host, self.resource
            ))),
            (None, true) => Err(Error::Config(
                "Either a network host or a resource is required".into(),
            )),
        }
    }

    /// Relay address and remote session name for the relay backend
    pub fn relay_target(&self) -> Result<(&str, String)> {
        let Some(relay) = &self.relay else {
            return Err(Error::Config("Relay interface requires a relay address".into()));
        };
        if relay.address.is_empty() {
            return Err(Error::Config("Relay address is empty".into()));
        }
        let session = relay.session.clone().unwrap_or_else(|| self.name());
        Ok((&relay.address, session))
    }

    /// Network target for the socket backend
    pub fn socket_target(&self) -> Result<&NetworkConfig> {
        self.host()
            .ok_or_else(|| Error::Config("Socket interface requires a network host".into()))
    }

    /// OS path of the serial port
    pub fn serial_path(&self) -> Result<String> {
        let res = self.resource.as_str();
        if res.starts_with("/dev/") {
            return Ok(res.to_string());
        }

        let Some(rest) = res.strip_prefix("ASRL") else {
            return Err(Error::Config(format!("Not a serial resource: {res}")));
        };
        let port = rest.strip_suffix("::INSTR").unwrap_or(rest);
        if port.is_empty() {
            return Err(Error::Config(format!("Serial resource {res} has no port")));
        }

        if port.chars().all(|c| c.is_ascii_digit()) {
            Ok(format!("COM{port}"))
        } else {
            Ok(port.to_string())
        }
    }

    /// Host and device name of a `TCPIP[n]::<host>[::<device>]::INSTR` resource
    pub fn vxi11_target(&self) -> Result<(String, String)> {
        let res = self.resource.as_str();
        let fields: Vec<_> = res.split("::").collect();
        if fields.len() < 2 || !fields[0].starts_with("TCPIP") || fields[1].is_empty() {
            return Err(Error::Config(format!("Not a VXI-11 resource: {res}")));
        }

        let host = fields[1].to_string();
        let device = match fields.get(2) {
            Some(dev) if !dev.eq_ignore_ascii_case("INSTR") => dev.to_string(),
            _ => "inst0".to_string(),
        };

        Ok((host, device))
    }

    /// Vendor/product/serial of a `USB[n]::<vid>::<pid>[::<serial>]::INSTR` resource
    pub fn usb_id(&self) -> Result<UsbResourceId> {
        let res = self.resource.as_str();
        let fields: Vec<_> = res.split("::").collect();
        if fields.len() < 3 || !fields[0].starts_with("USB") {
            return Err(Error::Config(format!("Not a USB resource: {res}")));
        }

        let serial = match fields.get(3) {
            Some(serial) if !serial.eq_ignore_ascii_case("INSTR") => Some(serial.to_string()),
            _ => None,
        };

        Ok(UsbResourceId {
            vendor: parse_usb_id(fields[1])?,
            product: parse_usb_id(fields[2])?,
            serial,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsbResourceId {
    pub vendor: u16,
    pub product: u16,
    pub serial: Option<String>,
}

fn parse_usb_id(field: &str) -> Result<u16> {
    let parsed = match field
        .strip_prefix("0x")
        .or_else(|| field.strip_prefix("0X"))
    {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => field.parse(),
    };
    parsed.map_err(|e| Error::Config(format!("Invalid USB id `{field}`: {e}")))
}

/// Session registered by the relay at startup
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PreloadSession {
    pub name: String,
    pub connect: ConnectConfig,
    #[serde(default)]
    pub init: InitSequence,
    #[serde(default)]
    pub device_class: DeviceClass,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub bind: SocketAddr,
    #[serde(rename = "session")]
    pub sessions: Vec<PreloadSession>,
}
impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_RELAY_PORT)),
            sessions: vec![],
        }
    }
}
impl RelaySettings {
    /// Defaults, then the TOML file if given, then `LABHAL_*` environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "Config file {} does not exist",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("LABHAL_").split("__"));

        figment
            .extract()
            .map_err(|e| Error::Config(format!("Could not load relay settings: {e}")))
    }
}
