use async_trait::async_trait;
use log::{debug, info};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialPortType, SerialStream};

use crate::{
    config::{FlowControl, InterfaceType, Parity, SerialConfig, StopBits, TimeoutPolicy},
    error::{Error, Result},
    scan::DiscoveredResource,
};

use super::{Transport, escape};

pub struct SerialTransport {
    port: String,
    config: SerialConfig,
    serial: Option<SerialStream>,
}
impl SerialTransport {
    pub fn new(port: impl Into<String>, config: SerialConfig) -> Self {
        Self {
            port: port.into(),
            config,
            serial: None,
        }
    }

    fn builder(&self) -> Result<tokio_serial::SerialPortBuilder> {
        let cfg = &self.config;

        let data_bits = match cfg.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            8 => tokio_serial::DataBits::Eight,
            n => return Err(Error::UnsupportedSerialConfig(format!("{n} data bits"))),
        };

        let stop_bits = match cfg.stop_bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
            StopBits::OnePointFive => {
                return Err(Error::UnsupportedSerialConfig("1.5 stop bits".into()));
            }
        };

        let parity = match cfg.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
            p @ (Parity::Mark | Parity::Space) => {
                return Err(Error::UnsupportedSerialConfig(format!("{p:?} parity")));
            }
        };

        let flow_control = match cfg.flow_control {
            FlowControl::None => tokio_serial::FlowControl::None,
            FlowControl::XonXoff => tokio_serial::FlowControl::Software,
            FlowControl::RtsCts => tokio_serial::FlowControl::Hardware,
            FlowControl::DtrDsr => {
                return Err(Error::UnsupportedSerialConfig(
                    "DTR/DSR flow control".into(),
                ));
            }
        };

        Ok(tokio_serial::new(&self.port, cfg.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(flow_control))
    }
}
#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self, _timeouts: &TimeoutPolicy) -> Result<()> {
        if self.serial.is_some() {
            return Err(Error::AlreadyOpen);
        }

        let serial = self
            .builder()?
            .open_native_async()
            .map_err(|e| Error::Connect(format!("{}: {e}", self.port)))?;
        self.serial = Some(serial);

        info!("Opened {} at {} baud", self.port, self.config.baud_rate);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.serial.take();
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let Some(serial) = &mut self.serial else {
            return Err(Error::NotOpen);
        };

        debug!("serial write: {}", escape(data));

        serial
            .write_all(data)
            .await
            .map_err(|e| Error::Write(e.to_string()))?;
        serial
            .flush()
            .await
            .map_err(|e| Error::Write(e.to_string()))?;

        Ok(())
    }

    async fn read(&mut self, max_len: usize) -> Result<Vec<u8>> {
        let Some(serial) = &mut self.serial else {
            return Err(Error::NotOpen);
        };

        let mut buf = vec![0; max_len];
        let len = serial
            .read(&mut buf)
            .await
            .map_err(|e| Error::Read(e.to_string()))?;
        buf.truncate(len);

        debug!("serial read: {}", escape(&buf));

        Ok(buf)
    }

    fn describe(&self) -> String {
        format!("serial:{}", self.port)
    }
}

/// Serial ports known to the OS
pub fn list_serial_ports() -> Result<Vec<DiscoveredResource>> {
    let ports = tokio_serial::available_ports()
        .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;

    Ok(ports
        .into_iter()
        .map(|port| {
            let detail = match port.port_type {
                SerialPortType::UsbPort(usb) => Some(format!(
                    "USB {:04x}:{:04x}{}",
                    usb.vid,
                    usb.pid,
                    usb.product.map(|p| format!(" {p}")).unwrap_or_default()
                )),
                SerialPortType::PciPort => Some("PCI".into()),
                SerialPortType::BluetoothPort => Some("Bluetooth".into()),
                SerialPortType::Unknown => None,
            };

            DiscoveredResource {
                interface: InterfaceType::Serial,
                resource: format!("ASRL{}::INSTR", port.port_name),
                detail,
            }
        })
        .collect())
}
