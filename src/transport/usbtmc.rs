//! USB test & measurement class devices through the Linux `usbtmc` driver

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use log::{debug, info};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt, AsyncWriteExt},
};

use crate::{
    config::{InterfaceType, TimeoutPolicy, UsbResourceId},
    error::{Error, Result},
    scan::DiscoveredResource,
};

use super::{Transport, escape};

const SYSFS_ROOT: &str = "/sys/class/usbmisc";
const DEV_ROOT: &str = "/dev";

/// One `usbtmcN` node found in sysfs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsbtmcDevice {
    pub node: String,
    pub vendor: u16,
    pub product: u16,
    pub serial: Option<String>,
}
impl UsbtmcDevice {
    fn matches(&self, id: &UsbResourceId) -> bool {
        self.vendor == id.vendor
            && self.product == id.product
            && match &id.serial {
                Some(serial) => self.serial.as_deref() == Some(serial.as_str()),
                None => true,
            }
    }

    pub fn resource(&self) -> String {
        match &self.serial {
            Some(serial) => format!(
                "USB0::0x{:04X}::0x{:04X}::{serial}::INSTR",
                self.vendor, self.product
            ),
            None => format!("USB0::0x{:04X}::0x{:04X}::INSTR", self.vendor, self.product),
        }
    }
}

pub struct UsbtmcTransport {
    id: UsbResourceId,
    sysfs_root: PathBuf,
    dev_root: PathBuf,
    recv_timeout: Duration,
    file: Option<File>,
}
impl UsbtmcTransport {
    pub fn new(id: UsbResourceId) -> Self {
        Self::with_roots(id, SYSFS_ROOT, DEV_ROOT)
    }

    /// Resolve devices below other roots than `/sys/class/usbmisc` and `/dev`
    pub fn with_roots(
        id: UsbResourceId,
        sysfs_root: impl AsRef<Path>,
        dev_root: impl AsRef<Path>,
    ) -> Self {
        Self {
            id,
            sysfs_root: sysfs_root.as_ref().to_path_buf(),
            dev_root: dev_root.as_ref().to_path_buf(),
            recv_timeout: Duration::ZERO,
            file: None,
        }
    }
}
#[async_trait]
impl Transport for UsbtmcTransport {
    async fn open(&mut self, timeouts: &TimeoutPolicy) -> Result<()> {
        if self.file.is_some() {
            return Err(Error::AlreadyOpen);
        }

        let devices = enumerate(&self.sysfs_root).await?;
        let Some(device) = devices.into_iter().find(|dev| dev.matches(&self.id)) else {
            return Err(Error::DeviceNotFound(self.describe()));
        };

        let path = self.dev_root.join(&device.node);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .await
            .map_err(|e| Error::Connect(format!("{}: {e}", path.display())))?;

        info!("Opened {} for {}", path.display(), device.resource());
        self.recv_timeout = timeouts.recv();
        self.file = Some(file);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.file.take();
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let Some(file) = &mut self.file else {
            return Err(Error::NotOpen);
        };

        debug!("usbtmc write: {}", escape(data));

        file.write_all(data)
            .await
            .map_err(|e| Error::Write(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| Error::Write(e.to_string()))?;

        Ok(())
    }

    async fn read(&mut self, max_len: usize) -> Result<Vec<u8>> {
        let Some(file) = &mut self.file else {
            return Err(Error::NotOpen);
        };

        let mut buf = vec![0; max_len];
        let len = match file.read(&mut buf).await {
            Ok(len) => len,
            /* The driver times out a transfer on its own */
            Err(e) if e.kind() == ErrorKind::TimedOut => {
                return Err(Error::ReceiveTimeout {
                    timeout: self.recv_timeout,
                    partial: vec![],
                });
            }
            Err(e) => return Err(Error::Read(e.to_string())),
        };
        buf.truncate(len);

        debug!("usbtmc read: {}", escape(&buf));

        Ok(buf)
    }

    fn describe(&self) -> String {
        match &self.id.serial {
            Some(serial) => format!(
                "usbtmc:{:04x}:{:04x}:{serial}",
                self.id.vendor, self.id.product
            ),
            None => format!("usbtmc:{:04x}:{:04x}", self.id.vendor, self.id.product),
        }
    }
}

/// Read the attributes of every `usbtmc*` node below `root`. Nodes with
/// unreadable ids are skipped.
async fn enumerate(root: &Path) -> Result<Vec<UsbtmcDevice>> {
    let mut dir = match tokio::fs::read_dir(root).await {
        Ok(dir) => dir,
        /* Driver not loaded */
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e.into()),
    };

    let mut devices = vec![];
    while let Some(entry) = dir.next_entry().await? {
        let node = entry.file_name().to_string_lossy().to_string();
        if !node.starts_with("usbtmc") {
            continue;
        }

        /* `device` is the interface; ids live on its parent USB device */
        let usb_dev = entry.path().join("device").join("..");
        let (Some(vendor), Some(product)) = (
            read_hex(&usb_dev.join("idVendor")).await,
            read_hex(&usb_dev.join("idProduct")).await,
        ) else {
            debug!("Skipping {node}: no USB ids");
            continue;
        };
        let serial = tokio::fs::read_to_string(usb_dev.join("serial"))
            .await
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        devices.push(UsbtmcDevice {
            node,
            vendor,
            product,
            serial,
        });
    }

    devices.sort_by(|a, b| a.node.cmp(&b.node));
    Ok(devices)
}

async fn read_hex(path: &Path) -> Option<u16> {
    let text = tokio::fs::read_to_string(path).await.ok()?;
    u16::from_str_radix(text.trim(), 16).ok()
}

/// USB instruments bound to the `usbtmc` driver
pub async fn list_usbtmc_devices() -> Result<Vec<DiscoveredResource>> {
    list_below(Path::new(SYSFS_ROOT)).await
}

pub(crate) async fn list_below(root: &Path) -> Result<Vec<DiscoveredResource>> {
    Ok(enumerate(root)
        .await?
        .into_iter()
        .map(|dev| DiscoveredResource {
            interface: InterfaceType::Usbtmc,
            resource: dev.resource(),
            detail: Some(format!("/dev/{}", dev.node)),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn fake_node(root: &Path, node: &str, vid: &str, pid: &str, serial: Option<&str>) {
        let dir = root.join(node);
        fs::create_dir_all(dir.join("device")).unwrap();
        fs::write(dir.join("idVendor"), format!("{vid}\n")).unwrap();
        fs::write(dir.join("idProduct"), format!("{pid}\n")).unwrap();
        if let Some(serial) = serial {
            fs::write(dir.join("serial"), format!("{serial}\n")).unwrap();
        }
    }

    fn id(vendor: u16, product: u16, serial: Option<&str>) -> UsbResourceId {
        UsbResourceId {
            vendor,
            product,
            serial: serial.map(String::from),
        }
    }

    #[tokio::test]
    async fn resolves_device_by_ids() {
        let sysfs = tempfile::tempdir().unwrap();
        let dev = tempfile::tempdir().unwrap();
        fake_node(sysfs.path(), "usbtmc0", "0957", "1798", Some("MY111"));
        fake_node(sysfs.path(), "usbtmc1", "1ab1", "0e11", Some("DP8C1234"));
        fs::write(dev.path().join("usbtmc1"), b"RIGOL,DP832\n").unwrap();
        fs::write(dev.path().join("usbtmc0"), b"").unwrap();

        let mut transport = UsbtmcTransport::with_roots(
            id(0x1ab1, 0x0e11, Some("DP8C1234")),
            sysfs.path(),
            dev.path(),
        );
        transport.open(&TimeoutPolicy::default()).await.unwrap();
        assert_eq!(transport.read(64).await.unwrap(), b"RIGOL,DP832\n");
        transport.close().await.unwrap();

        let listed = list_below(sysfs.path()).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].resource, "USB0::0x1AB1::0x0E11::DP8C1234::INSTR");
    }

    #[tokio::test]
    async fn missing_device_is_not_found() {
        let sysfs = tempfile::tempdir().unwrap();
        fake_node(sysfs.path(), "usbtmc0", "0957", "1798", Some("MY111"));

        let mut transport =
            UsbtmcTransport::with_roots(id(0x0957, 0x1798, Some("OTHER")), sysfs.path(), "/dev");
        let res = transport.open(&TimeoutPolicy::default()).await;
        assert!(matches!(res, Err(Error::DeviceNotFound(_))), "{res:?}");

        let mut transport =
            UsbtmcTransport::with_roots(id(1, 2, None), "/nonexistent/usbmisc", "/dev");
        let res = transport.open(&TimeoutPolicy::default()).await;
        assert!(matches!(res, Err(Error::DeviceNotFound(_))), "{res:?}");
    }
}
