//! Enumeration of locally reachable instruments

use std::{fmt, time::Duration};

use async_trait::async_trait;
use futures::join;
use log::{info, warn};

use crate::{
    config::InterfaceType,
    error::Result,
    transport::{discover_vxi11, list_serial_ports, list_usbtmc_devices},
};

/// Resource string of an instrument found by a scan
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredResource {
    pub interface: InterfaceType,
    pub resource: String,
    pub detail: Option<String>,
}
impl fmt::Display for DiscoveredResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<7} {}", self.interface.as_ref(), self.resource)?;
        if let Some(detail) = &self.detail {
            write!(f, " ({detail})")?;
        }
        Ok(())
    }
}

#[async_trait]
pub trait Scanner: Send + Sync {
    async fn scan(&self) -> Result<Vec<DiscoveredResource>>;
}

/// Scans serial ports, `usbtmc` devices and VXI-11 hosts on the local subnet
pub struct LocalScanner {
    /// How long to wait for VXI-11 broadcast replies
    pub vxi11_timeout: Duration,
}
impl Default for LocalScanner {
    fn default() -> Self {
        Self {
            vxi11_timeout: Duration::from_secs(1),
        }
    }
}
#[async_trait]
impl Scanner for LocalScanner {
    async fn scan(&self) -> Result<Vec<DiscoveredResource>> {
        let mut found = vec![];

        let (usbtmc, vxi11) = join!(list_usbtmc_devices(), discover_vxi11(self.vxi11_timeout));

        /* One failing mechanism does not hide the others */
        match list_serial_ports() {
            Ok(ports) => found.extend(ports),
            Err(e) => warn!("Serial port enumeration failed: {e}"),
        }
        match usbtmc {
            Ok(devices) => found.extend(devices),
            Err(e) => warn!("usbtmc enumeration failed: {e}"),
        }
        match vxi11 {
            Ok(hosts) => found.extend(hosts),
            Err(e) => warn!("VXI-11 discovery failed: {e}"),
        }

        info!("Scan found {} resources", found.len());
        Ok(found)
    }
}

/// Human readable listing, one resource per line
pub fn format_listing(resources: &[DiscoveredResource]) -> String {
    if resources.is_empty() {
        return "No resources found".into();
    }

    resources
        .iter()
        .map(|res| res.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_resources() {
        assert_eq!(format_listing(&[]), "No resources found");

        let resources = [
            DiscoveredResource {
                interface: InterfaceType::Serial,
                resource: "ASRL/dev/ttyUSB0::INSTR".into(),
                detail: Some("USB 0403:6001".into()),
            },
            DiscoveredResource {
                interface: InterfaceType::Vxi11,
                resource: "TCPIP0::10.0.0.7::inst0::INSTR".into(),
                detail: None,
            },
        ];
        assert_eq!(
            format_listing(&resources),
            "serial  ASRL/dev/ttyUSB0::INSTR (USB 0403:6001)\nvxi11   TCPIP0::10.0.0.7::inst0::INSTR"
        );
    }
}
