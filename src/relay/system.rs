//! Relay-wide claim and scan state for `System` requests

use std::sync::atomic::{AtomicBool, Ordering};

use log::{info, warn};

use super::messages::{SystemAction, SystemResponse};
use crate::scan::{Scanner, format_listing};

#[derive(Debug, Default)]
pub struct SystemState {
    claimed: AtomicBool,
    scanning: AtomicBool,
}
impl SystemState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::SeqCst)
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    fn status(&self) -> SystemAction {
        if self.is_claimed() || self.is_scanning() {
            SystemAction::Busy
        } else {
            SystemAction::Idle
        }
    }

    pub async fn handle(&self, action: i32, scanner: &dyn Scanner) -> SystemResponse {
        let mut scan_info = String::new();

        let command = match SystemAction::try_from(action).ok() {
            Some(SystemAction::Quer) => SystemAction::Succ,
            Some(SystemAction::Conn) => {
                match self
                    .claimed
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                {
                    Ok(_) => {
                        info!("Relay claimed");
                        SystemAction::Succ
                    }
                    Err(_) => SystemAction::Fail,
                }
            }
            Some(SystemAction::Fcon) => {
                if self.claimed.swap(true, Ordering::SeqCst) {
                    warn!("Relay claim forced");
                }
                SystemAction::Succ
            }
            Some(SystemAction::Disc) => {
                self.claimed.store(false, Ordering::SeqCst);
                info!("Relay released");
                SystemAction::Succ
            }
            Some(SystemAction::Scan) => match self.scan(scanner).await {
                Some(info) => {
                    scan_info = info;
                    SystemAction::Succ
                }
                None => SystemAction::Fail,
            },
            _ => {
                warn!("Unsupported system action {action}");
                SystemAction::Fail
            }
        };

        SystemResponse {
            response_status: self.status() as i32,
            response_command: command as i32,
            scan_info,
        }
    }

    /// Listing of discovered resources, `None` if a scan is already running
    /// or the scan failed
    async fn scan(&self, scanner: &dyn Scanner) -> Option<String> {
        if self
            .scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Scan requested while another is running");
            return None;
        }
        let _guard = ScanGuard(&self.scanning);

        match scanner.scan().await {
            Ok(resources) => Some(format_listing(&resources)),
            Err(e) => {
                warn!("Scan failed: {e}");
                None
            }
        }
    }
}

/// Clears the scanning flag even if the request task is dropped mid-scan
struct ScanGuard<'a>(&'a AtomicBool);
impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::{
        config::InterfaceType,
        error::{Error, Result},
        scan::DiscoveredResource,
    };

    struct FixedScanner {
        gate: Option<Arc<Notify>>,
        fail: bool,
    }
    #[async_trait]
    impl Scanner for FixedScanner {
        async fn scan(&self) -> Result<Vec<DiscoveredResource>> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail {
                return Err(Error::Io(std::io::Error::other("no sysfs")));
            }
            Ok(vec![DiscoveredResource {
                interface: InterfaceType::Socket,
                resource: "TCPIP0::10.0.0.9::inst0::INSTR".into(),
                detail: None,
            }])
        }
    }

    const IDLE: i32 = SystemAction::Idle as i32;
    const BUSY: i32 = SystemAction::Busy as i32;
    const SUCC: i32 = SystemAction::Succ as i32;
    const FAIL: i32 = SystemAction::Fail as i32;

    fn scanner() -> FixedScanner {
        FixedScanner {
            gate: None,
            fail: false,
        }
    }

    #[tokio::test]
    async fn claim_and_release() {
        let state = SystemState::new();
        let scanner = scanner();

        let resp = state.handle(SystemAction::Quer as i32, &scanner).await;
        assert_eq!((resp.response_status, resp.response_command), (IDLE, SUCC));

        let resp = state.handle(SystemAction::Conn as i32, &scanner).await;
        assert_eq!((resp.response_status, resp.response_command), (BUSY, SUCC));

        /* Already claimed */
        let resp = state.handle(SystemAction::Conn as i32, &scanner).await;
        assert_eq!((resp.response_status, resp.response_command), (BUSY, FAIL));

        let resp = state.handle(SystemAction::Fcon as i32, &scanner).await;
        assert_eq!((resp.response_status, resp.response_command), (BUSY, SUCC));

        let resp = state.handle(SystemAction::Disc as i32, &scanner).await;
        assert_eq!((resp.response_status, resp.response_command), (IDLE, SUCC));
        assert!(!state.is_claimed());
    }

    #[tokio::test]
    async fn status_values_are_not_actions() {
        let state = SystemState::new();
        for action in [SystemAction::Succ, SystemAction::Idle, SystemAction::Busy] {
            let resp = state.handle(action as i32, &scanner()).await;
            assert_eq!(resp.response_command, FAIL);
        }
        let resp = state.handle(42, &scanner()).await;
        assert_eq!(resp.response_command, FAIL);
    }

    #[tokio::test]
    async fn scan_reports_listing() {
        let state = SystemState::new();
        let resp = state.handle(SystemAction::Scan as i32, &scanner()).await;
        assert_eq!(resp.response_command, SUCC);
        assert_eq!(resp.response_status, IDLE);
        assert!(resp.scan_info.contains("TCPIP0::10.0.0.9::inst0::INSTR"));

        let failing = FixedScanner {
            gate: None,
            fail: true,
        };
        let resp = state.handle(SystemAction::Scan as i32, &failing).await;
        assert_eq!(resp.response_command, FAIL);
        assert!(!state.is_scanning());
    }

    #[tokio::test]
    async fn concurrent_scan_fails() {
        let state = Arc::new(SystemState::new());
        let gate = Arc::new(Notify::new());
        let slow = Arc::new(FixedScanner {
            gate: Some(gate.clone()),
            fail: false,
        });

        let first = {
            let state = state.clone();
            let slow = slow.clone();
            tokio::spawn(
                async move { state.handle(SystemAction::Scan as i32, slow.as_ref()).await },
            )
        };
        while !state.is_scanning() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let quer = state.handle(SystemAction::Quer as i32, &scanner()).await;
        assert_eq!(quer.response_status, BUSY);
        let second = state.handle(SystemAction::Scan as i32, &scanner()).await;
        assert_eq!(second.response_command, FAIL);

        gate.notify_one();
        let first = first.await.unwrap();
        assert_eq!(first.response_command, SUCC);
        assert!(!state.is_scanning());
    }
}
