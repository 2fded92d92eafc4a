//! Reachability checks for native hosts.
//!
//! There is no browser `online`/`offline` event outside a web view, so the
//! monitor dials the API host on a fixed interval and reports transitions
//! only. The first check always reports.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{ClientConfig, ConfigError};
use crate::connectivity::NetworkStatus;

/// Periodic reachability check.
pub struct NetworkMonitor {
    host: String,
    port: u16,
    interval: Duration,
}

impl NetworkMonitor {
    pub fn new(host: impl Into<String>, port: u16, interval: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            interval,
        }
    }

    /// Monitor the API host of `config`.
    pub fn from_config(config: &ClientConfig) -> Result<Self, ConfigError> {
        let (host, port) = config.api_host_port()?;
        Ok(Self::new(host, port, config.check_interval))
    }

    /// Dial once. A connect that does not finish within the interval counts
    /// as offline.
    pub async fn check(&self) -> NetworkStatus {
        let dial = TcpStream::connect((self.host.as_str(), self.port));
        match tokio::time::timeout(self.interval, dial).await {
            Ok(Ok(_)) => NetworkStatus::Online,
            Ok(Err(e)) => {
                log::debug!("Reachability check of {}:{} failed: {e}", self.host, self.port);
                NetworkStatus::Offline
            }
            Err(_) => NetworkStatus::Offline,
        }
    }

    /// Check forever, sending transitions into `tx`. Stops when the receiver
    /// is dropped.
    pub fn spawn(self, tx: mpsc::Sender<NetworkStatus>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut last: Option<NetworkStatus> = None;
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let status = self.check().await;
                if last == Some(status) {
                    continue;
                }
                log::info!("Network monitor: {status:?}");
                last = Some(status);
                if tx.send(status).await.is_err() {
                    return;
                }
            }
        })
    }
}
