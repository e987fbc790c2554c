//! Network control backends.
//!
//! Both implementations sit behind [`NetworkBackend`]; which one is used is
//! decided once by [`select_backend`] so tool-specific quirks never leak into
//! the facade.

pub mod nmcli;
pub mod supplicant;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::Settings;
use crate::error::{Result, WifiError};
use crate::exec::CommandExecutor;
use crate::interface;
use crate::models::{
    ConnectOutcome, CurrentConnection, FailureReason, NetworkObservation, SavedNetwork, Security,
};

pub use nmcli::NmcliBackend;
pub use supplicant::SupplicantBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    NetworkManager,
    WpaSupplicant,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::NetworkManager => f.write_str("NetworkManager"),
            BackendKind::WpaSupplicant => f.write_str("wpa_supplicant"),
        }
    }
}

#[async_trait]
pub trait NetworkBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Networks in range, one entry per SSID, strongest first.
    async fn scan(&self) -> Result<Vec<NetworkObservation>>;

    async fn list_saved(&self) -> Result<Vec<SavedNetwork>>;

    async fn current(&self) -> Result<CurrentConnection>;

    /// Requests association with `ssid`.
    ///
    /// Fails with [`WifiError::SecretRequired`] before touching the backend when
    /// `secret` is missing for a non-open network. Backend refusals and stuck
    /// calls come back as [`ConnectOutcome::Failed`], not as errors.
    async fn connect(
        &self,
        ssid: &str,
        secret: Option<&str>,
        security: Security,
    ) -> Result<ConnectOutcome>;

    /// Reconnects using the secret the backend already stores for `ssid`.
    async fn activate_saved(&self, ssid: &str) -> Result<ConnectOutcome>;

    /// Stores `ssid` for later use without associating; `true` when it was new.
    ///
    /// Follows the secret rules of [`NetworkBackend::connect`].
    async fn save(&self, ssid: &str, secret: Option<&str>, security: Security) -> Result<bool>;

    /// Explains why an initiated connect to `ssid` never associated.
    ///
    /// Backends that classify failures while connecting keep the default.
    async fn failure_reason(&self, _ssid: &str) -> Option<FailureReason> {
        None
    }

    /// Drops every saved profile for `ssid`; `false` when there was none.
    async fn forget(&self, ssid: &str) -> Result<bool>;

    async fn disconnect(&self) -> Result<()>;
}

/// Shared guard for [`NetworkBackend::connect`].
pub(crate) fn require_secret(ssid: &str, secret: Option<&str>, security: Security) -> Result<()> {
    if ssid.is_empty() {
        return Err(WifiError::InvalidArgument("SSID must not be empty".into()));
    }
    let has_secret = secret.is_some_and(|s| !s.is_empty());
    if !has_secret && !security.is_open() {
        return Err(WifiError::SecretRequired(ssid.to_string()));
    }
    Ok(())
}

/// Probes which network service is active and builds the matching backend.
///
/// NetworkManager is preferred; the supplicant path is used only when it is
/// not running. Fails with [`WifiError::BackendUnavailable`] when neither is.
pub async fn select_backend(
    exec: Arc<dyn CommandExecutor>,
    settings: &Settings,
) -> Result<Arc<dyn NetworkBackend>> {
    let timeout = settings.command_timeout();

    if network_manager_running(exec.as_ref(), timeout).await {
        match interface::resolve_nmcli_interface(exec.as_ref(), settings.interface.as_deref(), timeout)
            .await
        {
            Ok(iface) => {
                tracing::info!(interface = %iface, "Using NetworkManager backend");
                return Ok(Arc::new(NmcliBackend::new(exec, iface, settings)));
            }
            Err(e) => tracing::warn!(error = %e, "NetworkManager is running but has no usable WiFi device"),
        }
    }

    let iface = match interface::resolve_supplicant_interface(settings.interface.as_deref()) {
        Ok(iface) => iface,
        Err(e) => {
            tracing::error!(error = %e, "No wireless interface present");
            return Err(WifiError::BackendUnavailable);
        }
    };

    if supplicant_running(exec.as_ref(), &iface, timeout).await {
        tracing::info!(interface = %iface, "Using wpa_supplicant backend");
        return Ok(Arc::new(SupplicantBackend::new(exec, iface, settings)));
    }

    tracing::error!("Neither NetworkManager nor wpa_supplicant is running");
    Err(WifiError::BackendUnavailable)
}

async fn service_active(exec: &dyn CommandExecutor, unit: &str, timeout: Duration) -> Option<bool> {
    match exec.run("systemctl", &["is-active", unit], timeout).await {
        Ok(out) => Some(out.success() && out.stdout.trim() == "active"),
        Err(WifiError::ExecutableNotFound(_)) => None,
        Err(e) => {
            tracing::debug!(unit, error = %e, "Service probe failed");
            Some(false)
        }
    }
}

async fn network_manager_running(exec: &dyn CommandExecutor, timeout: Duration) -> bool {
    if let Some(active) = service_active(exec, "NetworkManager", timeout).await {
        return active;
    }

    // No systemd: ask NetworkManager directly.
    match exec.run("nmcli", &["-t", "-f", "RUNNING", "general"], timeout).await {
        Ok(out) => out.success() && out.stdout.trim() == "running",
        Err(_) => false,
    }
}

async fn supplicant_running(exec: &dyn CommandExecutor, iface: &str, timeout: Duration) -> bool {
    if service_active(exec, "wpa_supplicant", timeout).await == Some(true) {
        return true;
    }

    match exec.run("wpa_cli", &["-i", iface, "ping"], timeout).await {
        Ok(out) => out.success() && out.stdout.trim() == "PONG",
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::FakeExecutor;

    fn settings() -> Settings {
        Settings {
            interface: Some("wlan0".into()),
            ..Settings::default()
        }
    }

    #[test]
    fn secret_guard() {
        assert!(require_secret("Harbor-Guest", None, Security::Open).is_ok());
        assert!(require_secret("Harbor-Net", Some("pw"), Security::Wpa2).is_ok());
        assert!(matches!(
            require_secret("Harbor-Net", None, Security::Wpa2),
            Err(WifiError::SecretRequired(_))
        ));
        assert!(matches!(
            require_secret("Harbor-Net", Some(""), Security::Unknown),
            Err(WifiError::SecretRequired(_))
        ));
        assert!(matches!(
            require_secret("", Some("pw"), Security::Wpa2),
            Err(WifiError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn prefers_network_manager() {
        let exec = Arc::new(
            FakeExecutor::new()
                .on("systemctl is-active NetworkManager", "active\n")
                .on("nmcli -t -f DEVICE,TYPE,STATE device", "wlan0:wifi:connected\n"),
        );
        let backend = select_backend(exec, &settings()).await.unwrap();
        assert_eq!(backend.kind(), BackendKind::NetworkManager);
    }

    #[tokio::test]
    async fn falls_back_to_supplicant() {
        let exec = Arc::new(
            FakeExecutor::new()
                .on_failure("systemctl is-active NetworkManager", 3, "")
                .on("systemctl is-active wpa_supplicant", "active\n"),
        );
        let backend = select_backend(exec, &settings()).await.unwrap();
        assert_eq!(backend.kind(), BackendKind::WpaSupplicant);
    }

    #[tokio::test]
    async fn reports_unavailable_when_nothing_runs() {
        let exec = Arc::new(
            FakeExecutor::new()
                .on_failure("systemctl is-active", 3, "inactive")
                .on_failure("wpa_cli", 255, "Failed to connect to non-global ctrl_ifname"),
        );
        assert!(matches!(
            select_backend(exec, &settings()).await,
            Err(WifiError::BackendUnavailable)
        ));
    }
}
