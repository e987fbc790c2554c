//! Primary backend driving NetworkManager through `nmcli`.
//!
//! # Commands Executed
//! ```bash
//! nmcli device wifi rescan ifname <iface>
//! nmcli -t -f IN-USE,SSID,SIGNAL,SECURITY device wifi list ifname <iface> --rescan no
//! nmcli -t -f NAME,TYPE connection show
//! nmcli --wait <secs> device wifi connect <ssid> [password <secret>] ifname <iface>
//! nmcli --wait <secs> connection up id <name> ifname <iface>
//! nmcli connection add type wifi con-name <ssid> ifname <iface> ssid <ssid> [wifi-sec.key-mgmt <mgmt> wifi-sec.psk <secret>]
//! nmcli connection modify id <name> [wifi-sec.key-mgmt <mgmt> wifi-sec.psk <secret>]
//! nmcli connection delete id <name>
//! nmcli device disconnect <iface>
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{BackendKind, NetworkBackend, require_secret};
use crate::config::Settings;
use crate::error::{Result, WifiError};
use crate::exec::{CommandExecutor, CommandOutput};
use crate::models::{
    ConnectOutcome, CurrentConnection, FailureReason, NetworkObservation, SavedNetwork, Security,
};
use crate::parser::{self, ProfileDetails};

/// Extra time granted to the process beyond nmcli's own `--wait`.
const WAIT_GRACE: Duration = Duration::from_secs(5);

pub struct NmcliBackend {
    exec: Arc<dyn CommandExecutor>,
    interface: String,
    command_timeout: Duration,
    connect_timeout: Duration,
    scan_settle: Duration,
}

impl NmcliBackend {
    pub fn new(exec: Arc<dyn CommandExecutor>, interface: String, settings: &Settings) -> Self {
        Self {
            exec,
            interface,
            command_timeout: settings.command_timeout(),
            connect_timeout: settings.connect_timeout(),
            scan_settle: settings.scan_settle(),
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    async fn nmcli(&self, args: &[&str]) -> Result<CommandOutput> {
        self.exec.run("nmcli", args, self.command_timeout).await
    }

    async fn nmcli_checked(&self, args: &[&str]) -> Result<String> {
        let output = self.nmcli(args).await?;
        if !output.success() {
            return Err(WifiError::Backend(output.error_text()));
        }
        Ok(output.stdout)
    }

    async fn visible_networks(&self) -> Result<Vec<NetworkObservation>> {
        let stdout = self
            .nmcli_checked(&[
                "-t",
                "-f",
                "IN-USE,SSID,SIGNAL,SECURITY",
                "device",
                "wifi",
                "list",
                "ifname",
                self.interface.as_str(),
                "--rescan",
                "no",
            ])
            .await?;
        Ok(parser::parse_nmcli_scan(&stdout))
    }

    /// Saved Wi-Fi profiles as `(profile name, details)`.
    async fn profiles(&self) -> Result<Vec<(String, ProfileDetails)>> {
        let stdout = self
            .nmcli_checked(&["-t", "-f", "NAME,TYPE", "connection", "show"])
            .await?;

        let mut profiles = Vec::new();
        for name in parser::parse_wifi_profiles(&stdout) {
            let details = match self
                .nmcli(&[
                    "-t",
                    "-f",
                    "802-11-wireless.ssid,802-11-wireless-security.key-mgmt",
                    "connection",
                    "show",
                    "id",
                    name.as_str(),
                ])
                .await
            {
                Ok(out) if out.success() => parser::parse_profile_details(&out.stdout),
                Ok(out) => {
                    tracing::debug!(profile = %name, error = %out.error_text(), "Could not read profile details");
                    ProfileDetails::default()
                }
                Err(e) => {
                    tracing::debug!(profile = %name, error = %e, "Could not read profile details");
                    ProfileDetails::default()
                }
            };
            profiles.push((name, details));
        }

        Ok(profiles)
    }

    async fn profile_names_for(&self, ssid: &str) -> Result<Vec<String>> {
        Ok(self
            .profiles()
            .await?
            .into_iter()
            .filter(|(name, details)| details.ssid.as_deref().unwrap_or(name) == ssid)
            .map(|(name, _)| name)
            .collect())
    }

    async fn run_connect(&self, ssid: &str, secret: Option<&str>) -> Result<CommandOutput> {
        let wait = self.connect_timeout.as_secs().to_string();
        let mut args = vec!["--wait", wait.as_str(), "device", "wifi", "connect", ssid];
        if let Some(secret) = secret {
            args.extend(["password", secret]);
        }
        args.extend(["ifname", self.interface.as_str()]);

        self.exec
            .run("nmcli", &args, self.connect_timeout + WAIT_GRACE)
            .await
    }
}

#[async_trait]
impl NetworkBackend for NmcliBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::NetworkManager
    }

    async fn scan(&self) -> Result<Vec<NetworkObservation>> {
        tracing::info!(interface = %self.interface, "Scanning for WiFi networks");

        // Rescan can fail if the radio is already scanning; the cached list is still usable.
        if let Err(e) = self
            .nmcli(&["device", "wifi", "rescan", "ifname", self.interface.as_str()])
            .await
        {
            tracing::debug!(error = %e, "Rescan request failed");
        }
        tokio::time::sleep(self.scan_settle).await;

        let networks = self.visible_networks().await?;
        tracing::info!(count = networks.len(), "Found WiFi networks");
        Ok(networks)
    }

    async fn list_saved(&self) -> Result<Vec<SavedNetwork>> {
        Ok(self
            .profiles()
            .await?
            .into_iter()
            .map(|(name, details)| {
                SavedNetwork::new(
                    details.ssid.unwrap_or(name),
                    details.security,
                    details.has_stored_secret,
                )
            })
            .collect())
    }

    async fn current(&self) -> Result<CurrentConnection> {
        // With the radio off the list fails, but the device can still report its state.
        let active = match self.visible_networks().await {
            Ok(networks) => networks.into_iter().find(|n| n.in_use),
            Err(e) => {
                tracing::debug!(error = %e, "WiFi list unavailable, using device state only");
                None
            }
        };

        let device = match self.nmcli(&["-t", "device", "show", self.interface.as_str()]).await {
            Ok(out) if out.success() => parser::parse_device_show(&out.stdout),
            _ => parser::DeviceDetails::default(),
        };

        let ssid = match &active {
            Some(network) => Some(network.ssid.clone()),
            None if device.is_activated() => device.connection.clone(),
            None => None,
        };

        if ssid.is_none() {
            return Ok(CurrentConnection::default());
        }

        Ok(CurrentConnection {
            ssid,
            ip_address: device.ip_address,
            signal_strength: active.and_then(|n| n.signal_strength),
        })
    }

    async fn connect(
        &self,
        ssid: &str,
        secret: Option<&str>,
        security: Security,
    ) -> Result<ConnectOutcome> {
        require_secret(ssid, secret, security)?;

        if self.current().await?.is_connected_to(ssid) {
            tracing::info!(ssid = %ssid, "Already connected");
            return Ok(ConnectOutcome::AlreadyConnected);
        }

        let secret = if security.is_open() { None } else { secret };

        tracing::info!(interface = %self.interface, ssid = %ssid, "Connecting to WiFi network");
        let output = match self.run_connect(ssid, secret).await {
            Ok(output) => output,
            Err(WifiError::ExecutionTimeout { .. }) => {
                return Ok(ConnectOutcome::Failed(FailureReason::Timeout));
            }
            Err(e) => return Err(e),
        };
        if output.success() {
            return Ok(ConnectOutcome::Initiated);
        }

        // Reported as is; retrying is left to the caller.
        let error = output.error_text();
        let reason = parser::classify_failure(&error);

        tracing::warn!(ssid = %ssid, ?reason, error = %error, "WiFi connection attempt failed");
        Ok(ConnectOutcome::Failed(reason))
    }

    async fn activate_saved(&self, ssid: &str) -> Result<ConnectOutcome> {
        if self.current().await?.is_connected_to(ssid) {
            return Ok(ConnectOutcome::AlreadyConnected);
        }

        let Some(name) = self.profile_names_for(ssid).await?.into_iter().next() else {
            return Ok(ConnectOutcome::Failed(FailureReason::NetworkNotFound));
        };

        tracing::info!(ssid = %ssid, profile = %name, "Activating saved profile");
        let wait = self.connect_timeout.as_secs().to_string();
        let args = [
            "--wait",
            wait.as_str(),
            "connection",
            "up",
            "id",
            name.as_str(),
            "ifname",
            self.interface.as_str(),
        ];

        match self
            .exec
            .run("nmcli", &args, self.connect_timeout + WAIT_GRACE)
            .await
        {
            Ok(out) if out.success() => Ok(ConnectOutcome::Initiated),
            Ok(out) => {
                let reason = parser::classify_failure(&out.error_text());
                tracing::warn!(ssid = %ssid, ?reason, "Saved profile activation failed");
                Ok(ConnectOutcome::Failed(reason))
            }
            Err(WifiError::ExecutionTimeout { .. }) => Ok(ConnectOutcome::Failed(FailureReason::Timeout)),
            Err(e) => Err(e),
        }
    }

    async fn save(&self, ssid: &str, secret: Option<&str>, security: Security) -> Result<bool> {
        require_secret(ssid, secret, security)?;

        let mut security_args: Vec<&str> = Vec::new();
        if let Some(secret) = secret.filter(|_| !security.is_open()) {
            let key_mgmt = if security == Security::Wpa3 { "sae" } else { "wpa-psk" };
            security_args.extend(["wifi-sec.key-mgmt", key_mgmt, "wifi-sec.psk", secret]);
        }

        if let Some(name) = self.profile_names_for(ssid).await?.into_iter().next() {
            if !security_args.is_empty() {
                let mut args = vec!["connection", "modify", "id", name.as_str()];
                args.extend(security_args);
                self.nmcli_checked(&args).await?;
            }
            tracing::info!(ssid = %ssid, profile = %name, "Updated saved profile");
            return Ok(false);
        }

        let mut args = vec![
            "connection",
            "add",
            "type",
            "wifi",
            "con-name",
            ssid,
            "ifname",
            self.interface.as_str(),
            "ssid",
            ssid,
        ];
        args.extend(security_args);
        self.nmcli_checked(&args).await?;
        tracing::info!(ssid = %ssid, "Added saved profile");
        Ok(true)
    }

    async fn forget(&self, ssid: &str) -> Result<bool> {
        let names = self.profile_names_for(ssid).await?;
        if names.is_empty() {
            return Ok(false);
        }

        for name in &names {
            self.nmcli_checked(&["connection", "delete", "id", name.as_str()]).await?;
            tracing::info!(ssid = %ssid, profile = %name, "Deleted connection profile");
        }
        Ok(true)
    }

    async fn disconnect(&self) -> Result<()> {
        let output = self
            .nmcli(&["device", "disconnect", self.interface.as_str()])
            .await?;
        if output.success() || output.error_text().contains("not active") {
            return Ok(());
        }
        Err(WifiError::Backend(output.error_text()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::FakeExecutor;

    const LIST: &str = "nmcli -t -f IN-USE,SSID,SIGNAL,SECURITY device wifi list";
    const SHOW: &str = "nmcli -t device show wlan0";
    const CONNECT: &str = "nmcli --wait 45 device wifi connect Harbor-Net";

    fn backend(exec: FakeExecutor) -> (Arc<FakeExecutor>, NmcliBackend) {
        let exec = Arc::new(exec);
        let settings = Settings {
            scan_settle_ms: 0,
            ..Settings::default()
        };
        let backend = NmcliBackend::new(exec.clone(), "wlan0".into(), &settings);
        (exec, backend)
    }

    fn idle(exec: FakeExecutor) -> FakeExecutor {
        exec.on(LIST, " :Harbor-Net:70:WPA2\n :Harbor-Guest:40:--\n")
            .on(SHOW, "GENERAL.STATE:30 (disconnected)\nGENERAL.CONNECTION:--\n")
    }

    #[tokio::test]
    async fn scan_dedupes_rows() {
        let (_, nm) = backend(FakeExecutor::new().on(
            LIST,
            " :Harbor-Guest:42:--\n :Harbor-Guest:67:--\n*:Harbor-Net:80:WPA2\n",
        ));
        let networks = nm.scan().await.unwrap();
        assert_eq!(networks.len(), 2);
        assert_eq!(networks[1].ssid, "Harbor-Guest");
        assert_eq!(networks[1].signal_strength, Some(67));
    }

    #[tokio::test]
    async fn missing_secret_fails_before_any_command() {
        let (exec, nm) = backend(idle(FakeExecutor::new()));
        let err = nm.connect("Harbor-Net", None, Security::Wpa2).await.unwrap_err();
        assert!(matches!(err, WifiError::SecretRequired(_)));
        assert!(exec.calls().is_empty());
    }

    #[tokio::test]
    async fn auth_failure_is_classified() {
        let (_, nm) = backend(idle(FakeExecutor::new()).on_failure(
            CONNECT,
            4,
            "Error: Connection activation failed: Secrets were required, but not provided.",
        ));
        let outcome = nm.connect("Harbor-Net", Some("wrong"), Security::Wpa2).await.unwrap();
        assert_eq!(outcome, ConnectOutcome::Failed(FailureReason::AuthFailure));
    }

    #[tokio::test]
    async fn unclassified_failure_is_not_retried() {
        let (exec, nm) = backend(
            idle(FakeExecutor::new())
                .on_failure(CONNECT, 4, "Error: 802-11-wireless-security.key-mgmt: property is missing.")
                .on("nmcli connection delete id Harbor-Net", ""),
        );
        let outcome = nm.connect("Harbor-Net", Some("new-secret"), Security::Wpa2).await.unwrap();
        assert_eq!(outcome, ConnectOutcome::Failed(FailureReason::Unknown));
        assert!(!exec.called("nmcli connection delete"));
        let attempts = exec.calls().iter().filter(|c| c.starts_with(CONNECT)).count();
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn open_network_connects_without_password() {
        let (exec, nm) = backend(
            idle(FakeExecutor::new())
                .on("nmcli --wait 45 device wifi connect Harbor-Guest", "successfully activated"),
        );
        let outcome = nm.connect("Harbor-Guest", None, Security::Open).await.unwrap();
        assert_eq!(outcome, ConnectOutcome::Initiated);
        assert!(exec.called("nmcli --wait 45 device wifi connect Harbor-Guest ifname wlan0"));
    }

    #[tokio::test]
    async fn stuck_connect_is_a_timeout() {
        let (_, nm) = backend(idle(FakeExecutor::new()).on_timeout(CONNECT));
        let outcome = nm.connect("Harbor-Net", Some("pw"), Security::Wpa2).await.unwrap();
        assert_eq!(outcome, ConnectOutcome::Failed(FailureReason::Timeout));
    }

    #[tokio::test]
    async fn connect_to_current_network_is_idempotent() {
        let (exec, nm) = backend(
            FakeExecutor::new()
                .on(LIST, "*:Harbor-Net:70:WPA2\n")
                .on(SHOW, "GENERAL.STATE:100 (connected)\nIP4.ADDRESS[1]:10.0.0.7/24\n"),
        );
        let outcome = nm.connect("Harbor-Net", Some("pw"), Security::Wpa2).await.unwrap();
        assert_eq!(outcome, ConnectOutcome::AlreadyConnected);
        assert!(!exec.called("nmcli --wait"));
    }

    #[tokio::test]
    async fn current_reports_ssid_ip_and_signal() {
        let (_, nm) = backend(
            FakeExecutor::new()
                .on(LIST, " :Other:90:WPA2\n*:Harbor-Net:70:WPA2\n")
                .on(SHOW, "GENERAL.STATE:100 (connected)\nGENERAL.CONNECTION:Harbor-Net\nIP4.ADDRESS[1]:10.0.0.7/24\n"),
        );
        let current = nm.current().await.unwrap();
        assert_eq!(current.ssid.as_deref(), Some("Harbor-Net"));
        assert_eq!(current.ip_address.as_deref(), Some("10.0.0.7"));
        assert_eq!(current.signal_strength, Some(70));

        let (_, nm) = backend(idle(FakeExecutor::new()));
        assert_eq!(nm.current().await.unwrap(), CurrentConnection::default());
    }

    #[tokio::test]
    async fn current_survives_radio_off() {
        let (_, nm) = backend(
            FakeExecutor::new()
                .on_failure(LIST, 10, "Error: Wi-Fi radio is disabled.")
                .on(SHOW, "GENERAL.STATE:20 (unavailable)\nGENERAL.CONNECTION:--\n"),
        );
        assert_eq!(nm.current().await.unwrap(), CurrentConnection::default());

        let (_, nm) = backend(
            FakeExecutor::new()
                .on_failure(LIST, 10, "Error: Wi-Fi radio is disabled.")
                .on(SHOW, "GENERAL.STATE:100 (connected)\nGENERAL.CONNECTION:Harbor-Net\nIP4.ADDRESS[1]:10.0.0.7/24\n"),
        );
        let current = nm.current().await.unwrap();
        assert_eq!(current.ssid.as_deref(), Some("Harbor-Net"));
        assert_eq!(current.signal_strength, None);
    }

    fn with_profiles(exec: FakeExecutor) -> FakeExecutor {
        exec.on(
            "nmcli -t -f NAME,TYPE connection show",
            "Wired connection 1:802-3-ethernet\nHarbor-Net:802-11-wireless\nGuest profile:802-11-wireless\n",
        )
        .on(
            "nmcli -t -f 802-11-wireless.ssid,802-11-wireless-security.key-mgmt connection show id Harbor-Net",
            "802-11-wireless.ssid:Harbor-Net\n802-11-wireless-security.key-mgmt:wpa-psk\n",
        )
        .on(
            "nmcli -t -f 802-11-wireless.ssid,802-11-wireless-security.key-mgmt connection show id Guest profile",
            "802-11-wireless.ssid:Harbor-Guest\n",
        )
    }

    #[tokio::test]
    async fn saved_profiles_map_to_ssids() {
        let (_, nm) = backend(with_profiles(FakeExecutor::new()));
        let saved = nm.list_saved().await.unwrap();
        assert_eq!(
            saved,
            vec![
                SavedNetwork::new("Harbor-Net", Security::Wpa2, true),
                SavedNetwork::new("Harbor-Guest", Security::Open, false),
            ]
        );
    }

    #[tokio::test]
    async fn forget_deletes_profile_by_ssid() {
        let (exec, nm) = backend(
            with_profiles(FakeExecutor::new()).on("nmcli connection delete id Guest profile", ""),
        );
        assert!(nm.forget("Harbor-Guest").await.unwrap());
        assert!(exec.called("nmcli connection delete id Guest profile"));
        assert!(!nm.forget("Nowhere").await.unwrap());
    }

    #[tokio::test]
    async fn save_adds_or_updates_profile() {
        let (exec, nm) = backend(
            with_profiles(FakeExecutor::new())
                .on("nmcli connection add", "Connection 'Marina' successfully added.")
                .on("nmcli connection modify id Harbor-Net", ""),
        );

        assert!(nm.save("Marina", Some("seaside-pass"), Security::Wpa3).await.unwrap());
        assert!(exec.called(
            "nmcli connection add type wifi con-name Marina ifname wlan0 ssid Marina \
             wifi-sec.key-mgmt sae wifi-sec.psk seaside-pass"
        ));

        assert!(!nm.save("Harbor-Net", Some("new-secret"), Security::Wpa2).await.unwrap());
        assert!(exec.called(
            "nmcli connection modify id Harbor-Net wifi-sec.key-mgmt wpa-psk wifi-sec.psk new-secret"
        ));

        let err = nm.save("Marina", None, Security::Wpa2).await.unwrap_err();
        assert!(matches!(err, WifiError::SecretRequired(_)));
    }

    #[tokio::test]
    async fn saved_profile_is_activated() {
        let (exec, nm) = backend(
            idle(with_profiles(FakeExecutor::new()))
                .on("nmcli --wait 45 connection up id Harbor-Net", "Connection successfully activated"),
        );
        let outcome = nm.activate_saved("Harbor-Net").await.unwrap();
        assert_eq!(outcome, ConnectOutcome::Initiated);
        assert!(exec.called("nmcli --wait 45 connection up id Harbor-Net ifname wlan0"));

        let outcome = nm.activate_saved("Nowhere").await.unwrap();
        assert_eq!(outcome, ConnectOutcome::Failed(FailureReason::NetworkNotFound));
    }
}
