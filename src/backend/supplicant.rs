//! Fallback backend for hosts without NetworkManager.
//!
//! Saved networks live as `network={...}` blocks in the wpa_supplicant
//! configuration file. Connecting rewrites that file atomically, asks the
//! daemon to reload it and selects the target network.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{BackendKind, NetworkBackend, require_secret};
use crate::config::Settings;
use crate::error::{Result, WifiError};
use crate::exec::{CommandExecutor, CommandOutput};
use crate::models::{
    ConnectOutcome, CurrentConnection, FailureReason, NetworkObservation, SavedNetwork, Security,
};
use crate::parser;
use crate::store::write_atomic;

const DEFAULT_HEADER: &[&str] = &[
    "ctrl_interface=DIR=/var/run/wpa_supplicant GROUP=netdev",
    "update_config=1",
];

#[derive(Debug, Clone, PartialEq, Eq)]
struct NetworkBlock {
    ssid: String,
    lines: Vec<String>,
}

impl NetworkBlock {
    fn value(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| {
            let (k, v) = line.split_once('=')?;
            (k.trim() == key).then(|| v.trim())
        })
    }

    fn saved_network(&self) -> SavedNetwork {
        let key_mgmt = self.value("key_mgmt").map(str::to_ascii_uppercase);
        let has_psk = self.value("psk").is_some() || self.value("sae_password").is_some();
        let has_wep = self.value("wep_key0").is_some();

        let (security, has_stored_secret) = match key_mgmt.as_deref() {
            Some("NONE") if has_wep => (Security::Unknown, true),
            Some("NONE") => (Security::Open, false),
            Some(k) if k.contains("SAE") => (Security::Wpa3, has_psk),
            _ if has_psk => match self.value("proto").map(str::to_ascii_uppercase).as_deref() {
                Some("WPA") => (Security::Wpa, true),
                _ => (Security::Wpa2, true),
            },
            _ => (Security::Unknown, false),
        };

        SavedNetwork::new(self.ssid.clone(), security, has_stored_secret)
    }
}

/// In-memory view of a wpa_supplicant configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SupplicantConfig {
    header: Vec<String>,
    blocks: Vec<NetworkBlock>,
}

impl Default for SupplicantConfig {
    fn default() -> Self {
        Self {
            header: DEFAULT_HEADER.iter().map(|s| s.to_string()).collect(),
            blocks: Vec::new(),
        }
    }
}

impl SupplicantConfig {
    pub(crate) fn parse(text: &str) -> Self {
        let mut header = Vec::new();
        let mut blocks = Vec::new();
        let mut current: Option<Vec<String>> = None;

        for line in text.lines() {
            let trimmed = line.trim();
            if current.is_some() && trimmed == "}" {
                let lines = current.take().unwrap_or_default();
                if let Some(ssid) = block_ssid(&lines) {
                    blocks.push(NetworkBlock { ssid, lines });
                } else {
                    tracing::debug!("Dropping network block without ssid");
                }
            } else if let Some(lines) = current.as_mut() {
                if !trimmed.is_empty() {
                    lines.push(trimmed.to_string());
                }
            } else if trimmed.starts_with("network={") {
                current = Some(Vec::new());
            } else {
                header.push(line.to_string());
            }
        }

        while header.last().is_some_and(|l| l.trim().is_empty()) {
            header.pop();
        }

        Self { header, blocks }
    }

    pub(crate) fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.header {
            out.push_str(line);
            out.push('\n');
        }
        for block in &self.blocks {
            out.push_str("\nnetwork={\n");
            for line in &block.lines {
                out.push('\t');
                out.push_str(line);
                out.push('\n');
            }
            out.push_str("}\n");
        }
        out
    }

    pub(crate) fn networks(&self) -> Vec<SavedNetwork> {
        self.blocks.iter().map(NetworkBlock::saved_network).collect()
    }

    pub(crate) fn contains(&self, ssid: &str) -> bool {
        self.blocks.iter().any(|b| b.ssid == ssid)
    }

    /// Replaces (or appends) the block for `ssid`.
    pub(crate) fn upsert(&mut self, ssid: &str, secret: Option<&str>, security: Security) {
        let mut lines = vec![format!("ssid={}", encode_ssid(ssid))];
        match (security, secret) {
            (Security::Open, _) | (_, None) => lines.push("key_mgmt=NONE".to_string()),
            (Security::Wpa3, Some(secret)) => {
                lines.push("key_mgmt=SAE".to_string());
                lines.push(format!("psk=\"{secret}\""));
            }
            (_, Some(secret)) => lines.push(format!("psk=\"{secret}\"")),
        }

        let block = NetworkBlock {
            ssid: ssid.to_string(),
            lines,
        };
        match self.blocks.iter_mut().find(|b| b.ssid == ssid) {
            Some(existing) => *existing = block,
            None => self.blocks.push(block),
        }
    }

    pub(crate) fn remove(&mut self, ssid: &str) -> bool {
        let before = self.blocks.len();
        self.blocks.retain(|b| b.ssid != ssid);
        self.blocks.len() != before
    }
}

fn block_ssid(lines: &[String]) -> Option<String> {
    let raw = lines
        .iter()
        .find_map(|l| l.strip_prefix("ssid="))?
        .trim();

    if let Some(quoted) = raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
        return Some(quoted.to_string());
    }
    decode_hex(raw).map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

/// Quoted form for plain printable SSIDs, hex otherwise.
fn encode_ssid(ssid: &str) -> String {
    let plain = ssid.bytes().all(|b| (0x20..0x7f).contains(&b) && b != b'"');
    if plain {
        format!("\"{ssid}\"")
    } else {
        ssid.bytes().map(|b| format!("{b:02x}")).collect()
    }
}

fn decode_hex(raw: &str) -> Option<Vec<u8>> {
    if raw.is_empty() || raw.len() % 2 != 0 {
        return None;
    }
    (0..raw.len())
        .step_by(2)
        .map(|i| raw.get(i..i + 2).and_then(|pair| u8::from_str_radix(pair, 16).ok()))
        .collect()
}

/// A passphrase must be 8-63 printable ASCII characters and must not break the quoted value.
fn validate_passphrase(secret: &str) -> Result<()> {
    let printable = secret.bytes().all(|b| (0x20..0x7f).contains(&b) && b != b'"');
    if !printable || !(8..=63).contains(&secret.len()) {
        return Err(WifiError::InvalidArgument(
            "passphrase must be 8-63 printable characters without quotes".into(),
        ));
    }
    Ok(())
}

pub struct SupplicantBackend {
    exec: Arc<dyn CommandExecutor>,
    interface: String,
    config_path: PathBuf,
    command_timeout: Duration,
    scan_settle: Duration,
    edit_lock: Mutex<()>,
}

impl SupplicantBackend {
    pub fn new(exec: Arc<dyn CommandExecutor>, interface: String, settings: &Settings) -> Self {
        Self {
            exec,
            interface,
            config_path: settings.supplicant_config.clone(),
            command_timeout: settings.command_timeout(),
            scan_settle: settings.scan_settle(),
            edit_lock: Mutex::new(()),
        }
    }

    async fn wpa_cli(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut full = vec!["-i", self.interface.as_str()];
        full.extend_from_slice(args);
        self.exec.run("wpa_cli", &full, self.command_timeout).await
    }

    /// wpa_cli exits 0 even when the daemon answers `FAIL`.
    async fn wpa_cli_checked(&self, args: &[&str]) -> Result<String> {
        let output = self.wpa_cli(args).await?;
        if !output.success() || output.stdout.trim() == "FAIL" {
            return Err(WifiError::Backend(format!(
                "wpa_cli {}: {}",
                args.join(" "),
                output.error_text()
            )));
        }
        Ok(output.stdout)
    }

    fn read_config(&self) -> Result<SupplicantConfig> {
        match fs::read_to_string(&self.config_path) {
            Ok(text) => Ok(SupplicantConfig::parse(&text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(SupplicantConfig::default()),
            Err(e) => Err(WifiError::StorageReadFailure {
                path: self.config_path.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn write_config(&self, config: &SupplicantConfig) -> Result<()> {
        write_atomic(&self.config_path, &config.render())
    }

    /// Reloads the file and selects `ssid`.
    async fn select(&self, ssid: &str) -> Result<ConnectOutcome> {
        match self.try_select(ssid).await {
            Err(WifiError::ExecutionTimeout { .. }) => Ok(ConnectOutcome::Failed(FailureReason::Timeout)),
            other => other,
        }
    }

    async fn try_select(&self, ssid: &str) -> Result<ConnectOutcome> {
        self.wpa_cli_checked(&["reconfigure"]).await?;
        let listed = self.wpa_cli_checked(&["list_networks"]).await?;
        let Some(entry) = parser::parse_list_networks(&listed)
            .into_iter()
            .find(|n| n.ssid == ssid)
        else {
            return Ok(ConnectOutcome::Failed(FailureReason::NetworkNotFound));
        };
        self.wpa_cli_checked(&["select_network", entry.id.as_str()]).await?;
        Ok(ConnectOutcome::Initiated)
    }
}

#[async_trait]
impl NetworkBackend for SupplicantBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::WpaSupplicant
    }

    async fn scan(&self) -> Result<Vec<NetworkObservation>> {
        tracing::info!(interface = %self.interface, "Scanning for WiFi networks");

        if let Err(e) = self.wpa_cli_checked(&["scan"]).await {
            tracing::debug!(error = %e, "Scan request failed");
        }
        tokio::time::sleep(self.scan_settle).await;

        let current = self.current().await?;
        let results = self.wpa_cli_checked(&["scan_results"]).await?;
        let networks = parser::parse_scan_results(&results, current.ssid.as_deref());

        tracing::info!(count = networks.len(), "Found WiFi networks");
        Ok(networks)
    }

    async fn list_saved(&self) -> Result<Vec<SavedNetwork>> {
        Ok(self.read_config()?.networks())
    }

    async fn current(&self) -> Result<CurrentConnection> {
        let status = parser::parse_supplicant_status(&self.wpa_cli_checked(&["status"]).await?);
        if !status.is_completed() || status.ssid.is_none() {
            return Ok(CurrentConnection::default());
        }

        let signal = match self.wpa_cli_checked(&["signal_poll"]).await {
            Ok(out) => parser::parse_signal_poll(&out),
            Err(e) => {
                tracing::debug!(error = %e, "signal_poll failed");
                None
            }
        };

        Ok(CurrentConnection {
            ssid: status.ssid,
            ip_address: status.ip_address,
            signal_strength: signal,
        })
    }

    async fn connect(
        &self,
        ssid: &str,
        secret: Option<&str>,
        security: Security,
    ) -> Result<ConnectOutcome> {
        require_secret(ssid, secret, security)?;
        let secret = if security.is_open() { None } else { secret };
        if let Some(secret) = secret {
            validate_passphrase(secret)?;
        }

        if self.current().await?.is_connected_to(ssid) {
            tracing::info!(ssid = %ssid, "Already connected");
            return Ok(ConnectOutcome::AlreadyConnected);
        }

        {
            let _guard = self.edit_lock.lock().await;
            let mut config = self.read_config()?;
            config.upsert(ssid, secret, security);
            self.write_config(&config)?;
        }

        tracing::info!(interface = %self.interface, ssid = %ssid, "Connecting via wpa_supplicant");
        self.select(ssid).await
    }

    async fn activate_saved(&self, ssid: &str) -> Result<ConnectOutcome> {
        if self.current().await?.is_connected_to(ssid) {
            return Ok(ConnectOutcome::AlreadyConnected);
        }
        if !self.read_config()?.contains(ssid) {
            return Ok(ConnectOutcome::Failed(FailureReason::NetworkNotFound));
        }
        self.select(ssid).await
    }

    async fn save(&self, ssid: &str, secret: Option<&str>, security: Security) -> Result<bool> {
        require_secret(ssid, secret, security)?;
        let secret = if security.is_open() { None } else { secret };
        if let Some(secret) = secret {
            validate_passphrase(secret)?;
        }

        let added = {
            let _guard = self.edit_lock.lock().await;
            let mut config = self.read_config()?;
            let added = !config.contains(ssid);
            config.upsert(ssid, secret, security);
            self.write_config(&config)?;
            added
        };

        if let Err(e) = self.wpa_cli_checked(&["reconfigure"]).await {
            tracing::warn!(error = %e, "wpa_supplicant did not reload its configuration");
        }
        tracing::info!(ssid = %ssid, added, "Saved network block");
        Ok(added)
    }

    async fn failure_reason(&self, ssid: &str) -> Option<FailureReason> {
        let listed = self.wpa_cli_checked(&["list_networks"]).await.ok()?;
        let Some(entry) = parser::parse_list_networks(&listed)
            .into_iter()
            .find(|n| n.ssid == ssid)
        else {
            return Some(FailureReason::NetworkNotFound);
        };
        // wpa_supplicant backs a network off after repeated handshake failures.
        if entry.temp_disabled {
            return Some(FailureReason::AuthFailure);
        }

        // A state stuck in a handshake phase reads as an authentication problem.
        let status = parser::parse_supplicant_status(&self.wpa_cli_checked(&["status"]).await.ok()?);
        let state = status.wpa_state.unwrap_or_default();
        let reason = parser::classify_failure(&state);
        if reason != FailureReason::Unknown {
            return Some(reason);
        }

        let results = self.wpa_cli_checked(&["scan_results"]).await.ok()?;
        let in_range = parser::parse_scan_results(&results, None)
            .iter()
            .any(|n| n.ssid == ssid);
        (!in_range).then_some(FailureReason::NetworkNotFound)
    }

    async fn forget(&self, ssid: &str) -> Result<bool> {
        {
            let _guard = self.edit_lock.lock().await;
            let mut config = self.read_config()?;
            if !config.remove(ssid) {
                return Ok(false);
            }
            self.write_config(&config)?;
        }

        if let Err(e) = self.wpa_cli_checked(&["reconfigure"]).await {
            tracing::warn!(error = %e, "wpa_supplicant did not reload its configuration");
        }
        tracing::info!(ssid = %ssid, "Removed network block");
        Ok(true)
    }

    async fn disconnect(&self) -> Result<()> {
        self.wpa_cli_checked(&["disconnect"]).await.map(|_| ())
    }
}
