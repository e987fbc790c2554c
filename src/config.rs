use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "wifi-manager";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// WiFi device to manage; auto-detected when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    /// Saved-network store; defaults next to the config file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,
    pub supplicant_config: PathBuf,
    pub command_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub connect_poll_attempts: u32,
    pub connect_poll_interval_ms: u64,
    pub scan_settle_ms: u64,
    pub diagnostics: DiagnosticsSettings,
    pub web: WebSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsSettings {
    pub connectivity_target: String,
    pub dns_hostname: String,
    pub ping_target: String,
    pub ping_count: u32,
    /// Ceiling for each individual check.
    pub check_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSettings {
    pub bind: String,
    pub port: u16,
    /// Basic auth is enforced only when both are set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            interface: None,
            store_path: None,
            supplicant_config: PathBuf::from("/etc/wpa_supplicant/wpa_supplicant.conf"),
            command_timeout_secs: 10,
            connect_timeout_secs: 45,
            connect_poll_attempts: 5,
            connect_poll_interval_ms: 1000,
            scan_settle_ms: 500,
            diagnostics: DiagnosticsSettings::default(),
            web: WebSettings::default(),
        }
    }
}

impl Default for DiagnosticsSettings {
    fn default() -> Self {
        Self {
            connectivity_target: "8.8.8.8".to_string(),
            dns_hostname: "google.com".to_string(),
            ping_target: "8.8.8.8".to_string(),
            ping_count: 4,
            check_timeout_secs: 5,
        }
    }
}

impl Default for WebSettings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 80,
            username: None,
            password: None,
        }
    }
}

impl Settings {
    /// Load settings from `path`, or from the default location when `None`.
    /// A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => config_path()?,
        };
        if !path.exists() {
            return Ok(Settings::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize settings")
    }

    pub fn store_path(&self) -> Result<PathBuf> {
        match &self.store_path {
            Some(p) => Ok(p.clone()),
            None => Ok(config_dir()?.join("networks.toml")),
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn connect_poll_interval(&self) -> Duration {
        Duration::from_millis(self.connect_poll_interval_ms)
    }

    pub fn scan_settle(&self) -> Duration {
        Duration::from_millis(self.scan_settle_ms)
    }
}

impl DiagnosticsSettings {
    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }
}

impl WebSettings {
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
            _ => None,
        }
    }
}

fn config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir().context("Could not determine config directory")?;
    Ok(config_dir.join(APP_DIR))
}

pub fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "interface = \"wlan1\"\n[diagnostics]\nping_count = 2\n[web]\nusername = \"admin\"\n",
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.interface.as_deref(), Some("wlan1"));
        assert_eq!(settings.diagnostics.ping_count, 2);
        assert_eq!(settings.diagnostics.dns_hostname, "google.com");
        assert_eq!(settings.connect_poll_attempts, 5);
        assert_eq!(settings.web.credentials(), None);
    }

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(settings.command_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn round_trips_through_toml() {
        let mut settings = Settings::default();
        settings.store_path = Some(PathBuf::from("/var/lib/wifi-manager/networks.toml"));
        let text = settings.to_toml().unwrap();
        let back: Settings = toml::from_str(&text).unwrap();
        assert_eq!(back.store_path, settings.store_path);
        assert_eq!(back.web.port, 80);
    }
}
