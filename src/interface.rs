use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, WifiError};
use crate::exec::CommandExecutor;
use crate::parser;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiInterface {
    pub name: String,
    pub state: String,
}

/// List WiFi devices known to NetworkManager
pub async fn list_wifi_interfaces(
    exec: &dyn CommandExecutor,
    timeout: Duration,
) -> Result<Vec<WifiInterface>> {
    let output = exec
        .run("nmcli", &["-t", "-f", "DEVICE,TYPE,STATE", "device"], timeout)
        .await?;

    if !output.success() {
        return Err(WifiError::Backend(output.error_text()));
    }

    Ok(parser::parse_device_list(&output.stdout)
        .into_iter()
        .map(|(name, state)| WifiInterface { name, state })
        .collect())
}

/// Wireless interfaces as seen by the kernel, for hosts without NetworkManager
pub fn sysfs_wireless_interfaces() -> Vec<String> {
    sysfs_wireless_interfaces_in(Path::new("/sys/class/net"))
}

fn sysfs_wireless_interfaces_in(root: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(root) else {
        return Vec::new();
    };

    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().join("wireless").exists())
        .filter_map(|entry| entry.file_name().to_str().map(String::from))
        .collect();
    names.sort();
    names
}

/// Resolve interface: use the configured name or the first WiFi device NetworkManager reports
pub async fn resolve_nmcli_interface(
    exec: &dyn CommandExecutor,
    configured: Option<&str>,
    timeout: Duration,
) -> Result<String> {
    let interfaces = list_wifi_interfaces(exec, timeout).await?;

    match configured {
        Some(name) => interfaces
            .into_iter()
            .find(|i| i.name == name)
            .map(|i| i.name)
            .ok_or(WifiError::NoWifiInterface),
        None => interfaces
            .into_iter()
            .next()
            .map(|i| i.name)
            .ok_or(WifiError::NoWifiInterface),
    }
}

/// Resolve interface for the supplicant path: configured name, else the first sysfs wireless device
pub fn resolve_supplicant_interface(configured: Option<&str>) -> Result<String> {
    match configured {
        Some(name) => Ok(name.to_string()),
        None => sysfs_wireless_interfaces()
            .into_iter()
            .next()
            .ok_or(WifiError::NoWifiInterface),
    }
}
