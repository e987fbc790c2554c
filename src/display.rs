//! Terminal rendering for the CLI.
//!
//! Everything here prints to stdout; log output goes to stderr so tables stay
//! clean when piped.

use crate::interface::WifiInterface;
use crate::models::{
    ConnectionState, CurrentConnection, DiagnosticsReport, NetworkObservation, PingResult,
    SavedNetwork,
};

/// Displays scan results in a formatted table.
///
/// # Output Format
/// ```text
///    SSID                             SIGNAL      SECURITY
/// ------------------------------------------------------------
/// *  Harbor-Net                         95% ████  WPA2
///    Harbor-Guest                       67% ███░  Open
///    Dock                                 ? ░░░░  Unknown
/// ```
///
/// The `*` marks the network the interface is currently associated with.
pub fn display_networks(networks: &[NetworkObservation]) {
    if networks.is_empty() {
        println!("No networks found.");
        return;
    }

    println!("   {:<32} {:>6}      {:<8} {}", "SSID", "SIGNAL", "SECURITY", "SAVED");
    println!("{}", "-".repeat(66));

    for network in networks {
        let marker = if network.in_use { '*' } else { ' ' };
        let signal = match network.signal_strength {
            Some(s) => format!("{s}%"),
            None => "?".to_string(),
        };
        println!(
            "{}  {:<32} {:>4} {}  {:<8} {}",
            marker,
            truncate_ssid(&network.ssid, 32),
            signal,
            signal_to_bar(network.signal_strength.unwrap_or(0)),
            network.security.to_string(),
            if network.saved { "yes" } else { "" }
        );
    }
}

pub fn display_interfaces(interfaces: &[WifiInterface]) {
    if interfaces.is_empty() {
        println!("No WiFi interfaces found.");
        return;
    }

    println!("{:<16} {}", "INTERFACE", "STATE");
    println!("{}", "-".repeat(32));
    for iface in interfaces {
        println!("{:<16} {}", iface.name, iface.state);
    }
}

pub fn display_saved(networks: &[SavedNetwork]) {
    if networks.is_empty() {
        println!("No saved networks.");
        return;
    }

    println!("{:<32} {:<8} {:<8} {}", "SSID", "SECURITY", "SECRET", "LABEL");
    println!("{}", "-".repeat(64));
    for network in networks {
        println!(
            "{:<32} {:<8} {:<8} {}",
            truncate_ssid(&network.ssid, 32),
            network.security.to_string(),
            if network.has_stored_secret { "stored" } else { "-" },
            network.label.as_deref().unwrap_or("")
        );
    }
}

pub fn display_current(current: &CurrentConnection, state: &ConnectionState) {
    match current.ssid.as_deref() {
        Some(ssid) => println!("Connected: {ssid}"),
        None => println!("Connected: (none)"),
    }

    if let Some(ref ip) = current.ip_address {
        println!("IP:        {ip}");
    }

    if let Some(signal) = current.signal_strength {
        println!("Signal:    {}% {}", signal, signal_to_bar(signal));
    }

    // Only worth showing when it says more than the live query.
    match state {
        ConnectionState::Connecting { ssid } => println!("State:     connecting to {ssid}"),
        ConnectionState::ConnectionFailed { ssid, reason } => {
            println!("State:     last attempt failed: {}", reason.message(ssid));
        }
        ConnectionState::Disconnected | ConnectionState::Connected { .. } => {}
    }
}

pub fn display_diagnostics(report: &DiagnosticsReport) {
    let Some(results) = &report.results else {
        println!("Diagnostics unavailable: {}", report.message);
        return;
    };

    println!("Internet:  {}", pass_fail(results.connectivity));
    println!("DNS:       {}", pass_fail(results.dns_resolution));

    match &results.ping_stats {
        Some(stats) => {
            println!("Ping:      {}/{} received", stats.received, stats.sent);
            if let (Some(min), Some(avg), Some(max)) = (stats.min_ms, stats.avg_ms, stats.max_ms) {
                println!("Latency:   min {min:.1} ms / avg {avg:.1} ms / max {max:.1} ms");
            }
        }
        None => println!("Ping:      no reply"),
    }
}

pub fn display_ping(result: &PingResult) {
    print!("{}", result.raw_output);
    if !result.raw_output.ends_with('\n') {
        println!();
    }
    if !result.success {
        println!("Ping failed.");
    }
}

fn pass_fail(ok: bool) -> &'static str {
    if ok { "OK" } else { "FAILED" }
}

/// Truncates an SSID to at most `max_len` characters, appending "..." when cut.
///
/// Counts characters rather than bytes so multi-byte SSIDs never split mid-character.
fn truncate_ssid(ssid: &str, max_len: usize) -> String {
    if ssid.chars().count() > max_len {
        let kept: String = ssid.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    } else {
        ssid.to_string()
    }
}

/// Converts a signal percentage into a 4-segment bar.
///
/// - `████` - 80-100%
/// - `███░` - 60-79%
/// - `██░░` - 40-59%
/// - `█░░░` - 20-39%
/// - `░░░░` - below 20%
fn signal_to_bar(signal: u8) -> &'static str {
    match signal {
        80..=u8::MAX => "████",
        60..=79 => "███░",
        40..=59 => "██░░",
        20..=39 => "█░░░",
        _ => "░░░░",
    }
}
