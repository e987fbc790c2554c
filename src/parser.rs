//! Pure parsers turning raw tool output into the canonical model.
//!
//! A row that cannot be split into the expected fields is dropped with a
//! debug log; it never fails the whole listing.

use std::collections::HashMap;

use crate::error::{Result, WifiError};
use crate::models::{FailureReason, NetworkObservation, PingStats, Security};

/// Field separator used by `nmcli -t`; literal colons in values arrive as `\:`.
pub const NMCLI_SEPARATOR: char = ':';

/// Splits one line of `nmcli -t` output on unescaped separators.
pub fn split_terse(line: &str, separator: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut escaped = false;

    for ch in line.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }

        if ch == '\\' {
            escaped = true;
            continue;
        }

        if ch == separator {
            fields.push(std::mem::take(&mut current));
            continue;
        }

        current.push(ch);
    }

    if escaped {
        current.push('\\');
    }
    fields.push(current);

    fields
}

/// Maps nmcli's SECURITY column (e.g. `"WPA1 WPA2"`, `"--"`) to the strongest mode listed.
pub fn nmcli_security(field: &str) -> Security {
    let field = field.trim();
    if field.is_empty() || field == "--" {
        return Security::Open;
    }

    let upper = field.to_ascii_uppercase();
    if upper.contains("WPA3") || upper.contains("SAE") {
        Security::Wpa3
    } else if upper.contains("WPA2") {
        Security::Wpa2
    } else if upper.contains("WPA") {
        Security::Wpa
    } else {
        Security::Unknown
    }
}

/// Parses one `IN-USE,SSID,SIGNAL,SECURITY` row.
pub fn parse_scan_row(line: &str) -> Result<NetworkObservation> {
    let fields = split_terse(line, NMCLI_SEPARATOR);
    let [in_use, ssid, signal, security] = fields.as_slice() else {
        return Err(WifiError::ParseWarning {
            what: "scan",
            line: line.to_string(),
        });
    };

    if ssid.is_empty() {
        // Hidden network.
        return Err(WifiError::ParseWarning {
            what: "scan",
            line: line.to_string(),
        });
    }

    Ok(NetworkObservation {
        ssid: ssid.clone(),
        signal_strength: signal.trim().parse::<u8>().ok().map(|s| s.min(100)),
        security: nmcli_security(security),
        in_use: in_use.trim() == "*",
        saved: false,
    })
}

/// Parses `nmcli -t -f IN-USE,SSID,SIGNAL,SECURITY device wifi list`.
pub fn parse_nmcli_scan(output: &str) -> Vec<NetworkObservation> {
    let rows = output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match parse_scan_row(line) {
            Ok(obs) => Some(obs),
            Err(warning) => {
                tracing::debug!(%warning, "Dropping scan row");
                None
            }
        })
        .collect();

    dedupe_strongest(rows)
}

/// Keeps one observation per SSID, the one with the strongest signal, sorted strongest first.
///
/// The in-use flag survives even if the associated BSSID was the weaker one.
pub fn dedupe_strongest(rows: Vec<NetworkObservation>) -> Vec<NetworkObservation> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut unique: Vec<NetworkObservation> = Vec::new();

    for obs in rows {
        match index.get(&obs.ssid) {
            Some(&i) => {
                let kept = &mut unique[i];
                let in_use = kept.in_use || obs.in_use;
                if obs.signal_strength > kept.signal_strength {
                    *kept = obs;
                }
                kept.in_use = in_use;
            }
            None => {
                index.insert(obs.ssid.clone(), unique.len());
                unique.push(obs);
            }
        }
    }

    unique.sort_by(|a, b| {
        b.signal_strength
            .cmp(&a.signal_strength)
            .then_with(|| a.ssid.cmp(&b.ssid))
    });
    unique
}

/// Wireless devices from `nmcli -t -f DEVICE,TYPE,STATE device`, as `(name, state)`.
pub fn parse_device_list(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .filter_map(|line| {
            let fields = split_terse(line, NMCLI_SEPARATOR);
            match fields.as_slice() {
                [name, kind, state, ..] if kind == "wifi" => Some((name.clone(), state.clone())),
                _ => None,
            }
        })
        .collect()
}

/// Subset of `nmcli -t device show <iface>`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeviceDetails {
    pub state: Option<String>,
    pub connection: Option<String>,
    pub ip_address: Option<String>,
}

impl DeviceDetails {
    /// NetworkManager reports state `100 (connected)` once activation finished.
    pub fn is_activated(&self) -> bool {
        self.state
            .as_deref()
            .is_some_and(|s| s.trim_start().starts_with("100"))
    }
}

pub fn parse_device_show(output: &str) -> DeviceDetails {
    let mut details = DeviceDetails::default();

    for line in output.lines() {
        // Values may contain colons, keys never do.
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() || value == "--" {
            continue;
        }

        match key {
            "GENERAL.STATE" => details.state = Some(value.to_string()),
            "GENERAL.CONNECTION" => details.connection = Some(value.to_string()),
            "IP4.ADDRESS[1]" => {
                let ip = value.split('/').next().unwrap_or(value);
                details.ip_address = Some(ip.to_string());
            }
            _ => {}
        }
    }

    details
}

/// Wi-Fi profile names from `nmcli -t -f NAME,TYPE connection show`.
pub fn parse_wifi_profiles(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let fields = split_terse(line, NMCLI_SEPARATOR);
            match fields.as_slice() {
                [name, kind] if kind == "802-11-wireless" || kind == "wifi" => Some(name.clone()),
                _ => None,
            }
        })
        .collect()
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProfileDetails {
    pub ssid: Option<String>,
    pub security: Security,
    pub has_stored_secret: bool,
}

/// Parses `nmcli -t -f 802-11-wireless.ssid,802-11-wireless-security.key-mgmt connection show id <name>`.
pub fn parse_profile_details(output: &str) -> ProfileDetails {
    let mut ssid = None;
    let mut key_mgmt: Option<String> = None;

    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key {
            "802-11-wireless.ssid" if !value.is_empty() => ssid = Some(value.to_string()),
            "802-11-wireless-security.key-mgmt" if !value.is_empty() && value != "--" => {
                key_mgmt = Some(value.to_ascii_lowercase());
            }
            _ => {}
        }
    }

    let (security, has_stored_secret) = match key_mgmt.as_deref() {
        None => (Security::Open, false),
        // nmcli does not tell WPA1 from WPA2 for a stored psk profile.
        Some("wpa-psk") => (Security::Wpa2, true),
        Some("sae") => (Security::Wpa3, true),
        Some("none") => (Security::Unknown, true),
        Some(_) => (Security::Unknown, false),
    };

    ProfileDetails {
        ssid,
        security,
        has_stored_secret,
    }
}

/// Classifies a backend's connect error text.
pub fn classify_failure(text: &str) -> FailureReason {
    let text = text.to_ascii_lowercase();

    const AUTH: &[&str] = &[
        "secrets were required",
        "no secrets",
        "password",
        "authentication",
        "handshake",
        "psk",
        "wrong key",
    ];
    const NOT_FOUND: &[&str] = &["no network with ssid", "not found", "could not be found"];
    const TIMEOUT: &[&str] = &["timeout", "timed out"];

    if AUTH.iter().any(|p| text.contains(p)) {
        FailureReason::AuthFailure
    } else if NOT_FOUND.iter().any(|p| text.contains(p)) {
        FailureReason::NetworkNotFound
    } else if TIMEOUT.iter().any(|p| text.contains(p)) {
        FailureReason::Timeout
    } else {
        FailureReason::Unknown
    }
}

/// Converts an RSSI in dBm to the 0-100 scale NetworkManager uses.
pub fn dbm_to_percent(dbm: i32) -> u8 {
    let percent = 2 * (dbm + 100);
    u8::try_from(percent.clamp(0, 100)).unwrap_or(0)
}

/// Maps wpa_supplicant scan flags such as `[WPA2-PSK-CCMP][ESS]`.
pub fn wpa_flags_security(flags: &str) -> Security {
    let upper = flags.to_ascii_uppercase();
    if upper.contains("SAE") || upper.contains("WPA3") {
        Security::Wpa3
    } else if upper.contains("WPA2") || upper.contains("RSN") {
        Security::Wpa2
    } else if upper.contains("WPA") {
        Security::Wpa
    } else if upper.contains("WEP") {
        Security::Unknown
    } else {
        Security::Open
    }
}

/// Parses `wpa_cli scan_results` (tab separated: bssid, frequency, dBm, flags, ssid).
pub fn parse_scan_results(output: &str, current_ssid: Option<&str>) -> Vec<NetworkObservation> {
    let rows = output
        .lines()
        .filter(|line| !line.starts_with("bssid") && !line.trim().is_empty())
        .filter_map(|line| {
            let fields: Vec<&str> = line.split('\t').collect();
            let [_bssid, _freq, level, flags, ssid] = fields.as_slice() else {
                tracing::debug!(line, "Dropping scan_results row");
                return None;
            };
            if ssid.is_empty() {
                return None;
            }
            Some(NetworkObservation {
                ssid: ssid.to_string(),
                signal_strength: level.trim().parse::<i32>().ok().map(dbm_to_percent),
                security: wpa_flags_security(flags),
                in_use: current_ssid == Some(*ssid),
                saved: false,
            })
        })
        .collect();

    dedupe_strongest(rows)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SupplicantStatus {
    pub wpa_state: Option<String>,
    pub ssid: Option<String>,
    pub ip_address: Option<String>,
}

impl SupplicantStatus {
    pub fn is_completed(&self) -> bool {
        self.wpa_state.as_deref() == Some("COMPLETED")
    }
}

/// Parses `wpa_cli status` key=value lines.
pub fn parse_supplicant_status(output: &str) -> SupplicantStatus {
    let mut status = SupplicantStatus::default();
    for line in output.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().to_string();
        match key.trim() {
            "wpa_state" => status.wpa_state = Some(value),
            "ssid" => status.ssid = Some(value),
            "ip_address" => status.ip_address = Some(value),
            _ => {}
        }
    }
    status
}

/// Extracts `RSSI=` from `wpa_cli signal_poll`.
pub fn parse_signal_poll(output: &str) -> Option<u8> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("RSSI="))
        .and_then(|v| v.trim().parse::<i32>().ok())
        .map(dbm_to_percent)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedNetwork {
    pub id: String,
    pub ssid: String,
    pub current: bool,
    /// Backed off after repeated failed handshakes.
    pub temp_disabled: bool,
}

/// Parses `wpa_cli list_networks` (tab separated: id, ssid, bssid, flags).
pub fn parse_list_networks(output: &str) -> Vec<ListedNetwork> {
    output
        .lines()
        .filter(|line| !line.starts_with("network id"))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split('\t').collect();
            let [id, ssid, rest @ ..] = fields.as_slice() else {
                return None;
            };
            if id.parse::<u32>().is_err() {
                return None;
            }
            Some(ListedNetwork {
                id: id.to_string(),
                ssid: ssid.to_string(),
                current: rest.iter().any(|f| f.contains("[CURRENT]")),
                temp_disabled: rest.iter().any(|f| f.contains("[TEMP-DISABLED]")),
            })
        })
        .collect()
}

/// Parses the summary of iputils or busybox `ping`.
///
/// Falls back to per-reply `time=` values when no rtt summary line is printed.
pub fn parse_ping_stats(output: &str) -> Option<PingStats> {
    let summary = output.lines().find(|l| l.contains("packets transmitted"))?;
    let mut parts = summary.split(',');
    let sent = leading_number(parts.next()?)?;
    let received = leading_number(parts.next()?)?;

    let rtt = output
        .lines()
        .find(|l| l.contains("min/avg/max"))
        .and_then(|l| l.split_once('='))
        .and_then(|(_, values)| {
            let values = values.split_whitespace().next()?;
            let nums: Vec<f64> = values
                .split('/')
                .take(3)
                .filter_map(|v| v.parse().ok())
                .collect();
            match nums.as_slice() {
                [min, avg, max] => Some((*min, *avg, *max)),
                _ => None,
            }
        })
        .or_else(|| reply_times(output));

    Some(PingStats {
        sent,
        received,
        min_ms: rtt.map(|r| r.0),
        avg_ms: rtt.map(|r| r.1),
        max_ms: rtt.map(|r| r.2),
    })
}

fn leading_number(part: &str) -> Option<u32> {
    part.split_whitespace().next()?.parse().ok()
}

fn reply_times(output: &str) -> Option<(f64, f64, f64)> {
    let times: Vec<f64> = output
        .lines()
        .filter_map(|l| l.split_once("time="))
        .filter_map(|(_, rest)| rest.split_whitespace().next()?.parse().ok())
        .collect();
    if times.is_empty() {
        return None;
    }
    let min = times.iter().copied().fold(f64::INFINITY, f64::min);
    let max = times.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let avg = times.iter().sum::<f64>() / times.len() as f64;
    Some((min, avg, max))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terse_split_honours_escapes() {
        assert_eq!(
            split_terse(r"*:Cafe\:Guest:80:WPA2", ':'),
            vec!["*", "Cafe:Guest", "80", "WPA2"]
        );
        assert_eq!(split_terse(r"a\\:b", ':'), vec![r"a\", "b"]);
    }

    #[test]
    fn duplicate_ssids_keep_strongest() {
        let out = " :Harbor-Guest:42:--\n :Harbor-Guest:67:--\n :Office:55:WPA2\n";
        let networks = parse_nmcli_scan(out);
        let guests: Vec<_> = networks.iter().filter(|n| n.ssid == "Harbor-Guest").collect();
        assert_eq!(guests.len(), 1);
        assert_eq!(guests[0].signal_strength, Some(67));
        assert_eq!(guests[0].security, Security::Open);
        assert_eq!(networks[0].ssid, "Harbor-Guest");
    }

    #[test]
    fn in_use_flag_survives_dedupe() {
        let out = "*:Harbor-Net:30:WPA2\n :Harbor-Net:70:WPA2\n";
        let networks = parse_nmcli_scan(out);
        assert_eq!(networks.len(), 1);
        assert_eq!(networks[0].signal_strength, Some(70));
        assert!(networks[0].in_use);
    }

    #[test]
    fn malformed_rows_are_skipped() {
        let out = "garbage\n :Marina:abc:WPA1 WPA2\n :::\n :Ok Net:50:WPA3\n";
        let networks = parse_nmcli_scan(out);
        assert_eq!(networks.len(), 2);
        let marina = networks.iter().find(|n| n.ssid == "Marina").unwrap();
        assert_eq!(marina.signal_strength, None);
        assert_eq!(marina.security, Security::Wpa2);
        assert!(networks.iter().any(|n| n.ssid == "Ok Net" && n.security == Security::Wpa3));
    }

    #[test]
    fn scan_row_reports_parse_warning() {
        assert!(matches!(
            parse_scan_row("only:two"),
            Err(WifiError::ParseWarning { what: "scan", .. })
        ));
    }

    #[test]
    fn device_show_extracts_ip_without_prefix() {
        let out = "GENERAL.DEVICE:wlan0\nGENERAL.STATE:100 (connected)\nGENERAL.CONNECTION:Harbor-Net\nIP4.ADDRESS[1]:192.168.1.23/24\nIP4.GATEWAY:192.168.1.1\n";
        let details = parse_device_show(out);
        assert!(details.is_activated());
        assert_eq!(details.connection.as_deref(), Some("Harbor-Net"));
        assert_eq!(details.ip_address.as_deref(), Some("192.168.1.23"));

        let idle = parse_device_show("GENERAL.STATE:30 (disconnected)\nGENERAL.CONNECTION:--\n");
        assert!(!idle.is_activated());
        assert_eq!(idle.connection, None);
    }

    #[test]
    fn wifi_profiles_filter_by_type() {
        let out = "Wired connection 1:802-3-ethernet\nHarbor-Net:802-11-wireless\nlo:loopback\nCafe\\:Guest:802-11-wireless\n";
        assert_eq!(parse_wifi_profiles(out), vec!["Harbor-Net", "Cafe:Guest"]);
    }

    #[test]
    fn profile_details_infer_security() {
        let psk = parse_profile_details(
            "802-11-wireless.ssid:Harbor-Net\n802-11-wireless-security.key-mgmt:wpa-psk\n",
        );
        assert_eq!(psk.ssid.as_deref(), Some("Harbor-Net"));
        assert_eq!(psk.security, Security::Wpa2);
        assert!(psk.has_stored_secret);

        let open = parse_profile_details("802-11-wireless.ssid:Harbor-Guest\n");
        assert_eq!(open.security, Security::Open);
        assert!(!open.has_stored_secret);
    }

    #[test]
    fn failures_are_classified() {
        assert_eq!(
            classify_failure("Error: Connection activation failed: Secrets were required, but not provided."),
            FailureReason::AuthFailure
        );
        assert_eq!(
            classify_failure("Error: No network with SSID 'Harbor-Net' found."),
            FailureReason::NetworkNotFound
        );
        assert_eq!(
            classify_failure("Error: Timeout expired (90 seconds)"),
            FailureReason::Timeout
        );
        assert_eq!(
            classify_failure("Error: 802-11-wireless-security.key-mgmt: property is missing."),
            FailureReason::Unknown
        );
    }

    #[test]
    fn supplicant_scan_results_convert_dbm() {
        let out = "bssid / frequency / signal level / flags / ssid\n\
                   aa:bb:cc:dd:ee:01\t2437\t-50\t[WPA2-PSK-CCMP][ESS]\tHarbor-Net\n\
                   aa:bb:cc:dd:ee:02\t2412\t-80\t[ESS]\tHarbor-Guest\n\
                   aa:bb:cc:dd:ee:03\t2412\t-60\t[ESS]\tHarbor-Guest\n\
                   broken line\n";
        let networks = parse_scan_results(out, Some("Harbor-Net"));
        assert_eq!(networks.len(), 2);
        assert_eq!(networks[0].ssid, "Harbor-Net");
        assert_eq!(networks[0].signal_strength, Some(100));
        assert!(networks[0].in_use);
        assert_eq!(networks[1].signal_strength, Some(80));
        assert_eq!(networks[1].security, Security::Open);
    }

    #[test]
    fn supplicant_status_and_signal() {
        let status = parse_supplicant_status(
            "bssid=aa:bb:cc:dd:ee:01\nssid=Harbor-Net\nwpa_state=COMPLETED\nip_address=10.0.0.5\n",
        );
        assert!(status.is_completed());
        assert_eq!(status.ssid.as_deref(), Some("Harbor-Net"));
        assert_eq!(status.ip_address.as_deref(), Some("10.0.0.5"));
        assert_eq!(parse_signal_poll("RSSI=-65\nLINKSPEED=72\n"), Some(70));
    }

    #[test]
    fn list_networks_marks_current() {
        let out = "network id / ssid / bssid / flags\n0\tHarbor-Net\tany\t[CURRENT]\n1\tHarbor-Guest\tany\t\n";
        let listed = parse_list_networks(out);
        assert_eq!(listed.len(), 2);
        assert!(listed[0].current);
        assert_eq!(listed[1].id, "1");

        let backed_off = parse_list_networks("0\tHarbor-Net\tany\t[TEMP-DISABLED]\n");
        assert!(backed_off[0].temp_disabled);
        assert!(!listed[0].temp_disabled);
    }

    #[test]
    fn ping_summary_is_parsed() {
        let out = "PING 8.8.8.8 (8.8.8.8) 56(84) bytes of data.\n\
                   64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=10.0 ms\n\
                   \n--- 8.8.8.8 ping statistics ---\n\
                   4 packets transmitted, 4 received, 0% packet loss, time 3004ms\n\
                   rtt min/avg/max/mdev = 10.000/12.000/15.000/1.870 ms\n";
        let stats = parse_ping_stats(out).unwrap();
        assert_eq!(stats.sent, 4);
        assert_eq!(stats.received, 4);
        assert_eq!(stats.min_ms, Some(10.0));
        assert_eq!(stats.avg_ms, Some(12.0));
        assert_eq!(stats.max_ms, Some(15.0));
    }

    #[test]
    fn busybox_ping_and_total_loss() {
        let busybox = "4 packets transmitted, 3 packets received, 25% packet loss\nround-trip min/avg/max = 1.1/2.2/3.3 ms\n";
        let stats = parse_ping_stats(busybox).unwrap();
        assert_eq!((stats.sent, stats.received), (4, 3));
        assert_eq!(stats.max_ms, Some(3.3));

        let lost = "2 packets transmitted, 0 received, 100% packet loss, time 1001ms\n";
        let stats = parse_ping_stats(lost).unwrap();
        assert_eq!(stats.received, 0);
        assert_eq!(stats.min_ms, None);

        assert_eq!(parse_ping_stats("ping: unknown host"), None);
    }
}
