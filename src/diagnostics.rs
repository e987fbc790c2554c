//! Connectivity, DNS and latency checks.
//!
//! Every check is wrapped in its own ceiling so one unreachable target can
//! only cost [`DiagnosticsSettings::check_timeout`] of the whole pass.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::DiagnosticsSettings;
use crate::error::{Result, WifiError};
use crate::exec::CommandExecutor;
use crate::models::{DiagnosticsResult, PingResult};
use crate::parser;

pub const MAX_PING_COUNT: u32 = 10;

/// Resolver tools tried in order; a missing tool is skipped.
const DNS_TOOLS: &[(&str, &[&str])] = &[
    ("getent", &["hosts"]),
    ("nslookup", &[]),
    ("host", &[]),
    ("dig", &["+short"]),
];

pub struct Diagnostics {
    exec: Arc<dyn CommandExecutor>,
    settings: DiagnosticsSettings,
}

impl Diagnostics {
    pub fn new(exec: Arc<dyn CommandExecutor>, settings: DiagnosticsSettings) -> Self {
        Self { exec, settings }
    }

    pub fn settings(&self) -> &DiagnosticsSettings {
        &self.settings
    }

    /// Runs all three checks concurrently against the configured targets.
    pub async fn run(&self) -> DiagnosticsResult {
        let (connectivity, dns_resolution, ping) = tokio::join!(
            self.check_connectivity(&self.settings.connectivity_target),
            self.check_dns_resolution(&self.settings.dns_hostname),
            self.ping(&self.settings.ping_target, self.settings.ping_count),
        );

        let ping_stats = match ping {
            Ok(result) => result.parsed_stats,
            Err(e) => {
                tracing::warn!(error = %e, "Latency check failed");
                None
            }
        };

        DiagnosticsResult {
            connectivity,
            dns_resolution,
            ping_stats,
        }
    }

    /// Single-packet reachability probe.
    pub async fn check_connectivity(&self, target: &str) -> bool {
        if validate_target(target).is_err() {
            return false;
        }
        let wait = self.settings.check_timeout_secs.max(1).to_string();
        let args = ["-c", "1", "-W", wait.as_str(), target];

        let probe = async {
            match self.exec.run("ping", &args, self.settings.check_timeout()).await {
                Ok(out) => out.success(),
                Err(e) => {
                    tracing::debug!(error = %e, "Connectivity probe failed");
                    false
                }
            }
        };
        let reachable = bounded(self.settings.check_timeout(), probe)
            .await
            .unwrap_or(false);

        tracing::info!(host = %target, reachable, "Connectivity check");
        reachable
    }

    pub async fn check_dns_resolution(&self, hostname: &str) -> bool {
        if validate_target(hostname).is_err() {
            return false;
        }

        let lookup = async {
            for (program, flags) in DNS_TOOLS {
                let mut args = flags.to_vec();
                args.push(hostname);
                match self.exec.run(program, &args, self.settings.check_timeout()).await {
                    Err(WifiError::ExecutableNotFound(_)) => continue,
                    Err(e) => {
                        tracing::debug!(program, error = %e, "DNS lookup failed");
                        return false;
                    }
                    // dig exits 0 with empty output for NXDOMAIN.
                    Ok(out) => return out.success() && !out.stdout.trim().is_empty(),
                }
            }
            tracing::warn!("No DNS lookup tool available");
            false
        };
        let resolved = bounded(self.settings.check_timeout(), lookup)
            .await
            .unwrap_or(false);

        tracing::info!(hostname, resolved, "DNS check");
        resolved
    }

    /// Pings `target` `count` times (clamped to 1..=10).
    ///
    /// A timed-out run is a failed [`PingResult`], not an error; only a
    /// rejected target or a missing `ping` binary fails the call.
    pub async fn ping(&self, target: &str, count: u32) -> Result<PingResult> {
        validate_target(target)?;
        let count = count.clamp(1, MAX_PING_COUNT);
        let count_arg = count.to_string();
        let wait = self.settings.check_timeout_secs.max(1).to_string();
        let args = ["-c", count_arg.as_str(), "-W", wait.as_str(), target];

        // One second per echo plus the wait for the last reply.
        let ceiling = Duration::from_secs(u64::from(count)) + self.settings.check_timeout();

        let output = match bounded(ceiling, self.exec.run("ping", &args, ceiling)).await {
            Some(Ok(out)) => out,
            Some(Err(e @ WifiError::ExecutableNotFound(_))) => return Err(e),
            Some(Err(e)) => return Ok(failed_ping(e.to_string())),
            None => return Ok(failed_ping(format!("ping {target} did not finish within {ceiling:?}"))),
        };

        let raw_output = if output.stdout.trim().is_empty() {
            output.error_text()
        } else {
            output.stdout.clone()
        };
        let parsed_stats = parser::parse_ping_stats(&output.stdout);

        tracing::info!(host = %target, count, success = output.success(), "Ping finished");
        Ok(PingResult {
            success: output.success(),
            raw_output,
            parsed_stats,
        })
    }
}

async fn bounded<T>(ceiling: Duration, check: impl Future<Output = T>) -> Option<T> {
    match tokio::time::timeout(ceiling, check).await {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(?ceiling, "Diagnostic check hit its ceiling");
            None
        }
    }
}

fn failed_ping(message: String) -> PingResult {
    PingResult {
        success: false,
        raw_output: message,
        parsed_stats: None,
    }
}

/// Rejects empty targets and anything a tool could read as an option.
pub fn validate_target(target: &str) -> Result<()> {
    if target.is_empty() || target.starts_with('-') || target.chars().any(char::is_whitespace) {
        return Err(WifiError::InvalidArgument(format!("invalid target '{target}'")));
    }
    Ok(())
}
