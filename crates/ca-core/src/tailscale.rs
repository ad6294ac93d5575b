//! Tailscale CLI queries used to find this machine's overlay address

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::process::Command;

/// Places the tailscale CLI is looked for, in order
///
/// The macOS app bundle does not put its CLI on `PATH`, so it comes first.
const CANDIDATE_BINARIES: &[&str] = &[
    "/Applications/Tailscale.app/Contents/MacOS/Tailscale",
    "/usr/local/bin/tailscale",
    "tailscale",
];

/// Status response from `tailscale status --json`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TailscaleStatus {
    backend_state: String,
    #[serde(rename = "Self")]
    self_node: Option<SelfNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SelfNode {
    #[serde(rename = "TailscaleIPs", default)]
    tailscale_ips: Vec<String>,
}

/// Run the first tailscale binary that starts, returning its stdout on success
fn run_tailscale(args: &[&str]) -> Result<Vec<u8>> {
    let mut last_error = None;

    for binary in CANDIDATE_BINARIES {
        match Command::new(binary).args(args).output() {
            Ok(output) if output.status.success() => return Ok(output.stdout),
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                tracing::debug!("{} {:?} failed: {}", binary, args, stderr.trim());
                last_error = Some(anyhow::anyhow!(
                    "tailscale {} failed: {}",
                    args.join(" "),
                    stderr.trim()
                ));
            }
            Err(e) => {
                tracing::trace!("{} not runnable: {}", binary, e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("tailscale CLI not found")))
}

/// Addresses reported by `tailscale ip -4`
pub fn ip_v4() -> Result<Vec<Ipv4Addr>> {
    let stdout = run_tailscale(&["ip", "-4"])?;
    Ok(parse_ip_output(&String::from_utf8_lossy(&stdout)))
}

/// IPv4 addresses of this node from `tailscale status --json`
pub fn self_ips_from_status() -> Result<Vec<Ipv4Addr>> {
    let stdout = run_tailscale(&["status", "--json"])?;
    parse_status(&stdout)
}

fn parse_ip_output(output: &str) -> Vec<Ipv4Addr> {
    output
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}

fn parse_status(json: &[u8]) -> Result<Vec<Ipv4Addr>> {
    let status: TailscaleStatus =
        serde_json::from_slice(json).context("Failed to parse tailscale status JSON")?;

    if status.backend_state != "Running" {
        anyhow::bail!("Tailscale is not running (state: {})", status.backend_state);
    }

    let self_node = status
        .self_node
        .context("No self node in tailscale status")?;

    Ok(self_node
        .tailscale_ips
        .iter()
        .filter_map(|ip| ip.parse().ok())
        .collect())
}
