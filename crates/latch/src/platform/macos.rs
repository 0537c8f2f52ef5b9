//! macOS resolver control via `networksetup`.

use std::collections::HashMap;
use std::process::Command;

use anyhow::Context;

use latch_common::DNS_LISTEN_IP;

/// Marker `networksetup -getdnsservers` prints when DNS is DHCP-assigned.
const NO_DNS_MARKER: &str = "There aren't any DNS Servers set";

pub struct NetworkSetup {
    /// Service name → DNS servers before install ("Empty" = DHCP).
    prior: HashMap<String, Vec<String>>,
}

impl NetworkSetup {
    pub fn new() -> Self {
        Self {
            prior: HashMap::new(),
        }
    }
}

impl super::SystemDns for NetworkSetup {
    fn install(&mut self) -> anyhow::Result<Option<String>> {
        let mut first_upstream = None;

        for service in list_services()? {
            let current = get_dns_servers(&service)?;
            if first_upstream.is_none() {
                first_upstream = current
                    .iter()
                    .find(|ns| {
                        ns.parse::<std::net::IpAddr>()
                            .map(|ip| !ip.is_loopback())
                            .unwrap_or(false)
                    })
                    .cloned();
            }

            let mut servers = vec![DNS_LISTEN_IP.to_string()];
            servers.extend(current.iter().filter(|ns| ns.as_str() != DNS_LISTEN_IP).cloned());
            set_dns_servers(&service, &servers)?;

            self.prior.insert(service, current);
        }

        tracing::info!(services = self.prior.len(), prior = ?first_upstream, "host resolver pointed at loopback");
        Ok(first_upstream)
    }

    fn restore(&mut self) -> anyhow::Result<()> {
        for (service, servers) in self.prior.drain() {
            let restore: Vec<String> = if servers.is_empty() {
                vec!["Empty".to_string()]
            } else {
                servers
            };
            set_dns_servers(&service, &restore)?;
        }
        tracing::info!("host resolver restored");
        Ok(())
    }
}

fn list_services() -> anyhow::Result<Vec<String>> {
    let output = Command::new("networksetup")
        .arg("-listallnetworkservices")
        .output()
        .context("running networksetup -listallnetworkservices")?;
    if !output.status.success() {
        anyhow::bail!(
            "networksetup -listallnetworkservices failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    let listing = String::from_utf8_lossy(&output.stdout);
    Ok(listing
        .lines()
        .skip(1) // banner line
        .filter(|line| !line.starts_with('*')) // disabled services
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect())
}

fn get_dns_servers(service: &str) -> anyhow::Result<Vec<String>> {
    let output = Command::new("networksetup")
        .args(["-getdnsservers", service])
        .output()
        .with_context(|| format!("reading DNS servers for {service}"))?;
    let listing = String::from_utf8_lossy(&output.stdout);
    if listing.contains(NO_DNS_MARKER) {
        return Ok(Vec::new());
    }
    Ok(listing
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

fn set_dns_servers(service: &str, servers: &[String]) -> anyhow::Result<()> {
    let output = Command::new("networksetup")
        .args(["-setdnsservers", service])
        .args(servers)
        .output()
        .with_context(|| format!("setting DNS servers for {service}"))?;
    if !output.status.success() {
        anyhow::bail!(
            "networksetup -setdnsservers {service} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}
