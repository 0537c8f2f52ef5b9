//! Windows resolver control via `netsh`.

use std::collections::HashMap;
use std::process::Command;

use anyhow::Context;

use latch_common::DNS_LISTEN_IP;

pub struct Netsh {
    /// Interface → statically configured DNS servers before install
    /// (empty = DHCP-assigned).
    prior: HashMap<String, Vec<String>>,
}

impl Netsh {
    pub fn new() -> Self {
        Self {
            prior: HashMap::new(),
        }
    }
}

impl super::SystemDns for Netsh {
    fn install(&mut self) -> anyhow::Result<Option<String>> {
        let mut first_upstream = None;

        for interface in connected_interfaces()? {
            let current = dns_servers(&interface)?;
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

            run_netsh(&[
                "interface",
                "ip",
                "set",
                "dns",
                &format!("name={interface}"),
                "static",
                DNS_LISTEN_IP,
                "primary",
            ])?;
            for (index, server) in current
                .iter()
                .filter(|ns| ns.as_str() != DNS_LISTEN_IP)
                .enumerate()
            {
                run_netsh(&[
                    "interface",
                    "ip",
                    "add",
                    "dns",
                    &format!("name={interface}"),
                    server,
                    &format!("index={}", index + 2),
                ])?;
            }

            self.prior.insert(interface, current);
        }

        tracing::info!(interfaces = self.prior.len(), prior = ?first_upstream, "host resolver pointed at loopback");
        Ok(first_upstream)
    }

    fn restore(&mut self) -> anyhow::Result<()> {
        for (interface, servers) in self.prior.drain() {
            if servers.is_empty() {
                run_netsh(&[
                    "interface",
                    "ip",
                    "set",
                    "dns",
                    &format!("name={interface}"),
                    "dhcp",
                ])?;
            } else {
                run_netsh(&[
                    "interface",
                    "ip",
                    "set",
                    "dns",
                    &format!("name={interface}"),
                    "static",
                    &servers[0],
                    "primary",
                ])?;
                for (index, server) in servers.iter().skip(1).enumerate() {
                    run_netsh(&[
                        "interface",
                        "ip",
                        "add",
                        "dns",
                        &format!("name={interface}"),
                        server,
                        &format!("index={}", index + 2),
                    ])?;
                }
            }
        }
        tracing::info!("host resolver restored");
        Ok(())
    }
}

fn run_netsh(args: &[&str]) -> anyhow::Result<()> {
    let output = Command::new("netsh")
        .args(args)
        .output()
        .context("running netsh")?;
    if !output.status.success() {
        anyhow::bail!(
            "netsh {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stdout).trim()
        );
    }
    Ok(())
}

fn connected_interfaces() -> anyhow::Result<Vec<String>> {
    let output = Command::new("netsh")
        .args(["interface", "show", "interface"])
        .output()
        .context("listing interfaces")?;
    let listing = String::from_utf8_lossy(&output.stdout);
    Ok(listing
        .lines()
        .filter(|line| line.contains("Connected"))
        .filter_map(|line| line.split_whitespace().nth(3).map(str::to_string))
        .collect())
}

fn dns_servers(interface: &str) -> anyhow::Result<Vec<String>> {
    let output = Command::new("netsh")
        .args([
            "interface",
            "ip",
            "show",
            "dnsservers",
            &format!("name={interface}"),
        ])
        .output()
        .with_context(|| format!("reading DNS servers for {interface}"))?;
    let listing = String::from_utf8_lossy(&output.stdout);
    if listing.contains("DHCP") {
        return Ok(Vec::new());
    }
    Ok(listing
        .lines()
        .filter_map(|line| {
            let token = line.split_whitespace().last()?;
            token.parse::<std::net::IpAddr>().ok().map(|_| token.to_string())
        })
        .collect())
}
