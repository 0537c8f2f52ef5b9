//! Linux resolver control via /etc/resolv.conf.
//!
//! The file is rewritten with loopback first and the previous nameservers
//! behind it; restore puts the original contents back byte for byte.

use std::path::PathBuf;

use anyhow::Context;

use latch_common::DNS_LISTEN_IP;

const RESOLV_CONF: &str = "/etc/resolv.conf";

pub struct ResolvConf {
    path: PathBuf,
    backup: Option<String>,
}

impl ResolvConf {
    pub fn new() -> Self {
        Self {
            path: PathBuf::from(RESOLV_CONF),
            backup: None,
        }
    }

    #[cfg(test)]
    fn at(path: PathBuf) -> Self {
        Self { path, backup: None }
    }
}

impl super::SystemDns for ResolvConf {
    fn install(&mut self) -> anyhow::Result<Option<String>> {
        let original = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;

        let nameservers = parse_nameservers(&original);
        if nameservers.iter().any(|ns| ns == DNS_LISTEN_IP) {
            tracing::debug!("loopback already configured in resolv.conf");
        }
        let prior = nameservers.iter().find(|ns| !is_loopback(ns)).cloned();

        let mut replacement = String::new();
        replacement.push_str("# managed by latch; the original configuration is restored on shutdown\n");
        replacement.push_str(&format!("nameserver {DNS_LISTEN_IP}\n"));
        for ns in nameservers.iter().filter(|ns| !is_loopback(ns)) {
            replacement.push_str(&format!("nameserver {ns}\n"));
        }
        std::fs::write(&self.path, replacement)
            .with_context(|| format!("writing {}", self.path.display()))?;

        self.backup = Some(original);
        tracing::info!(prior = ?prior, "host resolver pointed at loopback");
        Ok(prior)
    }

    fn restore(&mut self) -> anyhow::Result<()> {
        let Some(original) = self.backup.take() else {
            return Ok(());
        };
        std::fs::write(&self.path, original)
            .with_context(|| format!("restoring {}", self.path.display()))?;
        tracing::info!("host resolver restored");
        Ok(())
    }
}

fn parse_nameservers(contents: &str) -> Vec<String> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some("nameserver"), Some(value)) => Some(value.to_string()),
                _ => None,
            }
        })
        .collect()
}

fn is_loopback(ns: &str) -> bool {
    ns.parse::<std::net::IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}
