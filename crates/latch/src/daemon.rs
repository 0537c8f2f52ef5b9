//! Daemon wiring: config → registry → agent → DNS front-end, plus the
//! system-DNS install/restore bracket and graceful shutdown.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use base64::Engine;
use tokio_util::sync::CancellationToken;

use latch_agent::device::Peer;
use latch_agent::{AgentConfig, ClearDevice, DeviceRole, UdpAgent};
use latch_common::{KnockIdentity, DEFAULT_UPSTREAM_DNS};
use latch_config::BaseConfig;
use latch_dns::{DnsConfig, DnsCore};
use latch_registry::Registry;

use crate::logging::{self, LevelHandle};
use crate::{platform, stopfile};

/// Maximum time to wait for the server task to drain after cancellation.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run(home: PathBuf, config: BaseConfig, level: LevelHandle) -> anyhow::Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), home = %home.display(), "latch starting");

    let cancel = CancellationToken::new();

    stopfile::spawn_watch(&home, cancel.clone());

    // ── Resource registry ──
    let registry = Registry::load(latch_config::resources_path(&home));
    registry.spawn_watch(cancel.clone());

    // ── Packet codec + agent ──
    let private_key = decode_private_key(&config.agent.private_key);
    let peers: Vec<Peer> = config
        .peers
        .iter()
        .map(|p| Peer::new(p.fingerprint.clone(), p.host.clone()))
        .collect();
    if peers.is_empty() {
        tracing::warn!("no authorization peers configured; every knock will fail");
    }
    let device = Arc::new(ClearDevice::new(DeviceRole::Agent, private_key, peers));

    let agent_config = AgentConfig {
        knock_timeout: Duration::from_millis(config.agent.knock_timeout_ms),
        idle_timeout: Duration::from_millis(config.agent.idle_timeout_ms),
        block_cooldown: Duration::from_millis(config.agent.block_cooldown_ms),
    };
    let agent = UdpAgent::start(device, agent_config, &cancel);
    agent.set_identity(identity_from(&config));
    agent.spawn_target_reset(registry.subscribe());

    // ── System DNS ──
    let mut sysdns = None;
    let mut prior_upstream = None;
    if config.set_system_dns {
        let mut controller = platform::controller();
        match controller.install() {
            Ok(prior) => {
                prior_upstream = prior;
                sysdns = Some(controller);
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "system DNS setup failed; set 127.0.0.1 as the resolver manually"
                );
            }
        }
    }

    // ── DNS front-end ──
    let upstream = upstream_addr(&config, prior_upstream.as_deref())?;
    match upstream {
        Some(addr) => tracing::info!(upstream = %addr, "forward path enabled"),
        None => tracing::info!("no upstream resolver; forward path answers SERVFAIL"),
    }
    let dns_config = DnsConfig {
        upstream,
        ..DnsConfig::default()
    };
    let core = Arc::new(DnsCore::new(dns_config, Arc::clone(&registry), Arc::clone(&agent)));

    let serve_core = Arc::clone(&core);
    let serve_cancel = cancel.clone();
    let mut serve_task = tokio::spawn(async move { serve_core.serve(serve_cancel).await });

    // ── Base-config watch: only the log level applies hot ──
    spawn_config_watch(&home, cancel.clone(), level);

    tracing::info!("ready");

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("termination signal received");
            Ok(())
        }
        _ = cancel.cancelled() => Ok(()),
        result = &mut serve_task => match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(anyhow::Error::new(e)
                .context("dns server failed; binding port 53 requires elevated privileges")),
            Err(e) => Err(anyhow::anyhow!("dns server task panicked: {e}")),
        },
    };

    tracing::info!("shutting down");
    cancel.cancel();
    agent.shutdown();
    if !serve_task.is_finished() {
        let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut serve_task).await;
    }

    if let Some(mut controller) = sysdns {
        if let Err(e) = controller.restore() {
            tracing::warn!(error = %e, "failed to restore system DNS");
        }
    }

    tracing::info!("latch stopped");
    outcome
}

fn decode_private_key(encoded: &str) -> Vec<u8> {
    if encoded.is_empty() {
        tracing::warn!("agent private key is empty");
        return Vec::new();
    }
    match base64::engine::general_purpose::STANDARD.decode(encoded) {
        Ok(key) => key,
        Err(e) => {
            tracing::error!(error = %e, "agent private key is not valid base64, ignoring");
            Vec::new()
        }
    }
}

fn identity_from(config: &BaseConfig) -> KnockIdentity {
    let check_results = config
        .identity
        .check_results
        .iter()
        .filter_map(|(key, value)| {
            serde_json::to_value(value)
                .ok()
                .map(|json| (key.clone(), json))
        })
        .collect();
    KnockIdentity {
        user_id: config.identity.user_id.clone(),
        organization_id: config.identity.organization_id.clone(),
        device_id: config.identity.device_id.clone(),
        check_results,
    }
}

/// The forward-path upstream: the configured IP wins; otherwise the prior
/// system resolver captured during install; otherwise, only when the
/// system resolver was taken over, the public default.
fn upstream_addr(config: &BaseConfig, prior: Option<&str>) -> anyhow::Result<Option<SocketAddr>> {
    if !config.upstream_dns.is_empty() {
        let ip: IpAddr = config
            .upstream_dns
            .parse()
            .with_context(|| format!("invalid upstream_dns {:?}", config.upstream_dns))?;
        return Ok(Some(SocketAddr::new(ip, 53)));
    }
    if let Some(prior) = prior {
        if let Ok(ip) = prior.parse::<IpAddr>() {
            return Ok(Some(SocketAddr::new(ip, 53)));
        }
        tracing::warn!(prior, "prior upstream is not an IP literal, ignoring");
    }
    if config.set_system_dns {
        let ip: IpAddr = DEFAULT_UPSTREAM_DNS.parse().unwrap();
        return Ok(Some(SocketAddr::new(ip, 53)));
    }
    Ok(None)
}

fn spawn_config_watch(home: &std::path::Path, cancel: CancellationToken, level: LevelHandle) {
    let config_path = latch_config::base_config_path(home);
    let watched = config_path.clone();
    latch_config::watch_file(watched, cancel, move || {
        match BaseConfig::load(&config_path) {
            Ok(updated) => {
                logging::apply_level(&level, updated.log_level());
                tracing::info!(log_level = updated.log_level, "base config reloaded");
            }
            Err(e) => {
                tracing::error!(error = %e, "base config reload failed, keeping current settings");
            }
        }
    });
}
