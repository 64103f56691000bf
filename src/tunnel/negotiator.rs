//! Tunnel settings negotiation.
//!
//! Decides whether the current upstream configuration is complete enough to
//! apply final tunnel settings immediately, or whether the system's real DNS
//! servers must be discovered first by applying empty settings and
//! re-reading after a settle delay.

use std::sync::Arc;
use std::time::Duration;

use crate::config;
use crate::error::TunnelError;
use crate::tunnel::upstream::Upstream;
use crate::tunnel::{SystemDnsProvider, TunnelHost};

/// Routing mode of a tunnel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelMode {
    /// Route all traffic through the tunnel.
    Full,
    /// Route all traffic, suppressing the OS VPN status indicator.
    FullWithoutIcon,
    /// Split routing: only DNS traffic is intercepted.
    Split,
}

/// Virtual network settings applied at the tunnel boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelNetworkSettings {
    pub local_ipv4: String,
    pub local_ipv6: String,
    /// DNS servers advertised to the device. Always the local proxy
    /// addresses, so queries are routed into the tunnel.
    pub dns_servers: Vec<String>,
    pub intercepts_all_traffic: bool,
    pub hides_status_icon: bool,
}

impl TunnelNetworkSettings {
    /// Build final settings for the given routing mode.
    pub fn for_mode(mode: TunnelMode) -> Self {
        Self {
            local_ipv4: config::LOCAL_PROXY_IPV4.to_string(),
            local_ipv6: config::LOCAL_PROXY_IPV6.to_string(),
            dns_servers: vec![
                config::LOCAL_PROXY_IPV4.to_string(),
                config::LOCAL_PROXY_IPV6.to_string(),
            ],
            intercepts_all_traffic: mode != TunnelMode::Split,
            hides_status_icon: mode == TunnelMode::FullWithoutIcon,
        }
    }
}

/// Outcome of a host-side settings application.
#[derive(Debug, thiserror::Error)]
pub enum SettingsApplyError {
    /// The user dismissed the configuration install prompt.
    #[error("configuration install cancelled by user")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

/// User-facing DNS configuration for one tunnel session.
#[derive(Debug, Clone)]
pub struct DnsConfiguration {
    pub upstreams: Vec<Upstream>,
    pub fallback_servers: Vec<String>,
    pub bootstrap_servers: Vec<String>,
    pub mode: TunnelMode,
}

impl DnsConfiguration {
    /// A configuration is fully specified when the user has chosen
    /// upstreams, fallback servers, and bootstrap servers — system DNS
    /// discovery is unnecessary in that case.
    pub fn is_fully_specified(&self) -> bool {
        !self.upstreams.is_empty()
            && !self.fallback_servers.is_empty()
            && !self.bootstrap_servers.is_empty()
    }
}

/// Policy switches for negotiation edge cases.
#[derive(Debug, Clone, Copy)]
pub struct NegotiatorPolicy {
    /// When true, a cancelled configuration install is reported as success.
    /// Kept behind a flag so the behavior can be revisited as a product
    /// decision.
    pub treat_cancelled_install_as_success: bool,
}

impl Default for NegotiatorPolicy {
    fn default() -> Self {
        Self {
            treat_cancelled_install_as_success: true,
        }
    }
}

/// Negotiates tunnel network settings and discovers system DNS servers.
pub struct TunnelSettingsNegotiator<H, D> {
    host: Arc<H>,
    system_dns: Arc<D>,
    policy: NegotiatorPolicy,
}

impl<H: TunnelHost, D: SystemDnsProvider> TunnelSettingsNegotiator<H, D> {
    pub fn new(host: Arc<H>, system_dns: Arc<D>, policy: NegotiatorPolicy) -> Self {
        Self {
            host,
            system_dns,
            policy,
        }
    }

    /// Apply tunnel settings and return the system's DNS servers, filtered
    /// to exclude the proxy's own addresses.
    ///
    /// When the configuration is fully specified, or the system already
    /// reports usable servers, final settings are applied immediately.
    /// Otherwise empty settings are applied first — the OS only reveals the
    /// true system servers once the proxy's injected addresses are gone —
    /// followed by a fixed settle delay and a re-read. A still-empty server
    /// list falls back to the builtin defaults rather than failing.
    pub async fn negotiate(
        &self,
        dns_config: &DnsConfiguration,
    ) -> Result<Vec<String>, TunnelError> {
        let discovered = filter_proxy_addresses(self.system_dns.system_dns_servers().await);

        if dns_config.is_fully_specified() || !discovered.is_empty() {
            tracing::debug!(
                "Applying final settings immediately ({} system servers)",
                discovered.len()
            );
            self.apply(Some(TunnelNetworkSettings::for_mode(dns_config.mode)))
                .await?;
            return Ok(discovered);
        }

        tracing::debug!("Probing system DNS servers via empty settings");
        self.apply(None).await?;
        tokio::time::sleep(Duration::from_millis(config::DNS_SETTLE_DELAY_MS)).await;

        let mut servers = filter_proxy_addresses(self.system_dns.system_dns_servers().await);
        if servers.is_empty() {
            tracing::warn!("System reported no DNS servers, using builtin defaults");
            servers = config::BUILTIN_DNS_SERVERS
                .iter()
                .map(|s| s.to_string())
                .collect();
        }

        self.apply(Some(TunnelNetworkSettings::for_mode(dns_config.mode)))
            .await?;
        Ok(servers)
    }

    async fn apply(&self, settings: Option<TunnelNetworkSettings>) -> Result<(), TunnelError> {
        match self.host.apply_settings(settings).await {
            Ok(()) => Ok(()),
            Err(SettingsApplyError::Cancelled) => {
                if self.policy.treat_cancelled_install_as_success {
                    tracing::warn!("Configuration install cancelled, treating as success");
                    Ok(())
                } else {
                    Err(TunnelError::Cancelled)
                }
            }
            Err(SettingsApplyError::Other(reason)) => Err(TunnelError::Negotiation(reason)),
        }
    }
}

/// Drop loopback addresses and the proxy's own tunnel addresses from a
/// discovered server list.
fn filter_proxy_addresses(servers: Vec<String>) -> Vec<String> {
    servers
        .into_iter()
        .filter(|s| {
            if s == config::LOCAL_PROXY_IPV4 || s == config::LOCAL_PROXY_IPV6 {
                return false;
            }
            match s.parse::<std::net::IpAddr>() {
                Ok(ip) => !ip.is_loopback(),
                Err(_) => false,
            }
        })
        .collect()
}
