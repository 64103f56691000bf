//! Tunnel control plane.
//!
//! `TunnelController` reacts to external lifecycle events (start, stop,
//! network change, sleep, wake) and drives the settings negotiator, the
//! upstream resolver, and the packet pump. All packet and settings I/O goes
//! through the `TunnelHost` boundary supplied by the embedding application —
//! the controller never touches OS networking itself.

pub mod negotiator;
pub mod pump;
pub mod resolver;
pub mod upstream;

#[cfg(test)]
pub(crate) mod testutil;

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::error::TunnelError;
use crate::stats::ActivityRecorder;
use negotiator::{
    DnsConfiguration, NegotiatorPolicy, SettingsApplyError, TunnelMode, TunnelNetworkSettings,
    TunnelSettingsNegotiator,
};
use pump::PacketPump;
use resolver::UpstreamResolver;
use upstream::Upstream;

/// IP protocol family a packet was read from / must be written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolFamily {
    Ipv4,
    Ipv6,
}

/// Outward calls the core makes to the embedding host. The host owns the
/// OS-level tunnel lifecycle; these four calls are the only boundary.
pub trait TunnelHost: Send + Sync + 'static {
    /// Apply tunnel network settings, or clear them with `None`.
    fn apply_settings(
        &self,
        settings: Option<TunnelNetworkSettings>,
    ) -> impl Future<Output = Result<(), SettingsApplyError>> + Send;

    /// Wait for the next batch of packets and their protocol families.
    fn read_packets(&self) -> impl Future<Output = (Vec<Vec<u8>>, Vec<ProtocolFamily>)> + Send;

    /// Write response packets tagged with their protocol families.
    fn write_packets(
        &self,
        packets: Vec<Vec<u8>>,
        families: Vec<ProtocolFamily>,
    ) -> impl Future<Output = ()> + Send;

    /// Tear down this controller instance entirely; the host recreates it.
    fn cancel(&self, error: Option<TunnelError>);
}

/// Reads the DNS servers the OS currently reports.
pub trait SystemDnsProvider: Send + Sync + 'static {
    fn system_dns_servers(&self) -> impl Future<Output = Vec<String>> + Send;
}

/// Resolution seam between the pump and the upstream resolver.
pub trait PacketResolver: Send + Sync + 'static {
    fn resolve(&self, request: &[u8]) -> impl Future<Output = Option<Vec<u8>>> + Send;

    /// Whether the active session resolves over encrypted transports only.
    fn is_encrypted(&self) -> bool;
}

impl PacketResolver for UpstreamResolver {
    fn resolve(&self, request: &[u8]) -> impl Future<Output = Option<Vec<u8>>> + Send {
        UpstreamResolver::resolve(self, request)
    }

    fn is_encrypted(&self) -> bool {
        UpstreamResolver::is_encrypted(self)
    }
}

/// Lifecycle state of the tunnel controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Stopped,
    Starting,
    Running,
    Restarting,
    Stopping,
}

/// One active packet-interception context.
#[derive(Debug, Clone)]
pub struct TunnelSession {
    pub local_ipv4: String,
    pub local_ipv6: String,
    pub mode: TunnelMode,
    /// System DNS servers discovered during negotiation.
    pub system_upstreams: Vec<String>,
}

/// Configuration for a tunnel controller instance.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub dns: DnsConfiguration,
    /// When true, a network change tears this instance down via the host
    /// instead of restarting in place.
    pub restart_on_network_change: bool,
    pub policy: NegotiatorPolicy,
}

/// Drives the tunnel lifecycle. All transitions are serialized on an
/// internal lock, so overlapping lifecycle events cannot interleave.
pub struct TunnelController<H, D> {
    host: Arc<H>,
    negotiator: TunnelSettingsNegotiator<H, D>,
    resolver: Arc<UpstreamResolver>,
    pump: PacketPump,
    config: TunnelConfig,
    recorder: Option<Arc<dyn ActivityRecorder>>,
    session: Mutex<Option<TunnelSession>>,
    lifecycle: tokio::sync::Mutex<()>,
    state_tx: watch::Sender<TunnelState>,
}

impl<H: TunnelHost, D: SystemDnsProvider> TunnelController<H, D> {
    pub fn new(
        host: Arc<H>,
        system_dns: Arc<D>,
        config: TunnelConfig,
        recorder: Option<Arc<dyn ActivityRecorder>>,
    ) -> Self {
        let negotiator =
            TunnelSettingsNegotiator::new(Arc::clone(&host), system_dns, config.policy);
        let (state_tx, _) = watch::channel(TunnelState::Stopped);
        Self {
            host,
            negotiator,
            resolver: Arc::new(UpstreamResolver::new()),
            pump: PacketPump::new(),
            config,
            recorder,
            session: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            state_tx,
        }
    }

    pub fn state(&self) -> TunnelState {
        *self.state_tx.borrow()
    }

    /// Typed observer for state transitions.
    pub fn state_changes(&self) -> watch::Receiver<TunnelState> {
        self.state_tx.subscribe()
    }

    /// The live session, if any.
    pub fn session(&self) -> Option<TunnelSession> {
        self.session.lock().unwrap().clone()
    }

    pub fn is_processing_packets(&self) -> bool {
        self.pump.is_processing()
    }

    /// Start the tunnel: negotiate settings, start the resolver, start the
    /// pump. Any failure lands back in `Stopped` and is surfaced to the
    /// caller; nothing is retried.
    pub async fn start(&self) -> Result<(), TunnelError> {
        let _guard = self.lifecycle.lock().await;
        if self.state() != TunnelState::Stopped {
            tracing::warn!("Ignoring start in state {:?}", self.state());
            return Ok(());
        }

        self.set_state(TunnelState::Starting);
        match self.start_session().await {
            Ok(()) => {
                self.set_state(TunnelState::Running);
                Ok(())
            }
            Err(e) => {
                self.teardown_session();
                self.set_state(TunnelState::Stopped);
                Err(e)
            }
        }
    }

    /// Stop the tunnel. Completes once the pump and resolver are down.
    pub async fn stop(&self, reason: &str) {
        let _guard = self.lifecycle.lock().await;
        if self.state() == TunnelState::Stopped {
            return;
        }
        tracing::info!("Stopping tunnel: {reason}");
        self.set_state(TunnelState::Stopping);
        self.teardown_session();
        self.set_state(TunnelState::Stopped);
    }

    /// React to a network change. Either hands the instance back to the
    /// host for recreation (policy flag), or restarts in place with exactly
    /// one inline retry before escalating to a host-level cancellation.
    pub async fn network_changed(&self) -> Result<(), TunnelError> {
        let _guard = self.lifecycle.lock().await;
        if self.state() != TunnelState::Running {
            tracing::debug!("Ignoring network change in state {:?}", self.state());
            return Ok(());
        }

        self.set_state(TunnelState::Restarting);
        self.teardown_session();

        if self.config.restart_on_network_change {
            tracing::info!("Network changed, handing tunnel back to host for recreation");
            self.host.cancel(None);
            self.set_state(TunnelState::Stopped);
            return Ok(());
        }

        match self.start_session().await {
            Ok(()) => {
                self.set_state(TunnelState::Running);
                Ok(())
            }
            Err(first) => {
                tracing::warn!("Restart after network change failed, retrying once: {first}");
                self.teardown_session();
                match self.start_session().await {
                    Ok(()) => {
                        self.set_state(TunnelState::Running);
                        Ok(())
                    }
                    Err(second) => {
                        tracing::error!("Restart retry failed, cancelling tunnel: {second}");
                        self.teardown_session();
                        self.set_state(TunnelState::Stopped);
                        self.host
                            .cancel(Some(TunnelError::Negotiation(second.to_string())));
                        Err(second)
                    }
                }
            }
        }
    }

    /// Extension point; nothing to do in the minimal design.
    pub fn sleep(&self) {}

    /// Extension point; nothing to do in the minimal design.
    pub fn wake(&self) {}

    async fn start_session(&self) -> Result<(), TunnelError> {
        let system_servers = self.negotiator.negotiate(&self.config.dns).await?;

        // User-chosen upstreams win; otherwise resolve through whatever the
        // system was using (the resolver falls back to builtins on empty).
        let upstreams: Vec<Upstream> = if self.config.dns.upstreams.is_empty() {
            system_servers.iter().map(|s| Upstream::plain(s.as_str())).collect()
        } else {
            self.config.dns.upstreams.clone()
        };
        self.resolver.start(upstreams)?;

        self.pump.start(
            Arc::clone(&self.host),
            Arc::clone(&self.resolver),
            self.recorder.clone(),
        );

        *self.session.lock().unwrap() = Some(TunnelSession {
            local_ipv4: crate::config::LOCAL_PROXY_IPV4.to_string(),
            local_ipv6: crate::config::LOCAL_PROXY_IPV6.to_string(),
            mode: self.config.dns.mode,
            system_upstreams: system_servers,
        });
        Ok(())
    }

    fn teardown_session(&self) {
        self.pump.stop();
        self.resolver.stop();
        *self.session.lock().unwrap() = None;
    }

    fn set_state(&self, state: TunnelState) {
        let old = *self.state_tx.borrow();
        if old != state {
            tracing::debug!("Tunnel state {:?} -> {:?}", old, state);
            let _ = self.state_tx.send(state);
        }
    }
}
