use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::error;
use zeroize::Zeroizing;

use crate::assembly::ModuleCatalog;
use crate::challenge::ChallengeEngine;
use crate::config::{GateConfig, PolicySettings};
use crate::crypto;
use crate::error::GateError;
use crate::host::JoinPipeline;
use crate::protocol_engine::ProtocolEngine;
use crate::session::SessionEvent;
use crate::token::TokenService;
use crate::transport_adapter::{PeerId, PeerTransport};

const GENERATED_SECRET_LEN: usize = 128;

/// Everything a gate instance shares between its sessions. Built once at
/// startup and handed around as `Arc<GateContext>`.
pub struct GateContext {
    pub config: GateConfig,
    pub local_id: PeerId,
    pub tokens: Arc<TokenService>,
    /// Reference view of the security module and known modules, as this
    /// instance has them loaded.
    pub catalog: Arc<dyn ModuleCatalog>,
    pub challenge: ChallengeEngine,
    pub transport: Arc<dyn PeerTransport>,
    pub host: Arc<dyn JoinPipeline>,
    pub protocol: ProtocolEngine,
    secret: Zeroizing<String>,
    policy: RwLock<PolicySettings>,
    events: broadcast::Sender<SessionEvent>,
    failed: AtomicBool,
}

impl GateContext {
    pub fn new(
        config: GateConfig,
        transport: Arc<dyn PeerTransport>,
        host: Arc<dyn JoinPipeline>,
        catalog: Arc<dyn ModuleCatalog>,
    ) -> Result<Arc<Self>, GateError> {
        Self::with_challenge_engine(config, transport, host, catalog, ChallengeEngine::default())
    }

    pub fn with_challenge_engine(
        config: GateConfig,
        transport: Arc<dyn PeerTransport>,
        host: Arc<dyn JoinPipeline>,
        catalog: Arc<dyn ModuleCatalog>,
        challenge: ChallengeEngine,
    ) -> Result<Arc<Self>, GateError> {
        config.validate()?;
        let secret = if config.secret.is_empty() {
            Zeroizing::new(crypto::random_secret(GENERATED_SECRET_LEN))
        } else {
            Zeroizing::new(config.secret.clone())
        };
        let tokens = Arc::new(TokenService::new(
            &secret,
            config.token_ttl(),
            config.timing.token_stale_after(),
        ));
        let (events, _) = broadcast::channel(256);
        Ok(Arc::new(Self {
            local_id: transport.local_id(),
            policy: RwLock::new(config.policy.clone()),
            protocol: ProtocolEngine::with_gate_packets()?,
            config,
            tokens,
            catalog,
            challenge,
            transport,
            host,
            secret,
            events,
            failed: AtomicBool::new(false),
        }))
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn security_marker(&self) -> &str {
        &self.config.security_module_marker
    }

    pub fn policy(&self) -> PolicySettings {
        self.policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Applies an operator change to the live policy.
    pub fn update_policy<R>(&self, change: impl FnOnce(&mut PolicySettings) -> R) -> R {
        let mut policy = self.policy.write().unwrap_or_else(PoisonError::into_inner);
        change(&mut policy)
    }

    /// Set once attestation modules can no longer be built; every later
    /// join is refused.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Stops the gate if `err` is one it cannot recover from. Returns
    /// whether it did.
    pub(crate) fn halt_on(&self, err: &GateError) -> bool {
        if !err.halts_gate() {
            return false;
        }
        if !self.failed.swap(true, Ordering::AcqRel) {
            error!(error = %err, "attestation setup failed, gate stopping");
        }
        true
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Starts the periodic stale-token sweep.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        self.tokens
            .spawn_pruner(self.config.timing.token_prune_interval())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::StaticCatalog;
    use crate::config::{PluginListEntry, PluginListType};
    use crate::host::RecordingHost;
    use crate::transport_adapter::LoopbackNetwork;
    use std::net::Ipv4Addr;

    fn build(config: GateConfig) -> Result<Arc<GateContext>, GateError> {
        let network = LoopbackNetwork::new();
        let (transport, _rx) = network.endpoint(PeerId(1), Ipv4Addr::LOCALHOST);
        let (host, _events) = RecordingHost::new();
        GateContext::new(
            config,
            transport,
            Arc::new(host),
            Arc::new(StaticCatalog::new("Sandbox.Game", vec![])),
        )
    }

    #[test]
    fn generates_a_secret_when_none_is_configured() {
        let a = build(GateConfig::default()).unwrap();
        let b = build(GateConfig::default()).unwrap();
        assert_eq!(a.secret().len(), GENERATED_SECRET_LEN);
        assert_ne!(a.secret(), b.secret());
        assert_eq!(a.local_id, PeerId(1));
    }

    #[test]
    fn only_attestation_failures_halt_the_gate() {
        let ctx = build(GateConfig::default()).unwrap();
        assert!(!ctx.halt_on(&GateError::protocol("late packet")));
        assert!(!ctx.has_failed());
        let compile = GateError::Attestation(crate::hasher::AttestationError::Compile(vec!["bad slot".into()]));
        assert!(ctx.halt_on(&compile));
        assert!(ctx.has_failed());
    }

    #[test]
    fn keeps_a_configured_secret() {
        let config = GateConfig {
            secret: "0123456789abcdef-configured".into(),
            ..GateConfig::default()
        };
        assert_eq!(build(config).unwrap().secret(), "0123456789abcdef-configured");
    }

    #[test]
    fn rejects_invalid_config() {
        let config = GateConfig {
            token_ttl_secs: 0,
            ..GateConfig::default()
        };
        assert!(matches!(build(config), Err(GateError::Config(_))));
    }

    #[test]
    fn policy_updates_are_visible() {
        let ctx = build(GateConfig::default()).unwrap();
        let added = ctx.update_policy(|policy| {
            policy.plugin_list_type = PluginListType::Blacklist;
            policy.add_entry(PluginListEntry {
                hash: "aGFzaA==".into(),
                ..PluginListEntry::default()
            })
        });
        assert!(added);
        let policy = ctx.policy();
        assert_eq!(policy.plugin_list_type, PluginListType::Blacklist);
        assert_eq!(policy.analyzed_plugins.len(), 1);
    }
}
