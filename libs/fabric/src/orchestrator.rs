//! Intent-level topology orchestration.
//!
//! The orchestrator composes the bridge, fake-ethernet, and lifecycle
//! managers into one intent: attach a guest-facing interface to a bridge as
//! a (optionally stalled) peer pair. The kernel offers no multi-step
//! transactionality, so each pairing runs a small state machine:
//!
//! ```text
//! Planned → PeerAttached → MediaConfigured → Active → TornDown
//!      \________\_______________\_____________/
//!                       Degraded
//! ```
//!
//! A failed step moves the pairing to `Degraded`, recording the
//! last-successful state and the failed step instead of attempting a
//! rollback (kernel-level rollback is itself fallible). Teardown issues
//! inverse operations best-effort, covering only the steps that actually
//! succeeded, and reports which reverts failed. Media configuration has no
//! kernel-level inverse and is not reverted.
//!
//! The cached topology is never trusted across the staleness window: a
//! mutating intent re-reads affected state first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, warn};
use vif_wire::{InterfaceName, MediaDescriptor, MemberFlags};

use crate::bridge::BridgeMembership;
use crate::channel::Kernel;
use crate::config::FabricConfig;
use crate::error::FabricError;
use crate::feth::FakeEthernet;
use crate::iface::Interfaces;
use crate::locks::NameLocks;
use crate::topology::TopologyGraph;

/// One step of the attach sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingStep {
    /// Peer the guest-facing interface with the host-facing one.
    AttachPeer,
    /// Apply the simulated media selection.
    ConfigureMedia,
    /// Stall configuration, bridge membership, and link-up.
    Activate,
}

/// Lifecycle state of a managed pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    Planned,
    PeerAttached,
    MediaConfigured,
    Active,
    Degraded,
    TornDown,
}

/// Desired shape of one host/guest interface pairing.
#[derive(Debug, Clone)]
pub struct PairingSpec {
    /// Bridge the host-facing interface joins.
    pub bridge: InterfaceName,
    /// Host-facing fake-ethernet interface.
    pub host_if: InterfaceName,
    /// Guest-facing fake-ethernet interface, peered to `host_if`.
    pub guest_if: InterfaceName,
    /// Simulated media to apply, if any.
    pub media: Option<MediaDescriptor>,
    /// Whether the guest-facing interface should stall its dequeue path.
    pub dequeue_stall: bool,
    /// Member flags for the bridge attachment.
    pub member_flags: MemberFlags,
}

impl PairingSpec {
    /// A pairing with no media override, no stall, and empty member flags.
    pub fn new(bridge: InterfaceName, host_if: InterfaceName, guest_if: InterfaceName) -> Self {
        Self {
            bridge,
            host_if,
            guest_if,
            media: None,
            dequeue_stall: false,
            member_flags: MemberFlags::empty(),
        }
    }
}

/// Why a pairing is degraded.
#[derive(Debug, Clone)]
pub struct Degradation {
    /// The last state the pairing reached before the failure.
    pub last_ok: PairingState,
    /// The step that failed.
    pub failed_step: PairingStep,
    /// The recorded failure.
    pub error: String,
}

/// Snapshot of one managed pairing.
#[derive(Debug, Clone)]
pub struct Pairing {
    pub spec: PairingSpec,
    pub state: PairingState,
    pub degradation: Option<Degradation>,
}

struct DegradationEntry {
    last_ok: PairingState,
    failed_step: PairingStep,
    error: FabricError,
}

struct PairingEntry {
    spec: PairingSpec,
    state: PairingState,
    degradation: Option<DegradationEntry>,
}

impl PairingEntry {
    fn snapshot(&self) -> Pairing {
        Pairing {
            spec: self.spec.clone(),
            state: self.state,
            degradation: self.degradation.as_ref().map(|d| Degradation {
                last_ok: d.last_ok,
                failed_step: d.failed_step,
                error: d.error.to_string(),
            }),
        }
    }

    /// How far the attach sequence got, counted in completed steps.
    fn progress(&self) -> u8 {
        let reached = match self.state {
            PairingState::Degraded => self
                .degradation
                .as_ref()
                .map(|d| d.last_ok)
                .unwrap_or(PairingState::Planned),
            other => other,
        };
        match reached {
            PairingState::Planned | PairingState::TornDown | PairingState::Degraded => 0,
            PairingState::PeerAttached => 1,
            PairingState::MediaConfigured => 2,
            PairingState::Active => 3,
        }
    }
}

/// One inverse operation attempted during teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    DownLinks,
    RemoveBridgeMember,
    DisableDequeueStall,
    DetachPeer,
}

/// Outcome of a best-effort teardown.
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// Inverse operations that completed.
    pub reverted: Vec<TeardownStep>,
    /// Inverse operations that failed, with their errors.
    pub failed: Vec<(TeardownStep, FabricError)>,
}

impl TeardownReport {
    /// Returns true if every attempted revert completed.
    pub fn fully_reverted(&self) -> bool {
        self.failed.is_empty()
    }

    fn record(&mut self, step: TeardownStep, result: Result<(), FabricError>) {
        match result {
            Ok(()) => self.reverted.push(step),
            Err(err) => {
                warn!(step = ?step, error = %err, "Teardown step failed to revert");
                self.failed.push((step, err));
            }
        }
    }
}

/// Composes the managers into intent-level pairing operations.
pub struct Orchestrator {
    kernel: Arc<dyn Kernel>,
    config: FabricConfig,
    /// Per-interface serialization shared with every manager handed out.
    locks: Arc<NameLocks>,
    /// Serializes whole attach/teardown sequences per guest interface.
    /// Distinct from `locks`: the managers take those per call.
    pairing_locks: NameLocks,
    topology: Mutex<TopologyGraph>,
    pairings: Mutex<HashMap<InterfaceName, PairingEntry>>,
}

impl Orchestrator {
    /// Create an orchestrator over a kernel control plane.
    pub fn new(kernel: Arc<dyn Kernel>, config: FabricConfig) -> Self {
        let topology = TopologyGraph::new(config.staleness_window);
        Self {
            kernel,
            config,
            locks: Arc::new(NameLocks::new()),
            pairing_locks: NameLocks::new(),
            topology: Mutex::new(topology),
            pairings: Mutex::new(HashMap::new()),
        }
    }

    /// Membership manager for a bridge, sharing this orchestrator's locks.
    pub fn bridge(&self, bridge: InterfaceName) -> BridgeMembership {
        BridgeMembership::with_locks(
            self.kernel.clone(),
            bridge,
            self.config.retry.clone(),
            self.locks.clone(),
        )
    }

    /// Manager for a fake-ethernet interface, sharing this orchestrator's
    /// locks.
    pub fn fake(&self, name: InterfaceName) -> FakeEthernet {
        FakeEthernet::with_locks(
            self.kernel.clone(),
            name,
            self.config.retry.clone(),
            self.locks.clone(),
        )
    }

    /// Lifecycle operations, sharing this orchestrator's locks.
    pub fn interfaces(&self) -> Interfaces {
        Interfaces::with_locks(self.kernel.clone(), &self.config, self.locks.clone())
    }

    /// Snapshot of a managed pairing.
    pub fn pairing(&self, guest_if: &InterfaceName) -> Option<Pairing> {
        self.pairings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(guest_if)
            .map(PairingEntry::snapshot)
    }

    /// Re-read a bridge's membership from the kernel and refresh the cache.
    pub fn refresh_bridge(&self, bridge: &InterfaceName) -> Result<Vec<InterfaceName>, FabricError> {
        let records = self.bridge(bridge.clone()).list_members()?;
        let names: Vec<InterfaceName> = records.into_iter().map(|r| r.name).collect();
        self.topology
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record_membership(bridge.clone(), names.clone());
        Ok(names)
    }

    /// Drive a pairing toward `Active`.
    ///
    /// Returns the resulting state; a step failure yields `Degraded` (with
    /// the failure recorded on the pairing), not an error. Errors are
    /// reserved for conditions that prevent the sequence from starting.
    pub fn attach(&self, spec: PairingSpec) -> Result<PairingState, FabricError> {
        let lock = self.pairing_locks.acquire(&spec.guest_if);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        {
            let pairings = self.pairings.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = pairings.get(&spec.guest_if) {
                if existing.state != PairingState::TornDown {
                    return Err(FabricError::PairingExists(spec.guest_if.clone()));
                }
            }
        }

        info!(
            bridge = %spec.bridge,
            host = %spec.host_if,
            guest = %spec.guest_if,
            "Attaching pairing"
        );

        let mut entry = PairingEntry {
            spec: spec.clone(),
            state: PairingState::Planned,
            degradation: None,
        };
        match self.run_attach_steps(&spec) {
            Ok(state) => {
                entry.state = state;
                info!(guest = %spec.guest_if, "Pairing active");
            }
            Err((last_ok, failed_step, err)) => {
                error!(
                    guest = %spec.guest_if,
                    step = ?failed_step,
                    last_ok = ?last_ok,
                    error = %err,
                    "Pairing degraded"
                );
                entry.state = PairingState::Degraded;
                entry.degradation = Some(DegradationEntry {
                    last_ok,
                    failed_step,
                    error: err,
                });
            }
        }

        let state = entry.state;
        self.pairings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(spec.guest_if.clone(), entry);
        Ok(state)
    }

    fn run_attach_steps(
        &self,
        spec: &PairingSpec,
    ) -> Result<PairingState, (PairingState, PairingStep, FabricError)> {
        use PairingState::{MediaConfigured, PeerAttached, Planned};
        use PairingStep::{Activate, AttachPeer, ConfigureMedia};

        // Peer attach. The cached observation is only trusted within the
        // staleness window; otherwise the kernel is asked first.
        let observed = self
            .observed_peer(&spec.guest_if)
            .map_err(|e| (Planned, AttachPeer, e))?;
        match observed {
            Some(peer) if peer == spec.host_if => {
                debug!(guest = %spec.guest_if, "Peer already attached");
            }
            Some(peer) => {
                return Err((
                    Planned,
                    AttachPeer,
                    FabricError::PeerConflict {
                        name: spec.guest_if.clone(),
                        peer,
                    },
                ));
            }
            None => {
                self.fake(spec.guest_if.clone())
                    .set_peer(&spec.host_if)
                    .map_err(|e| (Planned, AttachPeer, e))?;
            }
        }
        {
            let mut topology = self.topology.lock().unwrap_or_else(|e| e.into_inner());
            topology.record_peer(spec.guest_if.clone(), Some(spec.host_if.clone()));
            topology.record_peer(spec.host_if.clone(), Some(spec.guest_if.clone()));
        }

        // Media. A pairing without a media override still passes through
        // this state so teardown accounting stays uniform.
        if let Some(media) = &spec.media {
            self.fake(spec.guest_if.clone())
                .set_media(media)
                .map_err(|e| (PeerAttached, ConfigureMedia, e))?;
        }

        // Activation: stall mode, bridge membership, links up.
        self.fake(spec.guest_if.clone())
            .set_dequeue_stall(spec.dequeue_stall)
            .map_err(|e| (MediaConfigured, Activate, e))?;
        self.bridge(spec.bridge.clone())
            .ensure_member(&spec.host_if, spec.member_flags)
            .map_err(|e| (MediaConfigured, Activate, e))?;
        let interfaces = self.interfaces();
        interfaces
            .set_up(&spec.host_if, true)
            .map_err(|e| (MediaConfigured, Activate, e))?;
        interfaces
            .set_up(&spec.guest_if, true)
            .map_err(|e| (MediaConfigured, Activate, e))?;

        // Membership changed; force the next reader to re-query.
        self.topology
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .invalidate(&spec.bridge);

        Ok(PairingState::Active)
    }

    /// Tear a pairing down, issuing inverse operations best-effort.
    ///
    /// Only the steps that actually succeeded are reverted. Tearing down an
    /// already-torn-down pairing is a no-op.
    pub fn teardown(&self, guest_if: &InterfaceName) -> Result<TeardownReport, FabricError> {
        let lock = self.pairing_locks.acquire(guest_if);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let (spec, progress) = {
            let pairings = self.pairings.lock().unwrap_or_else(|e| e.into_inner());
            let Some(entry) = pairings.get(guest_if) else {
                return Err(FabricError::PairingNotFound(guest_if.clone()));
            };
            if entry.state == PairingState::TornDown {
                return Ok(TeardownReport::default());
            }
            (entry.spec.clone(), entry.progress())
        };

        info!(guest = %guest_if, progress, "Tearing down pairing");
        let mut report = TeardownReport::default();

        if progress >= 3 {
            report.record(TeardownStep::DownLinks, self.down_links(&spec));
            report.record(
                TeardownStep::RemoveBridgeMember,
                self.remove_membership(&spec),
            );
            if spec.dequeue_stall {
                report.record(
                    TeardownStep::DisableDequeueStall,
                    tolerate_missing(self.fake(spec.guest_if.clone()).set_dequeue_stall(false)),
                );
            }
        }
        if progress >= 1 {
            report.record(
                TeardownStep::DetachPeer,
                tolerate_missing(self.fake(spec.guest_if.clone()).detach_peer()),
            );
        }

        {
            let mut topology = self.topology.lock().unwrap_or_else(|e| e.into_inner());
            topology.invalidate(&spec.guest_if);
            topology.invalidate(&spec.host_if);
            topology.invalidate(&spec.bridge);
        }
        {
            let mut pairings = self.pairings.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = pairings.get_mut(guest_if) {
                entry.state = PairingState::TornDown;
                entry.degradation = None;
            }
        }

        info!(
            guest = %guest_if,
            reverted = report.reverted.len(),
            failed = report.failed.len(),
            "Teardown finished"
        );
        Ok(report)
    }

    /// Create a fresh fake pair, wire it to `bridge`, and drive it toward
    /// `Active`.
    ///
    /// Returns the pairing spec and resulting state. If the attach sequence
    /// cannot even start, the created interfaces are destroyed again.
    pub fn provision(
        &self,
        bridge: &InterfaceName,
        media: Option<MediaDescriptor>,
        dequeue_stall: bool,
    ) -> Result<(PairingSpec, PairingState), FabricError> {
        let interfaces = self.interfaces();
        let (host_if, guest_if) = interfaces.create_fake_pair()?;

        let spec = PairingSpec {
            bridge: bridge.clone(),
            host_if,
            guest_if,
            media,
            dequeue_stall,
            member_flags: MemberFlags::empty(),
        };
        match self.attach(spec.clone()) {
            Ok(state) => Ok((spec, state)),
            Err(err) => {
                for name in [&spec.host_if, &spec.guest_if] {
                    if let Err(cleanup_err) = interfaces.destroy(name) {
                        warn!(
                            interface = %name,
                            error = %cleanup_err,
                            "Failed to destroy interface after aborted provision"
                        );
                    }
                }
                Err(err)
            }
        }
    }

    fn observed_peer(
        &self,
        name: &InterfaceName,
    ) -> Result<Option<InterfaceName>, FabricError> {
        {
            let topology = self.topology.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(peer) = topology.peer(name) {
                return Ok(peer.cloned());
            }
        }
        debug!(interface = %name, "Peer observation stale or missing, re-reading");
        let live = self.fake(name.clone()).peer()?;
        self.topology
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record_peer(name.clone(), live.clone());
        Ok(live)
    }

    fn down_links(&self, spec: &PairingSpec) -> Result<(), FabricError> {
        let interfaces = self.interfaces();
        tolerate_missing(interfaces.set_up(&spec.guest_if, false))?;
        tolerate_missing(interfaces.set_up(&spec.host_if, false))
    }

    fn remove_membership(&self, spec: &PairingSpec) -> Result<(), FabricError> {
        match self.bridge(spec.bridge.clone()).remove_member(&spec.host_if) {
            Ok(()) | Err(FabricError::NotAMember { .. }) => Ok(()),
            Err(FabricError::NoSuchInterface(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// An interface that disappeared out-of-band counts as reverted.
fn tolerate_missing(result: Result<(), FabricError>) -> Result<(), FabricError> {
    match result {
        Err(FabricError::NoSuchInterface(_)) => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockKernel;

    fn name(s: &str) -> InterfaceName {
        InterfaceName::new(s).unwrap()
    }

    fn orchestrator() -> (Arc<MockKernel>, Orchestrator) {
        let kernel = Arc::new(MockKernel::new());
        kernel.add_bridge(&name("bridge0"));
        let orch = Orchestrator::new(kernel.clone(), FabricConfig::default());
        (kernel, orch)
    }

    #[test]
    fn test_attach_twice_is_rejected() {
        let (kernel, orch) = orchestrator();
        kernel.add_fake(&name("feth0"));
        kernel.add_fake(&name("feth1"));

        let spec = PairingSpec::new(name("bridge0"), name("feth0"), name("feth1"));
        assert_eq!(orch.attach(spec.clone()).unwrap(), PairingState::Active);
        assert!(matches!(
            orch.attach(spec).unwrap_err(),
            FabricError::PairingExists(_)
        ));
    }

    #[test]
    fn test_attach_detects_foreign_peer() {
        let (kernel, orch) = orchestrator();
        kernel.add_fake(&name("feth0"));
        kernel.add_fake(&name("feth1"));
        kernel.add_fake(&name("feth2"));

        // feth1 is already peered with feth2 by someone else.
        orch.fake(name("feth1")).set_peer(&name("feth2")).unwrap();

        let spec = PairingSpec::new(name("bridge0"), name("feth0"), name("feth1"));
        assert_eq!(orch.attach(spec).unwrap(), PairingState::Degraded);
        let pairing = orch.pairing(&name("feth1")).unwrap();
        let degradation = pairing.degradation.unwrap();
        assert_eq!(degradation.failed_step, PairingStep::AttachPeer);
        assert_eq!(degradation.last_ok, PairingState::Planned);
    }

    #[test]
    fn test_refresh_bridge_updates_cache() {
        let (kernel, orch) = orchestrator();
        kernel.add_fake(&name("feth0"));
        kernel.add_member(&name("bridge0"), &name("feth0"));

        let members = orch.refresh_bridge(&name("bridge0")).unwrap();
        assert_eq!(members, vec![name("feth0")]);
    }

    #[test]
    fn test_teardown_unknown_pairing() {
        let (_, orch) = orchestrator();
        assert!(matches!(
            orch.teardown(&name("feth1")).unwrap_err(),
            FabricError::PairingNotFound(_)
        ));
    }
}
