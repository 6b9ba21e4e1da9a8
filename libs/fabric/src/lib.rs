//! Control plane for bridge and fake-ethernet interface topology.
//!
//! This library drives a host's virtual interface fabric: bridges, paired
//! fake-ethernet interfaces, and the wiring between them that routes traffic
//! into guest VMs. All kernel interaction goes through driver-specific
//! control requests carrying the packed structures encoded by `vif-wire`.
//!
//! ## Architecture
//!
//! ```text
//! Orchestrator            (intent: pairing state machine, teardown)
//! ├── BridgeMembership    (add/remove/enumerate bridge members)
//! ├── FakeEthernet        (peer, media, dequeue stall)
//! ├── Interfaces          (create/destroy, link state, name allocation)
//! └── TopologyGraph       (staleness-tracked cache; kernel stays truth)
//!         all through
//! Channel over dyn Kernel (bounded retry on gets, never on sets)
//! ```
//!
//! The real kernel implementation (`darwin`) exists only on macOS; every
//! other layer is platform-neutral and tested against [`mock::MockKernel`].
//!
//! ## Modules
//!
//! - `channel`: the kernel seam and retry policy
//! - `bridge`, `feth`, `iface`: the per-concern managers
//! - `orchestrator`: intent-level composition with degradation tracking
//! - `topology`: the observation cache
//! - `ioc`: ioctl request-code construction
//! - `mock`: in-memory kernel exposed for integration tests

pub mod bridge;
pub mod channel;
pub mod config;
pub mod error;
pub mod feth;
pub mod iface;
pub mod ioc;
pub mod locks;
pub mod orchestrator;
pub mod topology;

// Internal modules exposed for integration tests
pub mod mock;

#[cfg(target_os = "macos")]
pub mod darwin;

// Re-export commonly used types
pub use bridge::BridgeMembership;
pub use channel::{Channel, Kernel, RetryPolicy};
pub use config::FabricConfig;
pub use error::{ChannelError, FabricError};
pub use feth::FakeEthernet;
pub use iface::Interfaces;
pub use mock::MockKernel;
pub use orchestrator::{
    Orchestrator, Pairing, PairingSpec, PairingState, PairingStep, TeardownReport, TeardownStep,
};
pub use topology::TopologyGraph;

#[cfg(target_os = "macos")]
pub use darwin::DarwinKernel;
