//! Interface lifecycle operations.
//!
//! Creation, destruction, link state, and fake-interface name allocation.
//! These sit beside the bridge and fake-ethernet managers: the orchestrator
//! composes all three into intent-level operations.

use std::sync::Arc;

use tracing::{debug, info, warn};
use vif_wire::InterfaceName;

use crate::channel::Kernel;
use crate::config::FabricConfig;
use crate::error::{errno, ChannelError, FabricError};
use crate::locks::NameLocks;

/// Interface is administratively up.
pub const IFF_UP: u16 = 0x1;
/// Interface is a loopback.
pub const IFF_LOOPBACK: u16 = 0x8;
/// Driver resources are allocated.
pub const IFF_RUNNING: u16 = 0x40;

/// Lifecycle operations over host interfaces.
pub struct Interfaces {
    kernel: Arc<dyn Kernel>,
    locks: Arc<NameLocks>,
    fake_prefix: String,
    fake_search_limit: u32,
}

impl Interfaces {
    /// Create a lifecycle handle with its own lock table.
    pub fn new(kernel: Arc<dyn Kernel>, config: &FabricConfig) -> Self {
        Self::with_locks(kernel, config, Arc::new(NameLocks::new()))
    }

    pub(crate) fn with_locks(
        kernel: Arc<dyn Kernel>,
        config: &FabricConfig,
        locks: Arc<NameLocks>,
    ) -> Self {
        Self {
            kernel,
            locks,
            fake_prefix: config.fake_prefix.clone(),
            fake_search_limit: config.fake_search_limit,
        }
    }

    /// Returns true if the named interface exists.
    pub fn exists(&self, name: &InterfaceName) -> Result<bool, FabricError> {
        match self.kernel.interface_flags(name) {
            Ok(_) => Ok(true),
            Err(err) if is_no_such_interface(&err) => Ok(false),
            Err(err) => Err(FabricError::from_channel(err, "interface_flags", name)),
        }
    }

    /// Returns true if the named interface is administratively up.
    pub fn is_up(&self, name: &InterfaceName) -> Result<bool, FabricError> {
        let flags = self.flags_of(name)?;
        Ok(flags & IFF_UP != 0)
    }

    /// Bring an interface up or down.
    ///
    /// Reads the current flag word and writes it back only when the UP and
    /// RUNNING bits actually change.
    pub fn set_up(&self, name: &InterfaceName, up: bool) -> Result<(), FabricError> {
        let lock = self.locks.acquire(name);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let old = self.flags_of(name)?;
        let new = if up {
            old | IFF_UP | IFF_RUNNING
        } else {
            old & !(IFF_UP | IFF_RUNNING)
        };
        if new == old {
            debug!(interface = %name, up, "Link state already as requested");
            return Ok(());
        }
        self.kernel
            .set_interface_flags(name, new)
            .map_err(|err| self.map_missing(err, "set_interface_flags", name))?;
        info!(interface = %name, up, "Changed link state");
        Ok(())
    }

    /// Create a virtual interface.
    pub fn create(&self, name: &InterfaceName) -> Result<(), FabricError> {
        self.kernel
            .create_interface(name)
            .map_err(|err| FabricError::from_channel(err, "create_interface", name))?;
        info!(interface = %name, "Created interface");
        Ok(())
    }

    /// Destroy a virtual interface.
    pub fn destroy(&self, name: &InterfaceName) -> Result<(), FabricError> {
        self.kernel
            .destroy_interface(name)
            .map_err(|err| self.map_missing(err, "destroy_interface", name))?;
        info!(interface = %name, "Destroyed interface");
        Ok(())
    }

    /// Names of all interfaces on the host.
    pub fn names(&self) -> Result<Vec<InterfaceName>, FabricError> {
        self.kernel.interface_names().map_err(|err| match err {
            ChannelError::Socket(_) => FabricError::ResourceExhausted(err),
            ChannelError::Busy { .. } | ChannelError::RetriesExhausted { .. } => {
                FabricError::Transient(err)
            }
            ChannelError::Rejected { errno, .. } => FabricError::ProtocolViolation(format!(
                "interface enumeration rejected (errno {errno})"
            )),
        })
    }

    /// First unused fake-interface name under the configured prefix.
    pub fn next_free_fake_name(&self) -> Result<InterfaceName, FabricError> {
        let taken = self.names()?;
        for i in 0..self.fake_search_limit {
            let candidate = InterfaceName::new(&format!("{}{}", self.fake_prefix, i))?;
            if !taken.contains(&candidate) {
                return Ok(candidate);
            }
        }
        Err(FabricError::FakeNamesExhausted {
            prefix: self.fake_prefix.clone(),
            limit: self.fake_search_limit,
        })
    }

    /// Create two fake-ethernet interfaces, ready to be peered.
    ///
    /// If the second creation fails the first is destroyed, so a partial
    /// pair never leaks.
    pub fn create_fake_pair(&self) -> Result<(InterfaceName, InterfaceName), FabricError> {
        let first = self.next_free_fake_name()?;
        self.create(&first)?;

        let second = match self.next_free_fake_name() {
            Ok(name) => name,
            Err(err) => {
                self.cleanup_after_pair_failure(&first);
                return Err(err);
            }
        };
        if let Err(err) = self.create(&second) {
            self.cleanup_after_pair_failure(&first);
            return Err(err);
        }

        Ok((first, second))
    }

    fn cleanup_after_pair_failure(&self, created: &InterfaceName) {
        if let Err(err) = self.destroy(created) {
            warn!(
                interface = %created,
                error = %err,
                "Failed to destroy half-created fake pair"
            );
        }
    }

    fn flags_of(&self, name: &InterfaceName) -> Result<u16, FabricError> {
        self.kernel
            .interface_flags(name)
            .map_err(|err| self.map_missing(err, "interface_flags", name))
    }

    fn map_missing(
        &self,
        err: ChannelError,
        op: &'static str,
        name: &InterfaceName,
    ) -> FabricError {
        if is_no_such_interface(&err) {
            FabricError::NoSuchInterface(name.clone())
        } else {
            FabricError::from_channel(err, op, name)
        }
    }
}

fn is_no_such_interface(err: &ChannelError) -> bool {
    matches!(
        err,
        ChannelError::Rejected { errno: e, .. }
            if *e == errno::ENOENT || *e == errno::ENXIO || *e == errno::ENODEV
    )
}
