//! Fake-ethernet interface management.
//!
//! Configures one fake-ethernet interface: peer attachment, simulated media,
//! and dequeue stalling. Each operation is independently settable; the
//! ordering policy for composite operations (peer before media before stall)
//! belongs to the orchestrator.

use std::sync::Arc;

use tracing::info;
use vif_wire::fake::FakeGetCommand;
use vif_wire::{
    decode_peer_reply, encode_get_peer, FakeRequest, InterfaceName, MediaDescriptor,
};

use crate::channel::{Channel, Kernel, RetryPolicy};
use crate::error::{errno, ChannelError, FabricError};
use crate::locks::NameLocks;

/// Manager for one fake-ethernet interface.
pub struct FakeEthernet {
    kernel: Arc<dyn Kernel>,
    name: InterfaceName,
    retry: RetryPolicy,
    locks: Arc<NameLocks>,
}

impl FakeEthernet {
    /// Create a manager with default retry policy and its own lock table.
    pub fn new(kernel: Arc<dyn Kernel>, name: InterfaceName) -> Self {
        Self::with_locks(
            kernel,
            name,
            RetryPolicy::default(),
            Arc::new(NameLocks::new()),
        )
    }

    pub(crate) fn with_locks(
        kernel: Arc<dyn Kernel>,
        name: InterfaceName,
        retry: RetryPolicy,
        locks: Arc<NameLocks>,
    ) -> Self {
        Self {
            kernel,
            name,
            retry,
            locks,
        }
    }

    /// The fake interface this manager addresses.
    pub fn name(&self) -> &InterfaceName {
        &self.name
    }

    fn channel(&self) -> Channel<'_> {
        Channel::new(&*self.kernel, self.name.clone(), self.retry.clone())
    }

    fn set(&self, request: &FakeRequest, op: &'static str) -> Result<(), FabricError> {
        let lock = self.locks.acquire(&self.name);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        self.channel()
            .set(request.command().as_raw(), &request.encode())
            .map_err(|err| self.map_set_error(err, op))
    }

    /// Attach `peer` as the other end of the simulated link.
    pub fn set_peer(&self, peer: &InterfaceName) -> Result<(), FabricError> {
        self.set(&FakeRequest::SetPeer(peer.clone()), "set peer")
            .map_err(|err| match err {
                // The kernel refuses to re-peer an attached interface.
                FabricError::KernelRejected {
                    errno: errno::EEXIST,
                    ..
                } => FabricError::PeerConflict {
                    name: self.name.clone(),
                    peer: peer.clone(),
                },
                FabricError::KernelRejected {
                    errno: errno::ENOENT,
                    ..
                } => FabricError::NoSuchInterface(peer.clone()),
                other => other,
            })?;
        info!(interface = %self.name, peer = %peer, "Attached fake-ethernet peer");
        Ok(())
    }

    /// Clear the peer attachment.
    pub fn detach_peer(&self) -> Result<(), FabricError> {
        self.set(&FakeRequest::DetachPeer, "detach peer")?;
        info!(interface = %self.name, "Detached fake-ethernet peer");
        Ok(())
    }

    /// The currently attached peer, or `None` if unattached.
    pub fn peer(&self) -> Result<Option<InterfaceName>, FabricError> {
        let lock = self.locks.acquire(&self.name);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut reply = encode_get_peer();
        self.channel()
            .get(FakeGetCommand::GetPeer.as_raw(), &mut reply)
            .map_err(|err| self.map_get_error(err, "get peer"))?;
        Ok(decode_peer_reply(&reply)?)
    }

    /// Replace the simulated media list and current selection.
    pub fn set_media(&self, media: &MediaDescriptor) -> Result<(), FabricError> {
        self.set(&FakeRequest::SetMedia(media.clone()), "set media")?;
        info!(
            interface = %self.name,
            current = media.current(),
            entries = media.list().len(),
            "Configured fake-ethernet media"
        );
        Ok(())
    }

    /// Enable or disable dequeue stalling.
    pub fn set_dequeue_stall(&self, enabled: bool) -> Result<(), FabricError> {
        self.set(&FakeRequest::SetDequeueStall(enabled), "set dequeue stall")?;
        info!(interface = %self.name, enabled, "Configured dequeue stall");
        Ok(())
    }

    fn map_set_error(&self, err: ChannelError, op: &'static str) -> FabricError {
        match err {
            ChannelError::Rejected { errno: e, .. }
                if e == errno::ENXIO || e == errno::ENODEV =>
            {
                FabricError::NoSuchInterface(self.name.clone())
            }
            other => FabricError::from_channel(other, op, &self.name),
        }
    }

    fn map_get_error(&self, err: ChannelError, op: &'static str) -> FabricError {
        match err {
            ChannelError::Rejected { errno: e, .. }
                if e == errno::ENXIO || e == errno::ENODEV || e == errno::ENOENT =>
            {
                FabricError::NoSuchInterface(self.name.clone())
            }
            other => FabricError::from_channel(other, op, &self.name),
        }
    }
}
