//! Bridge membership management.
//!
//! Adds, removes, inspects, and enumerates the members of one bridge. All
//! requests travel through the control channel as encoded member records;
//! the kernel's errnos are mapped to the fabric taxonomy here.
//!
//! Enumeration is a two-phase size-then-fetch protocol: the kernel reports
//! the byte length of the full result set, which can exceed the supplied
//! buffer. The manager resizes exactly once to the reported length. Another
//! process can legitimately grow the membership between the phases, so a
//! still-short second response surfaces as [`FabricError::SnapshotStale`]
//! for the caller to re-query, never as an unbounded loop.

use std::sync::Arc;

use tracing::{debug, info};
use vif_wire::bridge::{BRDGADD, BRDGDEL, BRDGGIFFLGS, BRDGGIFS, BRDGSIFFLGS};
use vif_wire::{
    decode_snapshot, BridgeMemberRecord, InterfaceName, MemberFlags, BRIDGE_MEMBER_RECORD_LEN,
};

use crate::channel::{Channel, Kernel, RetryPolicy};
use crate::error::{errno, ChannelError, FabricError};
use crate::locks::NameLocks;

/// Records the initial enumeration buffer is sized for.
pub const INITIAL_SNAPSHOT_RECORDS: usize = 8;

/// Membership manager for one bridge.
pub struct BridgeMembership {
    kernel: Arc<dyn Kernel>,
    bridge: InterfaceName,
    retry: RetryPolicy,
    locks: Arc<NameLocks>,
}

impl BridgeMembership {
    /// Create a manager with default retry policy and its own lock table.
    pub fn new(kernel: Arc<dyn Kernel>, bridge: InterfaceName) -> Self {
        Self::with_locks(
            kernel,
            bridge,
            RetryPolicy::default(),
            Arc::new(NameLocks::new()),
        )
    }

    pub(crate) fn with_locks(
        kernel: Arc<dyn Kernel>,
        bridge: InterfaceName,
        retry: RetryPolicy,
        locks: Arc<NameLocks>,
    ) -> Self {
        Self {
            kernel,
            bridge,
            retry,
            locks,
        }
    }

    /// The bridge this manager addresses.
    pub fn bridge(&self) -> &InterfaceName {
        &self.bridge
    }

    fn channel(&self) -> Channel<'_> {
        Channel::new(&*self.kernel, self.bridge.clone(), self.retry.clone())
    }

    /// Attach a member interface to the bridge.
    ///
    /// STP fields and learning counters are zeroed in the request; the
    /// kernel populates them once the member is attached.
    pub fn add_member(
        &self,
        member: &InterfaceName,
        flags: MemberFlags,
    ) -> Result<(), FabricError> {
        let lock = self.locks.acquire(&self.bridge);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        self.add_member_locked(member, flags)
    }

    fn add_member_locked(
        &self,
        member: &InterfaceName,
        flags: MemberFlags,
    ) -> Result<(), FabricError> {
        let record = BridgeMemberRecord::for_attach(member.clone(), flags);
        match self.channel().set(BRDGADD, &record.encode()) {
            Ok(()) => {
                info!(bridge = %self.bridge, member = %member, "Added bridge member");
                Ok(())
            }
            Err(ChannelError::Rejected {
                errno: errno::EEXIST,
                ..
            }) => Err(FabricError::AlreadyMember {
                bridge: self.bridge.clone(),
                member: member.clone(),
            }),
            Err(err) if rejected_missing(&err) => {
                Err(FabricError::NoSuchInterface(member.clone()))
            }
            Err(err) => Err(FabricError::from_channel(err, "bridge add", &self.bridge)),
        }
    }

    /// Detach a member interface from the bridge.
    pub fn remove_member(&self, member: &InterfaceName) -> Result<(), FabricError> {
        let lock = self.locks.acquire(&self.bridge);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let record = BridgeMemberRecord::for_query(member.clone());
        match self.channel().set(BRDGDEL, &record.encode()) {
            Ok(()) => {
                info!(bridge = %self.bridge, member = %member, "Removed bridge member");
                Ok(())
            }
            Err(ChannelError::Rejected {
                errno: errno::ENOENT,
                ..
            }) => Err(FabricError::NotAMember {
                bridge: self.bridge.clone(),
                member: member.clone(),
            }),
            Err(err) => Err(FabricError::from_channel(err, "bridge del", &self.bridge)),
        }
    }

    /// Read one member's flags and STP state.
    ///
    /// Returns `None` when the interface is not a member, distinguishing
    /// absence from failure.
    pub fn member_record(
        &self,
        member: &InterfaceName,
    ) -> Result<Option<BridgeMemberRecord>, FabricError> {
        let lock = self.locks.acquire(&self.bridge);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        self.member_record_locked(member)
    }

    fn member_record_locked(
        &self,
        member: &InterfaceName,
    ) -> Result<Option<BridgeMemberRecord>, FabricError> {
        let mut buf = BridgeMemberRecord::for_query(member.clone()).encode();
        match self.channel().get(BRDGGIFFLGS, &mut buf) {
            Ok(()) => Ok(Some(BridgeMemberRecord::decode(&buf)?)),
            Err(ChannelError::Rejected {
                errno: errno::ENOENT,
                ..
            }) => Ok(None),
            Err(err) => Err(FabricError::from_channel(
                err,
                "bridge member flags",
                &self.bridge,
            )),
        }
    }

    /// Make sure `member` is attached, adding it if necessary.
    ///
    /// Returns true if the member was added, false if it was already there.
    /// Query and add run under one lock so concurrent callers cannot both
    /// observe absence.
    pub fn ensure_member(
        &self,
        member: &InterfaceName,
        flags: MemberFlags,
    ) -> Result<bool, FabricError> {
        let lock = self.locks.acquire(&self.bridge);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        if self.member_record_locked(member)?.is_some() {
            debug!(bridge = %self.bridge, member = %member, "Already a bridge member");
            return Ok(false);
        }
        self.add_member_locked(member, flags)?;
        Ok(true)
    }

    /// Replace one member's flags.
    pub fn set_member_flags(
        &self,
        member: &InterfaceName,
        flags: MemberFlags,
    ) -> Result<(), FabricError> {
        let lock = self.locks.acquire(&self.bridge);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let record = BridgeMemberRecord::for_attach(member.clone(), flags);
        match self.channel().set(BRDGSIFFLGS, &record.encode()) {
            Ok(()) => Ok(()),
            Err(ChannelError::Rejected {
                errno: errno::ENOENT,
                ..
            }) => Err(FabricError::NotAMember {
                bridge: self.bridge.clone(),
                member: member.clone(),
            }),
            Err(err) => Err(FabricError::from_channel(
                err,
                "bridge set member flags",
                &self.bridge,
            )),
        }
    }

    /// Enumerate the bridge's members.
    pub fn list_members(&self) -> Result<Vec<BridgeMemberRecord>, FabricError> {
        let lock = self.locks.acquire(&self.bridge);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut capacity = INITIAL_SNAPSHOT_RECORDS * BRIDGE_MEMBER_RECORD_LEN;
        let mut buf = vec![0u8; capacity];
        let reported = self.list_once(&mut buf)?;
        if reported <= capacity {
            return self.parse_snapshot(&buf[..reported]);
        }

        // The kernel reported a larger result set; resize exactly once to
        // the reported length and fetch again.
        debug!(
            bridge = %self.bridge,
            sized = capacity,
            reported,
            "Membership snapshot buffer undersized, refetching"
        );
        self.check_alignment(reported)?;
        capacity = reported;
        buf = vec![0u8; capacity];
        let reported = self.list_once(&mut buf)?;
        if reported <= capacity {
            return self.parse_snapshot(&buf[..reported]);
        }

        // Grown again between the phases; the caller decides when to
        // re-query.
        Err(FabricError::SnapshotStale {
            sized: capacity,
            reported,
        })
    }

    fn list_once(&self, buf: &mut [u8]) -> Result<usize, FabricError> {
        self.channel()
            .list(BRDGGIFS, buf)
            .map(|reported| reported as usize)
            .map_err(|err| FabricError::from_channel(err, "bridge list", &self.bridge))
    }

    fn parse_snapshot(&self, buf: &[u8]) -> Result<Vec<BridgeMemberRecord>, FabricError> {
        self.check_alignment(buf.len())?;
        Ok(decode_snapshot(buf)?)
    }

    fn check_alignment(&self, bytes: usize) -> Result<(), FabricError> {
        if bytes % BRIDGE_MEMBER_RECORD_LEN != 0 {
            return Err(FabricError::ProtocolViolation(format!(
                "kernel reported {} bytes of membership, not a whole number of {}-byte records",
                bytes, BRIDGE_MEMBER_RECORD_LEN
            )));
        }
        Ok(())
    }
}

fn rejected_missing(err: &ChannelError) -> bool {
    matches!(
        err,
        ChannelError::Rejected { errno: e, .. }
            if *e == errno::ENOENT || *e == errno::ENXIO || *e == errno::ENODEV
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockKernel, MockOp};

    fn name(s: &str) -> InterfaceName {
        InterfaceName::new(s).unwrap()
    }

    fn setup(members: usize) -> (Arc<MockKernel>, BridgeMembership) {
        let kernel = Arc::new(MockKernel::new());
        kernel.add_bridge(&name("bridge0"));
        for i in 0..members {
            let member = name(&format!("feth{i}"));
            kernel.add_fake(&member);
            kernel.add_member(&name("bridge0"), &member);
        }
        let manager = BridgeMembership::new(kernel.clone(), name("bridge0"));
        (kernel, manager)
    }

    #[test]
    fn test_add_and_remove_member() {
        let (kernel, manager) = setup(0);
        kernel.add_fake(&name("feth0"));

        manager
            .add_member(&name("feth0"), MemberFlags::LEARNING)
            .unwrap();
        assert_eq!(kernel.bridge_members(&name("bridge0")), vec![name("feth0")]);

        manager.remove_member(&name("feth0")).unwrap();
        assert!(kernel.bridge_members(&name("bridge0")).is_empty());
    }

    #[test]
    fn test_duplicate_add_is_already_member() {
        let (kernel, manager) = setup(0);
        kernel.add_fake(&name("feth0"));

        manager
            .add_member(&name("feth0"), MemberFlags::empty())
            .unwrap();
        let err = manager
            .add_member(&name("feth0"), MemberFlags::empty())
            .unwrap_err();
        assert!(matches!(err, FabricError::AlreadyMember { .. }));
    }

    #[test]
    fn test_add_unknown_interface() {
        let (_, manager) = setup(0);
        let err = manager
            .add_member(&name("feth9"), MemberFlags::empty())
            .unwrap_err();
        assert!(matches!(err, FabricError::NoSuchInterface(n) if n == name("feth9")));
    }

    #[test]
    fn test_remove_non_member() {
        let (kernel, manager) = setup(0);
        kernel.add_fake(&name("feth0"));
        let err = manager.remove_member(&name("feth0")).unwrap_err();
        assert!(matches!(err, FabricError::NotAMember { .. }));
    }

    #[test]
    fn test_member_record_absent_is_none() {
        let (kernel, manager) = setup(1);
        kernel.add_fake(&name("feth9"));

        assert!(manager.member_record(&name("feth0")).unwrap().is_some());
        assert!(manager.member_record(&name("feth9")).unwrap().is_none());
    }

    #[test]
    fn test_ensure_member_adds_once() {
        let (kernel, manager) = setup(0);
        kernel.add_fake(&name("feth0"));

        assert!(manager
            .ensure_member(&name("feth0"), MemberFlags::empty())
            .unwrap());
        assert!(!manager
            .ensure_member(&name("feth0"), MemberFlags::empty())
            .unwrap());
        assert_eq!(kernel.bridge_members(&name("bridge0")).len(), 1);
    }

    #[test]
    fn test_list_exact_fit_does_not_retry() {
        let (kernel, manager) = setup(INITIAL_SNAPSHOT_RECORDS);
        let records = manager.list_members().unwrap();
        assert_eq!(records.len(), INITIAL_SNAPSHOT_RECORDS);
        assert_eq!(kernel.calls().drv_list, 1);
    }

    #[test]
    fn test_list_resizes_exactly_once() {
        let (kernel, manager) = setup(INITIAL_SNAPSHOT_RECORDS + 3);
        let records = manager.list_members().unwrap();
        assert_eq!(records.len(), INITIAL_SNAPSHOT_RECORDS + 3);
        assert_eq!(kernel.calls().drv_list, 2);
    }

    #[test]
    fn test_list_growth_after_resize_is_stale() {
        let (kernel, manager) = setup(INITIAL_SNAPSHOT_RECORDS + 1);
        // Another process attaches one more member between every phase.
        let extra_a = name("fetha");
        let extra_b = name("fethb");
        kernel.add_fake(&extra_a);
        kernel.add_fake(&extra_b);
        kernel.grow_after_list(&name("bridge0"), &extra_a);
        kernel.grow_after_list(&name("bridge0"), &extra_b);

        let err = manager.list_members().unwrap_err();
        assert!(matches!(err, FabricError::SnapshotStale { .. }));
        assert_eq!(kernel.calls().drv_list, 2);
    }

    #[test]
    fn test_list_misaligned_report_is_protocol_violation() {
        let (kernel, manager) = setup(2);
        kernel.force_list_report(&name("bridge0"), 2 * 80 + 13);
        let err = manager.list_members().unwrap_err();
        assert!(matches!(err, FabricError::ProtocolViolation(_)));
    }

    #[test]
    fn test_concurrent_add_yields_one_success_one_already_member() {
        let (kernel, manager) = setup(0);
        kernel.add_fake(&name("feth0"));
        let manager = Arc::new(manager);

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let manager = Arc::clone(&manager);
                std::thread::spawn(move || {
                    manager.add_member(&name("feth0"), MemberFlags::empty())
                })
            })
            .collect();
        let results: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("thread panicked"))
            .collect();

        let successes = results.iter().filter(|r| r.is_ok()).count();
        let already = results
            .iter()
            .filter(|r| matches!(r, Err(FabricError::AlreadyMember { .. })))
            .count();
        assert_eq!(successes, 1);
        assert_eq!(already, 1);
        assert_eq!(kernel.bridge_members(&name("bridge0")).len(), 1);
    }
}
