//! In-memory kernel for tests.
//!
//! [`MockKernel`] implements the [`Kernel`] seam against a small in-process
//! model of interface state. It decodes the same wire structures the real
//! kernel would, enforces the same semantic errors (EEXIST on duplicate
//! membership, ENOENT on unknown members, and so on), and offers failure
//! injection plus a membership-growth hook for exercising the two-phase
//! enumeration race.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use tracing::debug;
use vif_wire::bridge::{BRDGADD, BRDGDEL, BRDGGIFFLGS, BRDGGIFS, BRDGSIFFLGS};
use vif_wire::fake::FakeGetCommand;
use vif_wire::{
    BridgeMemberRecord, FakeRequest, FakeSetCommand, InterfaceName, MediaDescriptor, MemberFlags,
    StpRole, StpState, BRIDGE_MEMBER_RECORD_LEN, FAKE_REQUEST_LEN,
};

use crate::channel::Kernel;
use crate::error::{errno, ChannelError};
use crate::iface::IFF_UP;

/// One injectable failure site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOp {
    DrvSet { name: InterfaceName, cmd: u32 },
    DrvGet { name: InterfaceName, cmd: u32 },
    DrvList { name: InterfaceName },
    CreateInterface { name: InterfaceName },
    DestroyInterface { name: InterfaceName },
    SetInterfaceFlags { name: InterfaceName },
}

/// Call counters, for asserting retry and two-phase behavior.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallCounts {
    pub drv_set: u32,
    pub drv_get: u32,
    pub drv_list: u32,
    pub create: u32,
    pub destroy: u32,
    pub get_flags: u32,
    pub set_flags: u32,
}

#[derive(Debug)]
struct InjectedFailure {
    op: MockOp,
    errno: i32,
    remaining: u32,
}

#[derive(Debug, Clone)]
struct MemberEntry {
    name: InterfaceName,
    flags: MemberFlags,
}

#[derive(Debug, Default, Clone)]
struct FakeState {
    peer: Option<InterfaceName>,
    media: Option<MediaDescriptor>,
    dequeue_stall: bool,
}

#[derive(Debug, Clone)]
enum MockKind {
    Plain,
    Bridge(Vec<MemberEntry>),
    Fake(FakeState),
}

#[derive(Debug, Clone)]
struct MockInterface {
    flags: u16,
    kind: MockKind,
}

#[derive(Default)]
struct MockState {
    interfaces: BTreeMap<InterfaceName, MockInterface>,
    failures: Vec<InjectedFailure>,
    growth: HashMap<InterfaceName, Vec<InterfaceName>>,
    forced_list_report: HashMap<InterfaceName, u32>,
    calls: CallCounts,
}

/// An in-memory kernel.
#[derive(Default)]
pub struct MockKernel {
    state: Mutex<MockState>,
}

impl MockKernel {
    /// Create an empty mock kernel.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a plain interface.
    pub fn add_plain(&self, name: &InterfaceName) {
        self.insert(name, MockKind::Plain);
    }

    /// Register a bridge with no members.
    pub fn add_bridge(&self, name: &InterfaceName) {
        self.insert(name, MockKind::Bridge(Vec::new()));
    }

    /// Register an unattached fake-ethernet interface.
    pub fn add_fake(&self, name: &InterfaceName) {
        self.insert(name, MockKind::Fake(FakeState::default()));
    }

    fn insert(&self, name: &InterfaceName, kind: MockKind) {
        self.lock()
            .interfaces
            .insert(name.clone(), MockInterface { flags: 0, kind });
    }

    /// Attach a member to a bridge directly, for test setup.
    pub fn add_member(&self, bridge: &InterfaceName, member: &InterfaceName) {
        let mut state = self.lock();
        if let Some(MockInterface {
            kind: MockKind::Bridge(members),
            ..
        }) = state.interfaces.get_mut(bridge)
        {
            members.push(MemberEntry {
                name: member.clone(),
                flags: MemberFlags::empty(),
            });
        }
    }

    /// Fail the next `times` occurrences of `op` with `errno`.
    pub fn fail_times(&self, op: MockOp, errno: i32, times: u32) {
        self.lock().failures.push(InjectedFailure {
            op,
            errno,
            remaining: times,
        });
    }

    /// Fail the next occurrence of `op` with `errno`.
    pub fn fail_once(&self, op: MockOp, errno: i32) {
        self.fail_times(op, errno, 1);
    }

    /// Attach `member` to `bridge` right after the next enumeration call,
    /// simulating another process racing the two-phase protocol.
    pub fn grow_after_list(&self, bridge: &InterfaceName, member: &InterfaceName) {
        self.lock()
            .growth
            .entry(bridge.clone())
            .or_default()
            .push(member.clone());
    }

    /// Force the next enumeration reports for `bridge` to claim `bytes`
    /// regardless of actual membership.
    pub fn force_list_report(&self, bridge: &InterfaceName, bytes: u32) {
        self.lock()
            .forced_list_report
            .insert(bridge.clone(), bytes);
    }

    /// Snapshot of call counters.
    pub fn calls(&self) -> CallCounts {
        self.lock().calls
    }

    /// Returns true if the interface exists.
    pub fn has_interface(&self, name: &InterfaceName) -> bool {
        self.lock().interfaces.contains_key(name)
    }

    /// Returns true if the interface is administratively up.
    pub fn is_up(&self, name: &InterfaceName) -> bool {
        self.lock()
            .interfaces
            .get(name)
            .map(|iface| iface.flags & IFF_UP != 0)
            .unwrap_or(false)
    }

    /// Current members of a bridge.
    pub fn bridge_members(&self, bridge: &InterfaceName) -> Vec<InterfaceName> {
        match self.lock().interfaces.get(bridge).map(|i| i.kind.clone()) {
            Some(MockKind::Bridge(members)) => members.into_iter().map(|m| m.name).collect(),
            _ => Vec::new(),
        }
    }

    /// Peer of a fake interface, if attached.
    pub fn peer_of(&self, name: &InterfaceName) -> Option<InterfaceName> {
        match self.lock().interfaces.get(name).map(|i| i.kind.clone()) {
            Some(MockKind::Fake(fake)) => fake.peer,
            _ => None,
        }
    }

    /// Media configured on a fake interface.
    pub fn media_of(&self, name: &InterfaceName) -> Option<MediaDescriptor> {
        match self.lock().interfaces.get(name).map(|i| i.kind.clone()) {
            Some(MockKind::Fake(fake)) => fake.media,
            _ => None,
        }
    }

    /// Dequeue-stall flag of a fake interface.
    pub fn stall_of(&self, name: &InterfaceName) -> bool {
        match self.lock().interfaces.get(name).map(|i| i.kind.clone()) {
            Some(MockKind::Fake(fake)) => fake.dequeue_stall,
            _ => false,
        }
    }
}

fn take_failure(state: &mut MockState, op: &MockOp) -> Option<i32> {
    let idx = state
        .failures
        .iter()
        .position(|f| f.remaining > 0 && f.op == *op)?;
    let errno = state.failures[idx].errno;
    state.failures[idx].remaining -= 1;
    if state.failures[idx].remaining == 0 {
        state.failures.remove(idx);
    }
    Some(errno)
}

fn rejected(op: &'static str, errno: i32) -> ChannelError {
    ChannelError::from_errno(op, errno)
}

fn synth_record(index: usize, entry: &MemberEntry) -> BridgeMemberRecord {
    BridgeMemberRecord {
        name: entry.name.clone(),
        flags: entry.flags,
        stp_flags: 0,
        path_cost: 0,
        port_no: (index + 1) as u8,
        priority: 128,
        proto: 0,
        role: StpRole::Designated,
        state: StpState::Forwarding,
        addr_count: 0,
        addr_max: 0,
        addr_exceeded: 0,
    }
}

fn apply_growth(state: &mut MockState, bridge: &InterfaceName) {
    let Some(pending) = state.growth.remove(bridge) else {
        return;
    };
    if let Some(MockInterface {
        kind: MockKind::Bridge(members),
        ..
    }) = state.interfaces.get_mut(bridge)
    {
        for name in pending {
            debug!(bridge = %bridge, member = %name, "[MOCK] Concurrent membership growth");
            members.push(MemberEntry {
                name,
                flags: MemberFlags::empty(),
            });
        }
    }
}

impl Kernel for MockKernel {
    fn drv_set(&self, name: &InterfaceName, cmd: u32, payload: &[u8]) -> Result<(), ChannelError> {
        let mut state = self.lock();
        state.calls.drv_set += 1;
        if let Some(e) = take_failure(
            &mut state,
            &MockOp::DrvSet {
                name: name.clone(),
                cmd,
            },
        ) {
            return Err(rejected("drv_set", e));
        }

        let kind = match state.interfaces.get(name) {
            Some(iface) => iface.kind.clone(),
            None => return Err(rejected("drv_set", errno::ENXIO)),
        };

        match kind {
            MockKind::Bridge(_) => self.bridge_set(&mut state, name, cmd, payload),
            MockKind::Fake(_) => self.fake_set(&mut state, name, cmd, payload),
            MockKind::Plain => Err(rejected("drv_set", errno::EINVAL)),
        }
    }

    fn drv_get(
        &self,
        name: &InterfaceName,
        cmd: u32,
        payload: &mut [u8],
    ) -> Result<(), ChannelError> {
        let mut state = self.lock();
        state.calls.drv_get += 1;
        if let Some(e) = take_failure(
            &mut state,
            &MockOp::DrvGet {
                name: name.clone(),
                cmd,
            },
        ) {
            return Err(rejected("drv_get", e));
        }

        let kind = match state.interfaces.get(name) {
            Some(iface) => iface.kind.clone(),
            None => return Err(rejected("drv_get", errno::ENXIO)),
        };

        match kind {
            MockKind::Bridge(members) if cmd == BRDGGIFFLGS => {
                if payload.len() < BRIDGE_MEMBER_RECORD_LEN {
                    return Err(rejected("drv_get", errno::EINVAL));
                }
                let query = BridgeMemberRecord::decode(payload)
                    .map_err(|_| rejected("drv_get", errno::EINVAL))?;
                let Some((index, entry)) = members
                    .iter()
                    .enumerate()
                    .find(|(_, m)| m.name == query.name)
                else {
                    return Err(rejected("drv_get", errno::ENOENT));
                };
                let record = synth_record(index, entry);
                record
                    .encode_into(payload)
                    .map_err(|_| rejected("drv_get", errno::EINVAL))?;
                Ok(())
            }
            MockKind::Fake(fake) if cmd == FakeGetCommand::GetPeer.as_raw() => {
                if payload.len() < FAKE_REQUEST_LEN {
                    return Err(rejected("drv_get", errno::EINVAL));
                }
                let mut reply = [0u8; FAKE_REQUEST_LEN];
                if let Some(peer) = &fake.peer {
                    // The peer name sits at the start of the union region.
                    peer.encode_into(&mut reply[32..48])
                        .map_err(|_| rejected("drv_get", errno::EINVAL))?;
                }
                payload[..FAKE_REQUEST_LEN].copy_from_slice(&reply);
                Ok(())
            }
            _ => Err(rejected("drv_get", errno::EINVAL)),
        }
    }

    fn drv_list(
        &self,
        name: &InterfaceName,
        cmd: u32,
        buf: &mut [u8],
    ) -> Result<u32, ChannelError> {
        let mut state = self.lock();
        state.calls.drv_list += 1;
        if let Some(e) = take_failure(&mut state, &MockOp::DrvList { name: name.clone() }) {
            return Err(rejected("drv_list", e));
        }
        if cmd != BRDGGIFS {
            return Err(rejected("drv_list", errno::EINVAL));
        }

        let members = match state.interfaces.get(name) {
            Some(MockInterface {
                kind: MockKind::Bridge(members),
                ..
            }) => members.clone(),
            Some(_) => return Err(rejected("drv_list", errno::EINVAL)),
            None => return Err(rejected("drv_list", errno::ENXIO)),
        };

        let total = (members.len() * BRIDGE_MEMBER_RECORD_LEN) as u32;
        let whole_records = buf.len() / BRIDGE_MEMBER_RECORD_LEN;
        for (index, entry) in members.iter().take(whole_records).enumerate() {
            let at = index * BRIDGE_MEMBER_RECORD_LEN;
            let record = synth_record(index, entry);
            record
                .encode_into(&mut buf[at..at + BRIDGE_MEMBER_RECORD_LEN])
                .map_err(|_| rejected("drv_list", errno::EINVAL))?;
        }

        apply_growth(&mut state, name);

        let reported = state
            .forced_list_report
            .remove(name)
            .unwrap_or(total);
        Ok(reported)
    }

    fn create_interface(&self, name: &InterfaceName) -> Result<(), ChannelError> {
        let mut state = self.lock();
        state.calls.create += 1;
        if let Some(e) = take_failure(&mut state, &MockOp::CreateInterface { name: name.clone() })
        {
            return Err(rejected("create_interface", e));
        }
        if state.interfaces.contains_key(name) {
            return Err(rejected("create_interface", errno::EEXIST));
        }
        let kind = if name.as_str().starts_with("bridge") {
            MockKind::Bridge(Vec::new())
        } else if name.as_str().starts_with("feth") {
            MockKind::Fake(FakeState::default())
        } else {
            MockKind::Plain
        };
        debug!(interface = %name, "[MOCK] Creating interface");
        state
            .interfaces
            .insert(name.clone(), MockInterface { flags: 0, kind });
        Ok(())
    }

    fn destroy_interface(&self, name: &InterfaceName) -> Result<(), ChannelError> {
        let mut state = self.lock();
        state.calls.destroy += 1;
        if let Some(e) = take_failure(&mut state, &MockOp::DestroyInterface { name: name.clone() })
        {
            return Err(rejected("destroy_interface", e));
        }
        if state.interfaces.remove(name).is_none() {
            return Err(rejected("destroy_interface", errno::ENXIO));
        }
        debug!(interface = %name, "[MOCK] Destroying interface");
        // Drop dangling references to the destroyed interface.
        for iface in state.interfaces.values_mut() {
            match &mut iface.kind {
                MockKind::Fake(fake) if fake.peer.as_ref() == Some(name) => fake.peer = None,
                MockKind::Bridge(members) => members.retain(|m| &m.name != name),
                _ => {}
            }
        }
        Ok(())
    }

    fn interface_flags(&self, name: &InterfaceName) -> Result<u16, ChannelError> {
        let mut state = self.lock();
        state.calls.get_flags += 1;
        match state.interfaces.get(name) {
            Some(iface) => Ok(iface.flags),
            None => Err(rejected("interface_flags", errno::ENXIO)),
        }
    }

    fn set_interface_flags(&self, name: &InterfaceName, flags: u16) -> Result<(), ChannelError> {
        let mut state = self.lock();
        state.calls.set_flags += 1;
        if let Some(e) = take_failure(
            &mut state,
            &MockOp::SetInterfaceFlags { name: name.clone() },
        ) {
            return Err(rejected("set_interface_flags", e));
        }
        match state.interfaces.get_mut(name) {
            Some(iface) => {
                iface.flags = flags;
                Ok(())
            }
            None => Err(rejected("set_interface_flags", errno::ENXIO)),
        }
    }

    fn interface_names(&self) -> Result<Vec<InterfaceName>, ChannelError> {
        Ok(self.lock().interfaces.keys().cloned().collect())
    }
}

impl MockKernel {
    fn bridge_set(
        &self,
        state: &mut MockState,
        bridge: &InterfaceName,
        cmd: u32,
        payload: &[u8],
    ) -> Result<(), ChannelError> {
        let record =
            BridgeMemberRecord::decode(payload).map_err(|_| rejected("drv_set", errno::EINVAL))?;
        match cmd {
            BRDGADD => {
                if !state.interfaces.contains_key(&record.name) {
                    return Err(rejected("drv_set", errno::ENOENT));
                }
                let members = bridge_members_mut(state, bridge)?;
                if members.iter().any(|m| m.name == record.name) {
                    return Err(rejected("drv_set", errno::EEXIST));
                }
                debug!(bridge = %bridge, member = %record.name, "[MOCK] Adding bridge member");
                members.push(MemberEntry {
                    name: record.name,
                    flags: record.flags,
                });
                Ok(())
            }
            BRDGDEL => {
                let members = bridge_members_mut(state, bridge)?;
                let Some(index) = members.iter().position(|m| m.name == record.name) else {
                    return Err(rejected("drv_set", errno::ENOENT));
                };
                debug!(bridge = %bridge, member = %record.name, "[MOCK] Removing bridge member");
                members.remove(index);
                Ok(())
            }
            BRDGSIFFLGS => {
                let members = bridge_members_mut(state, bridge)?;
                let Some(entry) = members.iter_mut().find(|m| m.name == record.name) else {
                    return Err(rejected("drv_set", errno::ENOENT));
                };
                entry.flags = record.flags;
                Ok(())
            }
            _ => Err(rejected("drv_set", errno::EINVAL)),
        }
    }

    fn fake_set(
        &self,
        state: &mut MockState,
        name: &InterfaceName,
        cmd: u32,
        payload: &[u8],
    ) -> Result<(), ChannelError> {
        let command =
            FakeSetCommand::from_raw(cmd).map_err(|_| rejected("drv_set", errno::EINVAL))?;
        let request = FakeRequest::decode(command, payload)
            .map_err(|_| rejected("drv_set", errno::EINVAL))?;

        match request {
            FakeRequest::SetPeer(peer) => {
                match state.interfaces.get(&peer) {
                    Some(MockInterface {
                        kind: MockKind::Fake(_),
                        ..
                    }) => {}
                    Some(_) => return Err(rejected("drv_set", errno::EINVAL)),
                    None => return Err(rejected("drv_set", errno::ENOENT)),
                }
                if fake_state_mut(state, name)?.peer.is_some() {
                    return Err(rejected("drv_set", errno::EEXIST));
                }
                if fake_state_mut(state, &peer)?.peer.is_some() {
                    return Err(rejected("drv_set", errno::EEXIST));
                }
                debug!(interface = %name, peer = %peer, "[MOCK] Attaching peer");
                fake_state_mut(state, name)?.peer = Some(peer.clone());
                fake_state_mut(state, &peer)?.peer = Some(name.clone());
                Ok(())
            }
            FakeRequest::DetachPeer => {
                let previous = fake_state_mut(state, name)?.peer.take();
                if let Some(peer) = previous {
                    debug!(interface = %name, peer = %peer, "[MOCK] Detaching peer");
                    if let Ok(peer_state) = fake_state_mut(state, &peer) {
                        peer_state.peer = None;
                    }
                }
                Ok(())
            }
            FakeRequest::SetMedia(media) => {
                fake_state_mut(state, name)?.media = Some(media);
                Ok(())
            }
            FakeRequest::SetDequeueStall(enabled) => {
                fake_state_mut(state, name)?.dequeue_stall = enabled;
                Ok(())
            }
        }
    }
}

fn bridge_members_mut<'s>(
    state: &'s mut MockState,
    bridge: &InterfaceName,
) -> Result<&'s mut Vec<MemberEntry>, ChannelError> {
    match state.interfaces.get_mut(bridge) {
        Some(MockInterface {
            kind: MockKind::Bridge(members),
            ..
        }) => Ok(members),
        _ => Err(rejected("drv_set", errno::EINVAL)),
    }
}

fn fake_state_mut<'s>(
    state: &'s mut MockState,
    name: &InterfaceName,
) -> Result<&'s mut FakeState, ChannelError> {
    match state.interfaces.get_mut(name) {
        Some(MockInterface {
            kind: MockKind::Fake(fake),
            ..
        }) => Ok(fake),
        _ => Err(rejected("drv_set", errno::EINVAL)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> InterfaceName {
        InterfaceName::new(s).unwrap()
    }

    #[test]
    fn test_duplicate_add_is_eexist() {
        let kernel = MockKernel::new();
        kernel.add_bridge(&name("bridge0"));
        kernel.add_fake(&name("feth0"));

        let record = BridgeMemberRecord::for_attach(name("feth0"), MemberFlags::empty());
        kernel
            .drv_set(&name("bridge0"), BRDGADD, &record.encode())
            .unwrap();
        let err = kernel
            .drv_set(&name("bridge0"), BRDGADD, &record.encode())
            .unwrap_err();
        assert_eq!(err.errno(), Some(errno::EEXIST));
    }

    #[test]
    fn test_peer_attach_is_bidirectional() {
        let kernel = MockKernel::new();
        kernel.add_fake(&name("feth0"));
        kernel.add_fake(&name("feth1"));

        let request = FakeRequest::SetPeer(name("feth1"));
        kernel
            .drv_set(&name("feth0"), request.command().as_raw(), &request.encode())
            .unwrap();

        assert_eq!(kernel.peer_of(&name("feth0")), Some(name("feth1")));
        assert_eq!(kernel.peer_of(&name("feth1")), Some(name("feth0")));
    }

    #[test]
    fn test_destroy_clears_peer_and_membership() {
        let kernel = MockKernel::new();
        kernel.add_bridge(&name("bridge0"));
        kernel.add_fake(&name("feth0"));
        kernel.add_fake(&name("feth1"));
        kernel.add_member(&name("bridge0"), &name("feth0"));

        let request = FakeRequest::SetPeer(name("feth1"));
        kernel
            .drv_set(&name("feth0"), request.command().as_raw(), &request.encode())
            .unwrap();

        kernel.destroy_interface(&name("feth0")).unwrap();
        assert_eq!(kernel.peer_of(&name("feth1")), None);
        assert!(kernel.bridge_members(&name("bridge0")).is_empty());
    }

    #[test]
    fn test_list_reports_total_and_fills_what_fits() {
        let kernel = MockKernel::new();
        kernel.add_bridge(&name("bridge0"));
        for i in 0..3 {
            let member = name(&format!("feth{i}"));
            kernel.add_fake(&member);
            kernel.add_member(&name("bridge0"), &member);
        }

        let mut buf = vec![0u8; BRIDGE_MEMBER_RECORD_LEN];
        let reported = kernel
            .drv_list(&name("bridge0"), BRDGGIFS, &mut buf)
            .unwrap();
        assert_eq!(reported as usize, 3 * BRIDGE_MEMBER_RECORD_LEN);
        let record = BridgeMemberRecord::decode(&buf).unwrap();
        assert_eq!(record.name, name("feth0"));
    }
}
