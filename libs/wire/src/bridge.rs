//! Bridge member records.
//!
//! The kernel describes one bridge member per `ifbreq`, an 80-byte structure
//! packed to 4-byte alignment. Enumeration (`BRDGGIFS`) returns a buffer of
//! consecutive records. The layout is fixed by the kernel ABI and written out
//! here field by field rather than derived from a Rust struct:
//!
//! ```text
//! offset  width  field
//!      0     16  member interface name (NUL-terminated)
//!     16      4  member flags
//!     20      4  STP flags
//!     24      4  STP path cost
//!     28      1  port number
//!     29      1  STP priority
//!     30      1  STP protocol
//!     31      1  STP role
//!     32      1  STP state
//!     33      3  (packing)
//!     36      4  learned-address count
//!     40      4  learned-address max
//!     44      4  learned-address violations
//!     48     32  reserved, zero on write
//! ```
//!
//! All multi-byte fields are native-endian; the kernel consumes them
//! in-process. Packing and reserved bytes are always zeroed on encode.

use crate::error::WireError;
use crate::ifname::{InterfaceName, IFNAMSIZ};

/// Encoded size of one bridge member record.
pub const BRIDGE_MEMBER_RECORD_LEN: usize = 80;

/// `SIOCSDRVSPEC` sub-command: add a member interface.
pub const BRDGADD: u32 = 0;
/// `SIOCSDRVSPEC` sub-command: remove a member interface.
pub const BRDGDEL: u32 = 1;
/// `SIOCGDRVSPEC` sub-command: read one member's flags and STP state.
pub const BRDGGIFFLGS: u32 = 2;
/// `SIOCSDRVSPEC` sub-command: set one member's flags.
pub const BRDGSIFFLGS: u32 = 3;
/// `SIOCGDRVSPEC` sub-command: enumerate member records.
pub const BRDGGIFS: u32 = 6;

/// Per-member flag bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemberFlags(u32);

impl MemberFlags {
    /// Member participates in address learning.
    pub const LEARNING: MemberFlags = MemberFlags(0x01);
    /// Member is flooded with unknown-destination frames.
    pub const DISCOVER: MemberFlags = MemberFlags(0x02);
    /// Spanning tree is enabled on the member.
    pub const STP: MemberFlags = MemberFlags(0x04);

    /// No flags set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Wrap a raw flag word from the kernel.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw flag word.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns true if every bit of `other` is set.
    pub const fn contains(self, other: MemberFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two flag sets.
    pub const fn union(self, other: MemberFlags) -> Self {
        Self(self.0 | other.0)
    }
}

/// STP role reported for a bridge member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StpRole {
    Disabled,
    Root,
    Designated,
    Alternate,
    Backup,
    /// A role value this crate does not know about, preserved as-is.
    Other(u8),
}

impl StpRole {
    /// Map a raw kernel role byte.
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => StpRole::Disabled,
            1 => StpRole::Root,
            2 => StpRole::Designated,
            3 => StpRole::Alternate,
            4 => StpRole::Backup,
            other => StpRole::Other(other),
        }
    }

    /// Raw kernel role byte.
    pub fn as_raw(self) -> u8 {
        match self {
            StpRole::Disabled => 0,
            StpRole::Root => 1,
            StpRole::Designated => 2,
            StpRole::Alternate => 3,
            StpRole::Backup => 4,
            StpRole::Other(raw) => raw,
        }
    }
}

/// STP forwarding state reported for a bridge member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StpState {
    Disabled,
    Listening,
    Learning,
    Forwarding,
    Blocking,
    Discarding,
    /// A state value this crate does not know about, preserved as-is.
    Other(u8),
}

impl StpState {
    /// Map a raw kernel state byte.
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => StpState::Disabled,
            1 => StpState::Listening,
            2 => StpState::Learning,
            3 => StpState::Forwarding,
            4 => StpState::Blocking,
            5 => StpState::Discarding,
            other => StpState::Other(other),
        }
    }

    /// Raw kernel state byte.
    pub fn as_raw(self) -> u8 {
        match self {
            StpState::Disabled => 0,
            StpState::Listening => 1,
            StpState::Learning => 2,
            StpState::Forwarding => 3,
            StpState::Blocking => 4,
            StpState::Discarding => 5,
            StpState::Other(raw) => raw,
        }
    }
}

/// One bridge member, as exchanged with the kernel.
///
/// A record is a kernel-owned point-in-time snapshot. It is constructed when
/// requesting or querying membership and never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeMemberRecord {
    pub name: InterfaceName,
    pub flags: MemberFlags,
    pub stp_flags: u32,
    pub path_cost: u32,
    pub port_no: u8,
    pub priority: u8,
    pub proto: u8,
    pub role: StpRole,
    pub state: StpState,
    pub addr_count: u32,
    pub addr_max: u32,
    pub addr_exceeded: u32,
}

impl BridgeMemberRecord {
    /// Build a record for an attach request.
    ///
    /// STP fields and counters are zeroed; the kernel populates them after
    /// the member is attached.
    pub fn for_attach(name: InterfaceName, flags: MemberFlags) -> Self {
        Self {
            name,
            flags,
            stp_flags: 0,
            path_cost: 0,
            port_no: 0,
            priority: 0,
            proto: 0,
            role: StpRole::Disabled,
            state: StpState::Disabled,
            addr_count: 0,
            addr_max: 0,
            addr_exceeded: 0,
        }
    }

    /// Build a query record carrying only the member name.
    pub fn for_query(name: InterfaceName) -> Self {
        Self::for_attach(name, MemberFlags::empty())
    }

    /// Returns true if the kernel has recorded address-learning violations.
    pub fn addr_limit_exceeded(&self) -> bool {
        self.addr_exceeded > 0
    }

    /// Encode into a fresh 80-byte buffer.
    pub fn encode(&self) -> [u8; BRIDGE_MEMBER_RECORD_LEN] {
        let mut buf = [0u8; BRIDGE_MEMBER_RECORD_LEN];
        // encode_into cannot fail: the buffer is exactly sized and the name
        // was validated at construction.
        let _ = self.encode_into(&mut buf);
        buf
    }

    /// Encode into a caller-supplied buffer, zeroing packing and reserved
    /// bytes. Returns the number of bytes written.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<usize, WireError> {
        if buf.len() < BRIDGE_MEMBER_RECORD_LEN {
            return Err(WireError::BufferTooSmall {
                need: BRIDGE_MEMBER_RECORD_LEN,
                have: buf.len(),
            });
        }
        let buf = &mut buf[..BRIDGE_MEMBER_RECORD_LEN];
        buf.fill(0);
        self.name.encode_into(&mut buf[0..IFNAMSIZ])?;
        buf[16..20].copy_from_slice(&self.flags.bits().to_ne_bytes());
        buf[20..24].copy_from_slice(&self.stp_flags.to_ne_bytes());
        buf[24..28].copy_from_slice(&self.path_cost.to_ne_bytes());
        buf[28] = self.port_no;
        buf[29] = self.priority;
        buf[30] = self.proto;
        buf[31] = self.role.as_raw();
        buf[32] = self.state.as_raw();
        buf[36..40].copy_from_slice(&self.addr_count.to_ne_bytes());
        buf[40..44].copy_from_slice(&self.addr_max.to_ne_bytes());
        buf[44..48].copy_from_slice(&self.addr_exceeded.to_ne_bytes());
        Ok(BRIDGE_MEMBER_RECORD_LEN)
    }

    /// Decode one record from the start of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < BRIDGE_MEMBER_RECORD_LEN {
            return Err(WireError::MalformedRecord(format!(
                "bridge member record is {} bytes, expected {}",
                buf.len(),
                BRIDGE_MEMBER_RECORD_LEN
            )));
        }
        let name = InterfaceName::decode(&buf[0..IFNAMSIZ])?;
        Ok(Self {
            name,
            flags: MemberFlags::from_bits(read_u32(buf, 16)),
            stp_flags: read_u32(buf, 20),
            path_cost: read_u32(buf, 24),
            port_no: buf[28],
            priority: buf[29],
            proto: buf[30],
            role: StpRole::from_raw(buf[31]),
            state: StpState::from_raw(buf[32]),
            addr_count: read_u32(buf, 36),
            addr_max: read_u32(buf, 40),
            addr_exceeded: read_u32(buf, 44),
        })
    }
}

/// Decode an enumeration buffer into its member records.
///
/// The buffer must be a whole number of records; anything else means the
/// snapshot was cut mid-record and must not be accepted.
pub fn decode_snapshot(buf: &[u8]) -> Result<Vec<BridgeMemberRecord>, WireError> {
    if buf.len() % BRIDGE_MEMBER_RECORD_LEN != 0 {
        return Err(WireError::MalformedRecord(format!(
            "snapshot length {} is not a multiple of {}",
            buf.len(),
            BRIDGE_MEMBER_RECORD_LEN
        )));
    }
    buf.chunks_exact(BRIDGE_MEMBER_RECORD_LEN)
        .map(BridgeMemberRecord::decode)
        .collect()
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_ne_bytes(bytes)
}
