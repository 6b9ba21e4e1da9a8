//! Wire codec for kernel interface-control structures.
//!
//! This library encodes and decodes the fixed-size, packed structures the
//! interface fabric exchanges with the kernel over driver-specific ioctls:
//!
//! - Bridge member records and enumeration snapshots (`bridge`)
//! - Fake-ethernet request frames with their command-tagged union (`fake`)
//! - Bounded interface names shared by both (`ifname`)
//!
//! # Invariants
//!
//! - Layouts are written out byte-by-byte at documented offsets, never
//!   derived from Rust struct layout.
//! - Encoding zeroes every padding and reserved byte; nothing from host
//!   memory leaks across the system-call boundary.
//! - Decoding validates bounds and terminators and returns
//!   [`WireError::MalformedRecord`] instead of panicking.
//! - Union regions are reinterpreted only through their command tag.
//!
//! No I/O happens here; issuing the requests is the fabric crate's job.

pub mod bridge;
pub mod error;
pub mod fake;
pub mod ifname;

pub use bridge::{
    decode_snapshot, BridgeMemberRecord, MemberFlags, StpRole, StpState, BRIDGE_MEMBER_RECORD_LEN,
};
pub use error::WireError;
pub use fake::{
    decode_peer_reply, encode_get_peer, FakeGetCommand, FakeRequest, FakeSetCommand,
    MediaDescriptor, FAKE_REQUEST_LEN, MEDIA_LIST_MAX,
};
pub use ifname::{InterfaceName, IFNAMSIZ, IFNAME_MAX};
