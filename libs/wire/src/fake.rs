//! Fake-ethernet request frames.
//!
//! The kernel configures a fake-ethernet interface through a single
//! fixed-size request frame: four reserved 64-bit words followed by a
//! 128-byte union whose interpretation is selected by the command tag
//! carried alongside the frame. The union is size-stable across every tag,
//! so a frame is always exactly [`FAKE_REQUEST_LEN`] bytes.
//!
//! ```text
//! offset  width  field
//!      0     32  reserved (4 x u64), zero on write, ignored on read
//!     32    128  union: peer name | media descriptor | stall flag | raw
//! ```
//!
//! The union is never exposed directly. [`FakeRequest`] is the only view of
//! the set path and [`decode_peer_reply`] the only view of the get path;
//! both reinterpret bytes strictly by tag.

use crate::error::WireError;
use crate::ifname::{InterfaceName, IFNAMSIZ};

/// Encoded size of a fake-interface request frame.
pub const FAKE_REQUEST_LEN: usize = 160;

/// Size of the command union region.
pub const FAKE_UNION_LEN: usize = 128;

/// Offset of the union region within a frame.
const UNION_OFFSET: usize = 32;

/// Maximum number of entries in a media list.
pub const MEDIA_LIST_MAX: usize = 27;

/// Offset of the media identifier list within the union.
const MEDIA_LIST_OFFSET: usize = 20;

/// Set-path command tags (`SIOCSDRVSPEC`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FakeSetCommand {
    None = 0,
    SetPeer = 1,
    SetMedia = 2,
    SetDequeueStall = 3,
}

impl FakeSetCommand {
    /// Map a raw command tag.
    pub fn from_raw(raw: u32) -> Result<Self, WireError> {
        match raw {
            0 => Ok(FakeSetCommand::None),
            1 => Ok(FakeSetCommand::SetPeer),
            2 => Ok(FakeSetCommand::SetMedia),
            3 => Ok(FakeSetCommand::SetDequeueStall),
            other => Err(WireError::UnknownCommand(other)),
        }
    }

    /// Raw command tag.
    pub fn as_raw(self) -> u32 {
        self as u32
    }
}

/// Get-path command tags (`SIOCGDRVSPEC`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FakeGetCommand {
    None = 0,
    GetPeer = 1,
}

impl FakeGetCommand {
    /// Raw command tag.
    pub fn as_raw(self) -> u32 {
        self as u32
    }
}

/// Simulated media selection for a fake-ethernet interface.
///
/// The list capacity is fixed by the wire structure; construction enforces
/// it so encoding can never overrun the union.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescriptor {
    current: i32,
    list: Vec<i32>,
}

impl MediaDescriptor {
    /// Build a descriptor, rejecting lists beyond the fixed capacity.
    pub fn new(current: i32, list: Vec<i32>) -> Result<Self, WireError> {
        if list.len() > MEDIA_LIST_MAX {
            return Err(WireError::TooManyMediaEntries {
                count: list.len(),
                max: MEDIA_LIST_MAX,
            });
        }
        Ok(Self { current, list })
    }

    /// Currently selected media identifier.
    pub fn current(&self) -> i32 {
        self.current
    }

    /// Available media identifiers.
    pub fn list(&self) -> &[i32] {
        &self.list
    }

    fn encode_into_union(&self, union: &mut [u8]) {
        union[0..4].copy_from_slice(&self.current.to_ne_bytes());
        union[4..8].copy_from_slice(&(self.list.len() as u32).to_ne_bytes());
        // 3 reserved u32 words at 8..20 stay zero.
        for (i, media) in self.list.iter().enumerate() {
            let at = MEDIA_LIST_OFFSET + i * 4;
            union[at..at + 4].copy_from_slice(&media.to_ne_bytes());
        }
    }

    fn decode_from_union(union: &[u8]) -> Result<Self, WireError> {
        let current = read_i32(union, 0);
        let count = read_u32(union, 4) as usize;
        if count > MEDIA_LIST_MAX {
            return Err(WireError::MalformedRecord(format!(
                "media count {} exceeds capacity {}",
                count, MEDIA_LIST_MAX
            )));
        }
        let list = (0..count)
            .map(|i| read_i32(union, MEDIA_LIST_OFFSET + i * 4))
            .collect();
        Ok(Self { current, list })
    }
}

/// A set-path request with exactly one active payload.
///
/// The tagged union of the wire frame is represented as a sum type; reading
/// an arm the tag does not select is impossible by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeRequest {
    /// Attach the named interface as this interface's peer.
    SetPeer(InterfaceName),
    /// Clear the peer attachment (encoded as SET_PEER with an empty name).
    DetachPeer,
    /// Replace the simulated media list and selection.
    SetMedia(MediaDescriptor),
    /// Enable or disable dequeue stalling.
    SetDequeueStall(bool),
}

impl FakeRequest {
    /// The command tag that selects this request's union arm.
    pub fn command(&self) -> FakeSetCommand {
        match self {
            FakeRequest::SetPeer(_) | FakeRequest::DetachPeer => FakeSetCommand::SetPeer,
            FakeRequest::SetMedia(_) => FakeSetCommand::SetMedia,
            FakeRequest::SetDequeueStall(_) => FakeSetCommand::SetDequeueStall,
        }
    }

    /// Encode into a fresh frame.
    ///
    /// The reserved header words and every union byte outside the active arm
    /// are zero.
    pub fn encode(&self) -> [u8; FAKE_REQUEST_LEN] {
        let mut buf = [0u8; FAKE_REQUEST_LEN];
        let union = &mut buf[UNION_OFFSET..];
        match self {
            FakeRequest::SetPeer(peer) => {
                // Cannot fail: the name was validated at construction and
                // the union is larger than the name field.
                let _ = peer.encode_into(&mut union[..IFNAMSIZ]);
            }
            FakeRequest::DetachPeer => {
                // An all-zero name field asks the kernel to drop the peer.
            }
            FakeRequest::SetMedia(media) => media.encode_into_union(union),
            FakeRequest::SetDequeueStall(enabled) => {
                union[0..4].copy_from_slice(&u32::from(*enabled).to_ne_bytes());
            }
        }
        buf
    }

    /// Decode a frame as the arm selected by `command`.
    ///
    /// This is the only place request bytes are reinterpreted, and it never
    /// reads an arm other than the tagged one. Reserved header words are
    /// ignored.
    pub fn decode(command: FakeSetCommand, buf: &[u8]) -> Result<Self, WireError> {
        let union = frame_union(buf)?;
        match command {
            FakeSetCommand::None => Err(WireError::UnknownCommand(0)),
            FakeSetCommand::SetPeer => match InterfaceName::decode_opt(&union[..IFNAMSIZ])? {
                Some(peer) => Ok(FakeRequest::SetPeer(peer)),
                None => Ok(FakeRequest::DetachPeer),
            },
            FakeSetCommand::SetMedia => {
                Ok(FakeRequest::SetMedia(MediaDescriptor::decode_from_union(
                    union,
                )?))
            }
            FakeSetCommand::SetDequeueStall => {
                Ok(FakeRequest::SetDequeueStall(read_u32(union, 0) != 0))
            }
        }
    }
}

/// Encode a GET_PEER request frame (all zero; the kernel fills the reply).
pub fn encode_get_peer() -> [u8; FAKE_REQUEST_LEN] {
    [0u8; FAKE_REQUEST_LEN]
}

/// Decode a GET_PEER reply.
///
/// Returns `None` when the interface has no peer attached, which the kernel
/// reports as an empty name field, distinct from any error.
pub fn decode_peer_reply(buf: &[u8]) -> Result<Option<InterfaceName>, WireError> {
    let union = frame_union(buf)?;
    InterfaceName::decode_opt(&union[..IFNAMSIZ])
}

fn frame_union(buf: &[u8]) -> Result<&[u8], WireError> {
    if buf.len() < FAKE_REQUEST_LEN {
        return Err(WireError::MalformedRecord(format!(
            "fake-interface frame is {} bytes, expected {}",
            buf.len(),
            FAKE_REQUEST_LEN
        )));
    }
    Ok(&buf[UNION_OFFSET..UNION_OFFSET + FAKE_UNION_LEN])
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_ne_bytes(bytes)
}

fn read_i32(buf: &[u8], offset: usize) -> i32 {
    read_u32(buf, offset) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_peer_frame_layout() {
        let request = FakeRequest::SetPeer(InterfaceName::new("feth1").unwrap());
        let buf = request.encode();

        assert_eq!(buf.len(), FAKE_REQUEST_LEN);
        // Reserved header words are zero.
        assert!(buf[..UNION_OFFSET].iter().all(|&b| b == 0));
        assert_eq!(&buf[UNION_OFFSET..UNION_OFFSET + 5], b"feth1");
        assert!(buf[UNION_OFFSET + 5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_stall_flag_is_u32_at_union_start() {
        let buf = FakeRequest::SetDequeueStall(true).encode();
        assert_eq!(read_u32(&buf, UNION_OFFSET), 1);

        let buf = FakeRequest::SetDequeueStall(false).encode();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_media_round_trip() {
        let media = MediaDescriptor::new(6, vec![6, 11, 54, 1000]).unwrap();
        let request = FakeRequest::SetMedia(media.clone());
        let decoded = FakeRequest::decode(request.command(), &request.encode()).unwrap();
        assert_eq!(decoded, FakeRequest::SetMedia(media));
    }

    #[test]
    fn test_media_capacity_boundary() {
        assert!(MediaDescriptor::new(0, vec![1; MEDIA_LIST_MAX]).is_ok());
        assert_eq!(
            MediaDescriptor::new(0, vec![1; MEDIA_LIST_MAX + 1]).unwrap_err(),
            WireError::TooManyMediaEntries {
                count: 28,
                max: MEDIA_LIST_MAX
            }
        );
    }

    #[test]
    fn test_full_media_list_fits_union() {
        let media = MediaDescriptor::new(-1, (0..27).collect()).unwrap();
        let buf = FakeRequest::SetMedia(media).encode();
        // Last list entry ends exactly at the end of the frame.
        assert_eq!(read_i32(&buf, FAKE_REQUEST_LEN - 4), 26);
    }

    #[test]
    fn test_decode_follows_tag_not_bytes() {
        // A frame written as SET_PEER, decoded under its own tag only.
        let request = FakeRequest::SetPeer(InterfaceName::new("feth9").unwrap());
        let buf = request.encode();
        assert_eq!(
            FakeRequest::decode(FakeSetCommand::SetPeer, &buf).unwrap(),
            request
        );
        // Decoding under the stall tag reads the stall arm, never the name.
        assert_eq!(
            FakeRequest::decode(FakeSetCommand::SetDequeueStall, &buf).unwrap(),
            FakeRequest::SetDequeueStall(true)
        );
    }

    #[test]
    fn test_detach_peer_encodes_empty_name() {
        let buf = FakeRequest::DetachPeer.encode();
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(
            FakeRequest::decode(FakeSetCommand::SetPeer, &buf).unwrap(),
            FakeRequest::DetachPeer
        );
    }

    #[test]
    fn test_decode_ignores_reserved_header() {
        let mut buf = FakeRequest::SetDequeueStall(true).encode();
        buf[..UNION_OFFSET].fill(0xaa);
        assert_eq!(
            FakeRequest::decode(FakeSetCommand::SetDequeueStall, &buf).unwrap(),
            FakeRequest::SetDequeueStall(true)
        );
    }

    #[test]
    fn test_peer_reply_decoding() {
        let mut buf = encode_get_peer();
        assert_eq!(decode_peer_reply(&buf).unwrap(), None);

        InterfaceName::new("feth3")
            .unwrap()
            .encode_into(&mut buf[UNION_OFFSET..UNION_OFFSET + IFNAMSIZ])
            .unwrap();
        assert_eq!(
            decode_peer_reply(&buf).unwrap(),
            Some(InterfaceName::new("feth3").unwrap())
        );
    }

    #[test]
    fn test_media_decode_rejects_overlong_count() {
        let mut buf = FakeRequest::SetMedia(MediaDescriptor::new(0, vec![]).unwrap()).encode();
        buf[UNION_OFFSET + 4..UNION_OFFSET + 8].copy_from_slice(&28u32.to_ne_bytes());
        assert!(matches!(
            FakeRequest::decode(FakeSetCommand::SetMedia, &buf),
            Err(WireError::MalformedRecord(_))
        ));
    }

    #[test]
    fn test_short_frame_is_malformed() {
        let buf = [0u8; FAKE_REQUEST_LEN - 1];
        assert!(matches!(
            FakeRequest::decode(FakeSetCommand::SetPeer, &buf),
            Err(WireError::MalformedRecord(_))
        ));
    }
}
