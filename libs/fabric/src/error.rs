//! Error taxonomy for the fabric control plane.
//!
//! [`ChannelError`] classifies failures at the control-channel boundary:
//! transient kernel conditions, semantic rejections, and socket allocation
//! failures. [`FabricError`] is the manager-level taxonomy; codec and channel
//! errors never reach callers unwrapped — they are classified here first.

use thiserror::Error;
use vif_wire::{InterfaceName, WireError};

/// Errno values used by the control plane.
///
/// These are the Darwin numbers. They are defined locally rather than pulled
/// from `libc` so the mock kernel and the managers agree on every host.
pub mod errno {
    pub const ENOENT: i32 = 2;
    pub const EINTR: i32 = 4;
    pub const ENXIO: i32 = 6;
    pub const ENOMEM: i32 = 12;
    pub const EBUSY: i32 = 16;
    pub const EEXIST: i32 = 17;
    pub const ENODEV: i32 = 19;
    pub const EINVAL: i32 = 22;
    pub const EAGAIN: i32 = 35;
    pub const ENOBUFS: i32 = 55;
    pub const ETIMEDOUT: i32 = 60;
}

/// Returns true for errno values worth retrying on a get path.
pub fn errno_is_transient(errno: i32) -> bool {
    matches!(
        errno,
        errno::EINTR | errno::EBUSY | errno::EAGAIN | errno::ETIMEDOUT
    )
}

/// Failures at the control-channel boundary.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// A control socket could not be allocated.
    #[error("control socket unavailable: {0}")]
    Socket(#[source] std::io::Error),

    /// The kernel reported a momentary condition that may clear on retry.
    #[error("{op} hit a transient kernel condition (errno {errno})")]
    Busy { op: &'static str, errno: i32 },

    /// The kernel rejected the request outright.
    #[error("{op} rejected by kernel (errno {errno})")]
    Rejected { op: &'static str, errno: i32 },

    /// A get path stayed transient through every allowed attempt.
    #[error("{op} still failing after {attempts} attempts (errno {errno})")]
    RetriesExhausted {
        op: &'static str,
        attempts: u32,
        errno: i32,
    },
}

impl ChannelError {
    /// Classify a raw errno from a control call.
    pub fn from_errno(op: &'static str, errno: i32) -> Self {
        if errno_is_transient(errno) {
            ChannelError::Busy { op, errno }
        } else {
            ChannelError::Rejected { op, errno }
        }
    }

    /// Returns true if a retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChannelError::Busy { .. })
    }

    /// The kernel errno, if one was reported.
    pub fn errno(&self) -> Option<i32> {
        match self {
            ChannelError::Socket(err) => err.raw_os_error(),
            ChannelError::Busy { errno, .. }
            | ChannelError::Rejected { errno, .. }
            | ChannelError::RetriesExhausted { errno, .. } => Some(*errno),
        }
    }
}

/// Manager-level errors.
#[derive(Debug, Error)]
pub enum FabricError {
    /// A structure could not be encoded or decoded.
    #[error(transparent)]
    Encoding(#[from] WireError),

    /// The kernel's response is inconsistent with the control protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The interface is already a member of the bridge.
    #[error("{member} is already a member of bridge {bridge}")]
    AlreadyMember {
        bridge: InterfaceName,
        member: InterfaceName,
    },

    /// The interface is not a member of the bridge.
    #[error("{member} is not a member of bridge {bridge}")]
    NotAMember {
        bridge: InterfaceName,
        member: InterfaceName,
    },

    /// The named interface does not resolve to a live interface.
    #[error("no such interface: {0}")]
    NoSuchInterface(InterfaceName),

    /// The membership snapshot kept growing past the resized buffer.
    #[error("membership snapshot stale: sized for {sized} bytes, kernel reported {reported}")]
    SnapshotStale { sized: usize, reported: usize },

    /// The fake interface is already peered with another interface.
    #[error("{name} is already peered with {peer}")]
    PeerConflict {
        name: InterfaceName,
        peer: InterfaceName,
    },

    /// Every candidate fake-interface name is taken.
    #[error("no free fake-interface name under {prefix}0..{prefix}{limit}")]
    FakeNamesExhausted { prefix: String, limit: u32 },

    /// A pairing for this guest interface is already being managed.
    #[error("a pairing for {0} already exists")]
    PairingExists(InterfaceName),

    /// No pairing is being managed for this guest interface.
    #[error("no pairing for {0}")]
    PairingNotFound(InterfaceName),

    /// The kernel returned a semantic error with no more specific mapping.
    #[error("kernel rejected {op} on {name} (errno {errno})")]
    KernelRejected {
        op: &'static str,
        name: InterfaceName,
        errno: i32,
    },

    /// A transient kernel condition survived the channel's bounded retries.
    #[error("transient kernel failure")]
    Transient(#[source] ChannelError),

    /// Control-channel resources could not be allocated.
    #[error("control resources exhausted")]
    ResourceExhausted(#[source] ChannelError),
}

impl FabricError {
    /// Classify a channel error that has no operation-specific mapping.
    pub fn from_channel(err: ChannelError, op: &'static str, name: &InterfaceName) -> Self {
        match err {
            ChannelError::Socket(_) => FabricError::ResourceExhausted(err),
            ChannelError::Busy { .. } | ChannelError::RetriesExhausted { .. } => {
                FabricError::Transient(err)
            }
            ChannelError::Rejected { errno, .. } => FabricError::KernelRejected {
                op,
                name: name.clone(),
                errno,
            },
        }
    }

    /// Returns true if the caller may reasonably retry the whole operation.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FabricError::Transient(_) | FabricError::SnapshotStale { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_classification() {
        assert!(ChannelError::from_errno("get", errno::EBUSY).is_transient());
        assert!(ChannelError::from_errno("get", errno::EINTR).is_transient());
        assert!(!ChannelError::from_errno("set", errno::EEXIST).is_transient());
        assert!(!ChannelError::from_errno("set", errno::EINVAL).is_transient());
    }

    #[test]
    fn test_channel_to_fabric_classification() {
        let name = InterfaceName::new("bridge0").unwrap();

        let err = FabricError::from_channel(
            ChannelError::RetriesExhausted {
                op: "get",
                attempts: 3,
                errno: errno::EBUSY,
            },
            "get",
            &name,
        );
        assert!(matches!(err, FabricError::Transient(_)));

        let err = FabricError::from_channel(
            ChannelError::Socket(std::io::Error::from_raw_os_error(errno::ENOBUFS)),
            "open",
            &name,
        );
        assert!(matches!(err, FabricError::ResourceExhausted(_)));

        let err = FabricError::from_channel(
            ChannelError::Rejected {
                op: "set",
                errno: errno::EINVAL,
            },
            "set",
            &name,
        );
        assert!(matches!(
            err,
            FabricError::KernelRejected {
                errno: errno::EINVAL,
                ..
            }
        ));
    }
}
