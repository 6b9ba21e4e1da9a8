//! Control channel to the kernel.
//!
//! [`Kernel`] is the seam over the kernel's interface control plane: driver
//! get/set/enumerate requests plus the interface lifecycle primitives. The
//! real Darwin implementation lives in `darwin`; tests drive the same trait
//! through [`crate::mock::MockKernel`].
//!
//! [`Channel`] binds a kernel to one named interface and applies the retry
//! policy: get paths are retried on transient conditions with bounded
//! exponential backoff, set paths are never retried (the kernel may have
//! mutated state with no rollback, so a blind replay is not safe).

use std::time::Duration;

use tracing::debug;
use vif_wire::InterfaceName;

use crate::error::ChannelError;

/// Operations the kernel control plane offers per interface.
///
/// Buffers are opaque here; producing and interpreting them is the wire
/// codec's job.
pub trait Kernel: Send + Sync {
    /// Issue a driver set request against `name`.
    fn drv_set(&self, name: &InterfaceName, cmd: u32, payload: &[u8]) -> Result<(), ChannelError>;

    /// Issue a driver get request against `name`; the kernel fills `payload`.
    fn drv_get(
        &self,
        name: &InterfaceName,
        cmd: u32,
        payload: &mut [u8],
    ) -> Result<(), ChannelError>;

    /// Issue a driver enumeration request against `name`.
    ///
    /// The kernel fills `buf` with as many whole records as fit and returns
    /// the byte length of the full result set, which may exceed `buf.len()`.
    /// Callers detect a partial read by comparing the report to the buffer.
    fn drv_list(&self, name: &InterfaceName, cmd: u32, buf: &mut [u8]) -> Result<u32, ChannelError>;

    /// Create a virtual interface with the given name.
    fn create_interface(&self, name: &InterfaceName) -> Result<(), ChannelError>;

    /// Destroy the named interface.
    fn destroy_interface(&self, name: &InterfaceName) -> Result<(), ChannelError>;

    /// Read the interface flag word.
    fn interface_flags(&self, name: &InterfaceName) -> Result<u16, ChannelError>;

    /// Replace the interface flag word.
    fn set_interface_flags(&self, name: &InterfaceName, flags: u16) -> Result<(), ChannelError>;

    /// Names of all interfaces currently configured on the host.
    fn interface_names(&self) -> Result<Vec<InterfaceName>, ChannelError>;
}

/// Default number of attempts for a transient get path.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Default first backoff delay.
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(5);

/// Default backoff ceiling.
pub const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_millis(100);

/// Bounded exponential backoff for transient get failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,

    /// Delay before the first retry; doubles each attempt.
    pub base_delay: Duration,

    /// Ceiling for the doubled delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_ATTEMPTS,
            base_delay: DEFAULT_RETRY_BASE_DELAY,
            max_delay: DEFAULT_RETRY_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Delay to sleep after the given 1-based failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// A control association with one named interface.
pub struct Channel<'k> {
    kernel: &'k dyn Kernel,
    name: InterfaceName,
    retry: RetryPolicy,
}

impl<'k> Channel<'k> {
    /// Bind a kernel to one interface name.
    pub fn new(kernel: &'k dyn Kernel, name: InterfaceName, retry: RetryPolicy) -> Self {
        Self {
            kernel,
            name,
            retry,
        }
    }

    /// The interface this channel addresses.
    pub fn name(&self) -> &InterfaceName {
        &self.name
    }

    /// Issue a set request. Never retried.
    pub fn set(&self, cmd: u32, payload: &[u8]) -> Result<(), ChannelError> {
        self.kernel.drv_set(&self.name, cmd, payload)
    }

    /// Issue a get request, retrying transient failures within the policy.
    pub fn get(&self, cmd: u32, payload: &mut [u8]) -> Result<(), ChannelError> {
        self.with_retry("drv_get", |kernel, name| kernel.drv_get(name, cmd, payload))
    }

    /// Issue an enumeration request, retrying transient failures.
    pub fn list(&self, cmd: u32, buf: &mut [u8]) -> Result<u32, ChannelError> {
        self.with_retry("drv_list", |kernel, name| kernel.drv_list(name, cmd, buf))
    }

    fn with_retry<T>(
        &self,
        op: &'static str,
        mut call: impl FnMut(&dyn Kernel, &InterfaceName) -> Result<T, ChannelError>,
    ) -> Result<T, ChannelError> {
        let mut attempt = 1u32;
        loop {
            match call(self.kernel, &self.name) {
                Err(err) if err.is_transient() => {
                    if attempt >= self.retry.max_attempts {
                        return Err(ChannelError::RetriesExhausted {
                            op,
                            attempts: attempt,
                            errno: err.errno().unwrap_or(0),
                        });
                    }
                    let delay = self.retry.delay_for(attempt);
                    debug!(
                        interface = %self.name,
                        op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Transient kernel condition, backing off"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::errno;
    use crate::mock::{MockKernel, MockOp};
    use vif_wire::fake::FakeGetCommand;
    use vif_wire::{encode_get_peer, FAKE_REQUEST_LEN};

    fn test_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn test_backoff_doubles_up_to_ceiling() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(25),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for(3), Duration::from_millis(25));
    }

    #[test]
    fn test_get_retries_transient_then_succeeds() {
        let kernel = MockKernel::new();
        let feth = InterfaceName::new("feth0").unwrap();
        kernel.add_fake(&feth);
        kernel.fail_times(
            MockOp::DrvGet {
                name: feth.clone(),
                cmd: FakeGetCommand::GetPeer.as_raw(),
            },
            errno::EBUSY,
            2,
        );

        let channel = Channel::new(&kernel, feth.clone(), test_policy());
        let mut buf = encode_get_peer();
        channel
            .get(FakeGetCommand::GetPeer.as_raw(), &mut buf)
            .unwrap();
        assert_eq!(kernel.calls().drv_get, 3);
    }

    #[test]
    fn test_get_gives_up_after_bounded_attempts() {
        let kernel = MockKernel::new();
        let feth = InterfaceName::new("feth0").unwrap();
        kernel.add_fake(&feth);
        kernel.fail_times(
            MockOp::DrvGet {
                name: feth.clone(),
                cmd: FakeGetCommand::GetPeer.as_raw(),
            },
            errno::EBUSY,
            10,
        );

        let channel = Channel::new(&kernel, feth.clone(), test_policy());
        let mut buf = [0u8; FAKE_REQUEST_LEN];
        let err = channel
            .get(FakeGetCommand::GetPeer.as_raw(), &mut buf)
            .unwrap_err();
        assert!(matches!(
            err,
            ChannelError::RetriesExhausted { attempts: 3, .. }
        ));
        assert_eq!(kernel.calls().drv_get, 3);
    }

    #[test]
    fn test_set_is_never_retried() {
        let kernel = MockKernel::new();
        let feth = InterfaceName::new("feth0").unwrap();
        kernel.add_fake(&feth);
        kernel.fail_times(
            MockOp::DrvSet {
                name: feth.clone(),
                cmd: 3,
            },
            errno::EBUSY,
            1,
        );

        let channel = Channel::new(&kernel, feth.clone(), test_policy());
        let err = channel.set(3, &[0u8; FAKE_REQUEST_LEN]).unwrap_err();
        assert!(err.is_transient());
        assert_eq!(kernel.calls().drv_set, 1);
    }

    #[test]
    fn test_rejection_is_not_retried() {
        let kernel = MockKernel::new();
        let feth = InterfaceName::new("feth0").unwrap();
        kernel.add_fake(&feth);
        kernel.fail_times(
            MockOp::DrvGet {
                name: feth.clone(),
                cmd: FakeGetCommand::GetPeer.as_raw(),
            },
            errno::EINVAL,
            1,
        );

        let channel = Channel::new(&kernel, feth.clone(), test_policy());
        let mut buf = [0u8; FAKE_REQUEST_LEN];
        let err = channel
            .get(FakeGetCommand::GetPeer.as_raw(), &mut buf)
            .unwrap_err();
        assert!(matches!(err, ChannelError::Rejected { .. }));
        assert_eq!(kernel.calls().drv_get, 1);
    }
}
