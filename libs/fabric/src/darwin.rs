//! Darwin implementation of the kernel control plane.
//!
//! Every operation opens an `AF_LOCAL` datagram socket, issues one ioctl,
//! and releases the socket again. The socket is held as an [`OwnedFd`] so
//! it is closed on every exit path, including errors; control sockets are a
//! finite kernel resource.
//!
//! Only the raw structures the ioctls require live here (`ifdrv`, `ifreq`,
//! and the 4-byte-packed `ifbifconf`); the payloads they point at are
//! produced and consumed by `vif-wire`.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use libc::{c_char, c_short, c_ulong, c_void};
use tracing::trace;
use vif_wire::{InterfaceName, IFNAMSIZ};

use crate::channel::Kernel;
use crate::error::ChannelError;
use crate::ioc;

/// `struct ifdrv`: driver-specific request envelope.
#[repr(C)]
struct IfDrv {
    ifd_name: [c_char; IFNAMSIZ],
    ifd_cmd: c_ulong,
    ifd_len: usize,
    ifd_data: *mut c_void,
}

/// `struct ifbifconf`: bridge member enumeration request. Packed to 4 bytes
/// like the rest of the bridge ABI.
#[repr(C, packed(4))]
struct IfBifConf {
    ifbic_len: u32,
    ifbic_buf: *mut c_void,
}

/// `struct ifreq` carrying the flag word.
#[repr(C)]
struct IfReqFlags {
    ifr_name: [c_char; IFNAMSIZ],
    ifr_flags: c_short,
    _pad: [u8; 14],
}

/// `struct ifreq` with an untouched request union.
#[repr(C)]
struct IfReqRaw {
    ifr_name: [c_char; IFNAMSIZ],
    _ifru: [u8; 16],
}

/// The live Darwin control plane.
#[derive(Debug, Default)]
pub struct DarwinKernel;

impl DarwinKernel {
    /// Create a handle to the host control plane.
    pub fn new() -> Self {
        Self
    }
}

fn control_socket() -> Result<OwnedFd, ChannelError> {
    let fd = unsafe { libc::socket(libc::AF_LOCAL, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(ChannelError::Socket(io::Error::last_os_error()));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn ioctl(
    fd: &OwnedFd,
    request: u64,
    arg: *mut c_void,
    op: &'static str,
) -> Result<(), ChannelError> {
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), request as c_ulong, arg) };
    if rc < 0 {
        let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
        return Err(ChannelError::from_errno(op, errno));
    }
    Ok(())
}

/// Write a validated name into a NUL-padded `c_char` field.
fn encode_name(dest: &mut [c_char; IFNAMSIZ], name: &InterfaceName) {
    for (slot, byte) in dest.iter_mut().zip(name.as_str().bytes()) {
        *slot = byte as c_char;
    }
}

fn new_ifdrv(name: &InterfaceName, cmd: u32) -> IfDrv {
    let mut ifd: IfDrv = unsafe { std::mem::zeroed() };
    encode_name(&mut ifd.ifd_name, name);
    ifd.ifd_cmd = cmd as c_ulong;
    ifd
}

impl Kernel for DarwinKernel {
    fn drv_set(&self, name: &InterfaceName, cmd: u32, payload: &[u8]) -> Result<(), ChannelError> {
        let fd = control_socket()?;
        let mut ifd = new_ifdrv(name, cmd);
        ifd.ifd_len = payload.len();
        ifd.ifd_data = payload.as_ptr() as *mut c_void;
        trace!(interface = %name, cmd, len = payload.len(), "SIOCSDRVSPEC");
        ioctl(
            &fd,
            ioc::SIOCSDRVSPEC,
            &mut ifd as *mut IfDrv as *mut c_void,
            "drv_set",
        )
    }

    fn drv_get(
        &self,
        name: &InterfaceName,
        cmd: u32,
        payload: &mut [u8],
    ) -> Result<(), ChannelError> {
        let fd = control_socket()?;
        let mut ifd = new_ifdrv(name, cmd);
        ifd.ifd_len = payload.len();
        ifd.ifd_data = payload.as_mut_ptr() as *mut c_void;
        trace!(interface = %name, cmd, len = payload.len(), "SIOCGDRVSPEC");
        ioctl(
            &fd,
            ioc::SIOCGDRVSPEC,
            &mut ifd as *mut IfDrv as *mut c_void,
            "drv_get",
        )
    }

    fn drv_list(
        &self,
        name: &InterfaceName,
        cmd: u32,
        buf: &mut [u8],
    ) -> Result<u32, ChannelError> {
        let fd = control_socket()?;
        let mut conf = IfBifConf {
            ifbic_len: buf.len() as u32,
            ifbic_buf: buf.as_mut_ptr() as *mut c_void,
        };
        let mut ifd = new_ifdrv(name, cmd);
        ifd.ifd_len = std::mem::size_of::<IfBifConf>();
        ifd.ifd_data = &mut conf as *mut IfBifConf as *mut c_void;
        trace!(interface = %name, cmd, capacity = buf.len(), "SIOCGDRVSPEC (enumerate)");
        ioctl(
            &fd,
            ioc::SIOCGDRVSPEC,
            &mut ifd as *mut IfDrv as *mut c_void,
            "drv_list",
        )?;
        let reported = conf.ifbic_len;
        Ok(reported)
    }

    fn create_interface(&self, name: &InterfaceName) -> Result<(), ChannelError> {
        let fd = control_socket()?;
        let mut req: IfReqRaw = unsafe { std::mem::zeroed() };
        encode_name(&mut req.ifr_name, name);
        ioctl(
            &fd,
            ioc::SIOCIFCREATE2,
            &mut req as *mut IfReqRaw as *mut c_void,
            "create_interface",
        )
    }

    fn destroy_interface(&self, name: &InterfaceName) -> Result<(), ChannelError> {
        let fd = control_socket()?;
        let mut req: IfReqRaw = unsafe { std::mem::zeroed() };
        encode_name(&mut req.ifr_name, name);
        ioctl(
            &fd,
            ioc::SIOCIFDESTROY,
            &mut req as *mut IfReqRaw as *mut c_void,
            "destroy_interface",
        )
    }

    fn interface_flags(&self, name: &InterfaceName) -> Result<u16, ChannelError> {
        let fd = control_socket()?;
        let mut req: IfReqFlags = unsafe { std::mem::zeroed() };
        encode_name(&mut req.ifr_name, name);
        ioctl(
            &fd,
            ioc::SIOCGIFFLAGS,
            &mut req as *mut IfReqFlags as *mut c_void,
            "interface_flags",
        )?;
        Ok(req.ifr_flags as u16)
    }

    fn set_interface_flags(&self, name: &InterfaceName, flags: u16) -> Result<(), ChannelError> {
        let fd = control_socket()?;
        let mut req: IfReqFlags = unsafe { std::mem::zeroed() };
        encode_name(&mut req.ifr_name, name);
        req.ifr_flags = flags as c_short;
        ioctl(
            &fd,
            ioc::SIOCSIFFLAGS,
            &mut req as *mut IfReqFlags as *mut c_void,
            "set_interface_flags",
        )
    }

    fn interface_names(&self) -> Result<Vec<InterfaceName>, ChannelError> {
        let list = unsafe { libc::if_nameindex() };
        if list.is_null() {
            return Err(ChannelError::Socket(io::Error::last_os_error()));
        }
        let mut names = Vec::new();
        let mut i = 0;
        loop {
            let entry = unsafe { *list.add(i) };
            if entry.if_index == 0 || entry.if_name.is_null() {
                break;
            }
            let raw = unsafe { std::ffi::CStr::from_ptr(entry.if_name) };
            if let Some(name) = raw
                .to_str()
                .ok()
                .and_then(|s| InterfaceName::new(s).ok())
            {
                names.push(name);
            }
            i += 1;
        }
        unsafe { libc::if_freenameindex(list) };
        Ok(names)
    }
}
