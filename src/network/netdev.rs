//! Interface configuration through the classic `SIOC*` ioctls.

use std::ffi::{c_char, c_int, c_short, c_ulong, c_void};
use std::mem;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr;

use crate::config::ConfigError;
use crate::error::{bail, bail_errno, Result};

// From <linux/sockios.h> and <net/route.h>.
const SIOCADDRT: c_ulong = 0x890B;
const SIOCGIFFLAGS: c_ulong = 0x8913;
const SIOCSIFFLAGS: c_ulong = 0x8914;
const SIOCSIFADDR: c_ulong = 0x8916;
const SIOCSIFNETMASK: c_ulong = 0x891C;
const SIOCSIFMTU: c_ulong = 0x8922;
const SIOCSIFNAME: c_ulong = 0x8923;
const RTF_UP: u16 = 0x0001;
const RTF_GATEWAY: u16 = 0x0002;

const IFNAMSIZ: usize = 16;

/// `struct ifreq`: an interface name followed by a 24-byte union.
#[repr(C)]
struct IfReq {
    name: [c_char; IFNAMSIZ],
    ifru: [u8; 24],
}

/// `struct rtentry` from `<net/route.h>`.
#[repr(C)]
struct RtEntry {
    rt_pad1: c_ulong,
    rt_dst: libc::sockaddr,
    rt_gateway: libc::sockaddr,
    rt_genmask: libc::sockaddr,
    rt_flags: u16,
    rt_pad2: c_short,
    rt_pad3: c_ulong,
    rt_pad4: *mut c_void,
    rt_metric: c_short,
    rt_dev: *mut c_char,
    rt_mtu: c_ulong,
    rt_window: c_ulong,
    rt_irtt: u16,
}

/// A control socket for configuring interfaces in the current network namespace.
pub struct NetDev {
    sock: OwnedFd,
}

impl NetDev {
    pub fn open() -> Result<NetDev> {
        let fd @ 0.. =
            (unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) })
        else {
            bail_errno!("failed to open interface control socket");
        };
        Ok(NetDev {
            sock: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    fn ioctl(&self, request: c_ulong, arg: *mut c_void, what: &'static str) -> Result<()> {
        let 0.. = (unsafe { libc::ioctl(self.sock.as_raw_fd(), request as _, arg) }) else {
            bail_errno!(what);
        };
        Ok(())
    }

    /// Bring an interface up.
    pub fn set_up(&self, name: &str) -> Result<()> {
        let mut req = ifreq(name)?;
        self.ioctl(SIOCGIFFLAGS, ptr_of(&mut req), "SIOCGIFFLAGS failed")?;
        let flags = c_short::from_ne_bytes([req.ifru[0], req.ifru[1]]) | libc::IFF_UP as c_short;
        req.ifru[..2].copy_from_slice(&flags.to_ne_bytes());
        self.ioctl(SIOCSIFFLAGS, ptr_of(&mut req), "SIOCSIFFLAGS failed")
    }

    /// Rename an interface. The interface must be down.
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut req = ifreq(from)?;
        let new_name = ifreq(to)?.name;
        for (dst, src) in req.ifru.iter_mut().zip(new_name.iter()) {
            *dst = *src as u8;
        }
        self.ioctl(SIOCSIFNAME, ptr_of(&mut req), "SIOCSIFNAME failed")
    }

    pub fn set_mtu(&self, name: &str, mtu: u32) -> Result<()> {
        let mut req = ifreq(name)?;
        req.ifru[..4].copy_from_slice(&(mtu as c_int).to_ne_bytes());
        self.ioctl(SIOCSIFMTU, ptr_of(&mut req), "SIOCSIFMTU failed")
    }

    /// Assign an IPv4 address and netmask.
    pub fn set_ipv4(&self, name: &str, addr: Ipv4Addr, prefix_len: u8) -> Result<()> {
        let mut req = ifreq(name)?;
        write_sockaddr(&mut req.ifru, addr);
        self.ioctl(SIOCSIFADDR, ptr_of(&mut req), "SIOCSIFADDR failed")?;

        let mut req = ifreq(name)?;
        write_sockaddr(&mut req.ifru, netmask(prefix_len));
        self.ioctl(SIOCSIFNETMASK, ptr_of(&mut req), "SIOCSIFNETMASK failed")
    }

    /// Install `0.0.0.0/0 via gateway`.
    pub fn add_default_route(&self, gateway: Ipv4Addr) -> Result<()> {
        let mut route = RtEntry {
            rt_pad1: 0,
            rt_dst: sockaddr_in(Ipv4Addr::UNSPECIFIED),
            rt_gateway: sockaddr_in(gateway),
            rt_genmask: sockaddr_in(Ipv4Addr::UNSPECIFIED),
            rt_flags: RTF_UP | RTF_GATEWAY,
            rt_pad2: 0,
            rt_pad3: 0,
            rt_pad4: ptr::null_mut(),
            rt_metric: 0,
            rt_dev: ptr::null_mut(),
            rt_mtu: 0,
            rt_window: 0,
            rt_irtt: 0,
        };
        self.ioctl(
            SIOCADDRT,
            &mut route as *mut RtEntry as *mut c_void,
            "SIOCADDRT failed",
        )
    }
}

fn ptr_of(req: &mut IfReq) -> *mut c_void {
    req as *mut IfReq as *mut c_void
}

fn ifreq(name: &str) -> Result<IfReq> {
    if name.is_empty() || name.len() >= IFNAMSIZ || name.contains('\0') {
        bail!("invalid interface name");
    }
    let mut req = IfReq {
        name: [0; IFNAMSIZ],
        ifru: [0; 24],
    };
    for (dst, src) in req.name.iter_mut().zip(name.bytes()) {
        *dst = src as c_char;
    }
    Ok(req)
}

fn sockaddr_in(addr: Ipv4Addr) -> libc::sockaddr {
    let mut raw: libc::sockaddr = unsafe { mem::zeroed() };
    let mut bytes = [0u8; 16];
    write_sockaddr(&mut bytes, addr);
    unsafe {
        ptr::copy_nonoverlapping(
            bytes.as_ptr(),
            &mut raw as *mut libc::sockaddr as *mut u8,
            mem::size_of::<libc::sockaddr>(),
        )
    };
    raw
}

/// Lay out a `sockaddr_in` at the start of `buf`.
fn write_sockaddr(buf: &mut [u8], addr: Ipv4Addr) {
    buf[..2].copy_from_slice(&(libc::AF_INET as u16).to_ne_bytes());
    buf[2..4].fill(0);
    buf[4..8].copy_from_slice(&addr.octets());
}

fn netmask(prefix_len: u8) -> Ipv4Addr {
    match prefix_len {
        0 => Ipv4Addr::UNSPECIFIED,
        n => Ipv4Addr::from(u32::MAX << (32 - u32::from(n.min(32)))),
    }
}

/// Parse `a.b.c.d/len`.
pub fn parse_cidr(cidr: &str) -> std::result::Result<(Ipv4Addr, u8), ConfigError> {
    let invalid = || ConfigError::InvalidAddress(cidr.to_owned());
    let (addr, len) = cidr.split_once('/').ok_or_else(invalid)?;
    let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
    let len: u8 = len.parse().map_err(|_| invalid())?;
    if len > 32 {
        return Err(invalid());
    }
    Ok((addr, len))
}
