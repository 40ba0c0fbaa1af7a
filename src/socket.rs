//! Thin RAII wrappers over raw socket descriptors.
//!
//! Sockets are opened non-blocking and close-on-exec; receives report
//! "would block" as `None` so ingest loops can drain a queue without
//! treating emptiness as a failure.

use std::io;
use std::mem;
use std::net::Ipv6Addr;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

const ICMP6_FILTER: libc::c_int = 1;

/// Kernel ICMPv6 type filter: a set bit blocks the type.
#[repr(C)]
struct Icmp6Filter {
    data: [u32; 8],
}

pub struct Socket {
    fd: OwnedFd,
}

impl Socket {
    pub fn open(domain: libc::c_int, ty: libc::c_int, protocol: libc::c_int) -> io::Result<Self> {
        let fd = unsafe {
            libc::socket(
                domain,
                ty | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                protocol,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Bind to a device by name (ICMPv6 sockets).
    pub fn bind_device(&self, name: &str) -> io::Result<()> {
        let ret = unsafe {
            libc::setsockopt(
                self.raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_BINDTODEVICE,
                name.as_ptr() as *const libc::c_void,
                name.len() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Bind to a device by index (packet sockets).
    pub fn bind_packet(&self, ifindex: u32) -> io::Result<()> {
        let mut sll: libc::sockaddr_ll = unsafe { mem::zeroed() };
        sll.sll_family = libc::AF_PACKET as libc::c_ushort;
        sll.sll_protocol = (libc::ETH_P_IPV6 as u16).to_be();
        sll.sll_ifindex = ifindex as libc::c_int;
        self.bind_raw(&sll)
    }

    /// Bind a netlink socket, joining the given multicast groups.
    pub fn bind_netlink(&self, groups: u32) -> io::Result<()> {
        let mut snl: libc::sockaddr_nl = unsafe { mem::zeroed() };
        snl.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        snl.nl_groups = groups;
        self.bind_raw(&snl)
    }

    fn bind_raw<T>(&self, sa: &T) -> io::Result<()> {
        let ret = unsafe {
            libc::bind(
                self.raw_fd(),
                sa as *const T as *const libc::sockaddr,
                mem::size_of::<T>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Set both unicast and multicast hop limits (ND requires 255).
    pub fn set_hop_limit(&self, hops: libc::c_int) -> io::Result<()> {
        self.setsockopt(libc::IPPROTO_IPV6, libc::IPV6_MULTICAST_HOPS, &hops)?;
        self.setsockopt(libc::IPPROTO_IPV6, libc::IPV6_UNICAST_HOPS, &hops)
    }

    /// Restrict an ICMPv6 socket to a single message type.
    pub fn set_icmp6_filter(&self, pass: u8) -> io::Result<()> {
        let mut filter = Icmp6Filter {
            data: [u32::MAX; 8],
        };
        filter.data[(pass >> 5) as usize] &= !(1u32 << (pass & 31));
        self.setsockopt(libc::IPPROTO_ICMPV6, ICMP6_FILTER, &filter)
    }

    /// Attach a classic BPF program to the socket.
    pub fn attach_filter(&self, prog: &[libc::sock_filter]) -> io::Result<()> {
        let fprog = libc::sock_fprog {
            len: prog.len() as libc::c_ushort,
            filter: prog.as_ptr() as *mut libc::sock_filter,
        };
        self.setsockopt(libc::SOL_SOCKET, libc::SO_ATTACH_FILTER, &fprog)
    }

    fn setsockopt<T>(&self, level: libc::c_int, name: libc::c_int, value: &T) -> io::Result<()> {
        let ret = unsafe {
            libc::setsockopt(
                self.raw_fd(),
                level,
                name,
                value as *const T as *const libc::c_void,
                mem::size_of::<T>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Send a datagram to an IPv6 address.
    pub fn send_to6(&self, buf: &[u8], daddr: Ipv6Addr) -> io::Result<usize> {
        let mut sin6: libc::sockaddr_in6 = unsafe { mem::zeroed() };
        sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
        sin6.sin6_addr.s6_addr = daddr.octets();
        self.send_to_raw(buf, &sin6)
    }

    /// Send a netlink request to the kernel.
    pub fn send_netlink(&self, buf: &[u8]) -> io::Result<usize> {
        let mut snl: libc::sockaddr_nl = unsafe { mem::zeroed() };
        snl.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        self.send_to_raw(buf, &snl)
    }

    fn send_to_raw<T>(&self, buf: &[u8], sa: &T) -> io::Result<usize> {
        let ret = unsafe {
            libc::sendto(
                self.raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                0,
                sa as *const T as *const libc::sockaddr,
                mem::size_of::<T>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as usize)
    }

    /// Receive a datagram; `None` when the queue is empty.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let ret = unsafe {
            libc::recv(
                self.raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }
        Ok(Some(ret as usize))
    }

    /// Receive a datagram together with its IPv6 source address.
    pub fn recv_from6(&self, buf: &mut [u8]) -> io::Result<Option<(usize, Ipv6Addr)>> {
        let mut sin6: libc::sockaddr_in6 = unsafe { mem::zeroed() };
        let mut sl = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
        let ret = unsafe {
            libc::recvfrom(
                self.raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                &mut sin6 as *mut libc::sockaddr_in6 as *mut libc::sockaddr,
                &mut sl,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }
        let saddr = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
        Ok(Some((ret as usize, saddr)))
    }

    /// Block until the socket is readable or the timeout elapses.
    pub fn wait_readable(&self, timeout_ms: u16) -> io::Result<bool> {
        let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(timeout_ms)) {
            Ok(n) => Ok(n > 0),
            Err(nix::errno::Errno::EINTR) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket").field("fd", &self.raw_fd()).finish()
    }
}
