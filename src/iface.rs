//! Per-device state: the ICMPv6 and packet sockets, link-layer address,
//! receive-mode flag bookkeeping, and the ND read/write operations.
//!
//! Every interface carries an ICMPv6 raw socket (probes out, adverts in
//! and out). Interfaces that serve a proxy additionally carry a packet
//! socket with a BPF filter that only lets neighbor solicitations through.

use std::io;
use std::mem;
use std::net::Ipv6Addr;
use std::os::fd::RawFd;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::packet;
use crate::proxy::ProxyId;
use crate::socket::Socket;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IfaceId(usize);

impl IfaceId {
    #[cfg(test)]
    pub(crate) const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }
}

const BPF_LD: u16 = 0x00;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;
const BPF_H: u16 = 0x08;
const BPF_B: u16 = 0x10;
const BPF_ABS: u16 = 0x20;
const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;

const ETHER_TYPE_OFF: u32 = 12;
const IP6_NEXT_HEADER_OFF: u32 = 14 + 6;
const ICMP6_TYPE_OFF: u32 = 14 + 40;

const fn bpf_stmt(code: u16, k: u32) -> libc::sock_filter {
    libc::sock_filter {
        code,
        jt: 0,
        jf: 0,
        k,
    }
}

const fn bpf_jeq(k: u32, jt: u8, jf: u8) -> libc::sock_filter {
    libc::sock_filter {
        code: BPF_JMP | BPF_JEQ | BPF_K,
        jt,
        jf,
        k,
    }
}

/// Accept a frame iff ether_type is IPv6, the IPv6 next header is ICMPv6,
/// and the ICMPv6 type is neighbor solicitation.
const SOLICIT_FILTER: [libc::sock_filter; 8] = [
    bpf_stmt(BPF_LD | BPF_H | BPF_ABS, ETHER_TYPE_OFF),
    bpf_jeq(libc::ETH_P_IPV6 as u32, 0, 5),
    bpf_stmt(BPF_LD | BPF_B | BPF_ABS, IP6_NEXT_HEADER_OFF),
    bpf_jeq(libc::IPPROTO_ICMPV6 as u32, 0, 3),
    bpf_stmt(BPF_LD | BPF_B | BPF_ABS, ICMP6_TYPE_OFF),
    bpf_jeq(packet::ND_NEIGHBOR_SOLICIT as u32, 0, 1),
    bpf_stmt(BPF_RET | BPF_K, u32::MAX),
    bpf_stmt(BPF_RET | BPF_K, 0),
];

#[repr(C)]
struct IfReqFlags {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

#[repr(C)]
struct IfReqHwAddr {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_hwaddr: libc::sockaddr,
    _pad: [u8; 8],
}

fn ifname_bytes(name: &str) -> [libc::c_char; libc::IFNAMSIZ] {
    let mut buf = [0 as libc::c_char; libc::IFNAMSIZ];
    for (i, b) in name.bytes().take(libc::IFNAMSIZ - 1).enumerate() {
        buf[i] = b as libc::c_char;
    }
    buf
}

fn hwaddr_of(fd: RawFd, name: &str) -> io::Result<[u8; 6]> {
    let mut ifr = IfReqHwAddr {
        ifr_name: ifname_bytes(name),
        ifr_hwaddr: unsafe { mem::zeroed() },
        _pad: [0; 8],
    };
    if unsafe { libc::ioctl(fd, libc::SIOCGIFHWADDR, &mut ifr) } < 0 {
        return Err(io::Error::last_os_error());
    }
    let mut mac = [0u8; 6];
    for (dst, src) in mac.iter_mut().zip(ifr.ifr_hwaddr.sa_data.iter()) {
        *dst = *src as u8;
    }
    Ok(mac)
}

fn if_indextoname(index: u32) -> io::Result<String> {
    let mut buf = [0 as libc::c_char; libc::IFNAMSIZ];
    if unsafe { libc::if_indextoname(index, buf.as_mut_ptr()) }.is_null() {
        return Err(io::Error::last_os_error());
    }
    let name = unsafe { std::ffi::CStr::from_ptr(buf.as_ptr()) };
    Ok(name.to_string_lossy().into_owned())
}

pub struct Iface {
    pub name: String,
    /// Kernel interface index.
    pub index: u32,
    hwaddr: [u8; 6],
    icmp6: Option<Socket>,
    packet: Option<Socket>,
    /// Flag states before we changed them; `None` means untouched.
    prev_allmulti: Option<bool>,
    prev_promisc: Option<bool>,
    /// Proxies answering solicits that arrive on this interface.
    pub(crate) serves: Vec<ProxyId>,
    /// Proxies probing through this interface and expecting adverts back.
    pub(crate) parents: Vec<ProxyId>,
}

impl Iface {
    /// Open the ICMPv6 side of an interface: bound to the device, hop
    /// limit 255, receive filter reduced to neighbor advertisements.
    fn open(name: &str) -> Result<Self> {
        let wrap = |source: io::Error| Error::Iface {
            name: name.to_string(),
            source,
        };

        let index = nix::net::if_::if_nametoindex(name).map_err(|e| wrap(e.into()))?;
        let sock = Socket::open(libc::AF_INET6, libc::SOCK_RAW, libc::IPPROTO_ICMPV6).map_err(wrap)?;
        sock.bind_device(name).map_err(wrap)?;
        let hwaddr = hwaddr_of(sock.raw_fd(), name).map_err(wrap)?;
        sock.set_hop_limit(255).map_err(wrap)?;
        sock.set_icmp6_filter(packet::ND_NEIGHBOR_ADVERT).map_err(wrap)?;

        debug!(
            iface = %name,
            index,
            hwaddr = %packet::format_lladdr(&hwaddr),
            "icmpv6 socket ready"
        );

        Ok(Self {
            name: name.to_string(),
            index,
            hwaddr,
            icmp6: Some(sock),
            packet: None,
            prev_allmulti: None,
            prev_promisc: None,
            serves: Vec::new(),
            parents: Vec::new(),
        })
    }

    /// Add the packet socket used to observe solicits on a parent
    /// interface. ALLMULTI goes on (and PROMISC when requested); previous
    /// states are kept for restoration at teardown.
    fn enable_listener(&mut self, promiscuous: bool) -> Result<()> {
        let wrap = |name: &str, source: io::Error| Error::Iface {
            name: name.to_string(),
            source,
        };

        if self.packet.is_none() {
            let sock = Socket::open(
                libc::AF_PACKET,
                libc::SOCK_RAW,
                (libc::ETH_P_IPV6 as u16).to_be() as libc::c_int,
            )
            .map_err(|e| wrap(&self.name, e))?;
            sock.bind_packet(self.index).map_err(|e| wrap(&self.name, e))?;
            sock.attach_filter(&SOLICIT_FILTER)
                .map_err(|e| wrap(&self.name, e))?;
            self.packet = Some(sock);

            let prev = self
                .set_flag(libc::IFF_ALLMULTI, true)
                .map_err(|e| wrap(&self.name, e))?;
            self.prev_allmulti = Some(prev);
            info!(iface = %self.name, promiscuous, "listening for neighbor solicitations");
        }

        if promiscuous && self.prev_promisc.is_none() {
            let prev = self
                .set_flag(libc::IFF_PROMISC, true)
                .map_err(|e| wrap(&self.name, e))?;
            self.prev_promisc = Some(prev);
        }

        Ok(())
    }

    /// Flip one IFF_* flag, returning its previous state.
    fn set_flag(&self, flag: libc::c_int, on: bool) -> io::Result<bool> {
        let sock = self
            .packet
            .as_ref()
            .or(self.icmp6.as_ref())
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        let fd = sock.raw_fd();

        let mut ifr = IfReqFlags {
            ifr_name: ifname_bytes(&self.name),
            ifr_flags: 0,
            _pad: [0; 22],
        };
        if unsafe { libc::ioctl(fd, libc::SIOCGIFFLAGS, &mut ifr) } < 0 {
            return Err(io::Error::last_os_error());
        }

        let old = ifr.ifr_flags as libc::c_int & flag != 0;
        if old == on {
            return Ok(old);
        }

        let mut flags = ifr.ifr_flags as libc::c_int;
        if on {
            flags |= flag;
        } else {
            flags &= !flag;
        }
        ifr.ifr_flags = flags as libc::c_short;
        if unsafe { libc::ioctl(fd, libc::SIOCSIFFLAGS, &ifr) } < 0 {
            return Err(io::Error::last_os_error());
        }

        debug!(iface = %self.name, flag, on, "receive flag changed");
        Ok(old)
    }

    fn restore_flags(&mut self) {
        if let Some(prev) = self.prev_allmulti.take()
            && let Err(e) = self.set_flag(libc::IFF_ALLMULTI, prev)
        {
            warn!(iface = %self.name, error = %e, "failed to restore allmulti");
        }
        if let Some(prev) = self.prev_promisc.take()
            && let Err(e) = self.set_flag(libc::IFF_PROMISC, prev)
        {
            warn!(iface = %self.name, error = %e, "failed to restore promiscuous");
        }
    }

    pub(crate) fn add_serves(&mut self, pid: ProxyId) {
        if !self.serves.contains(&pid) {
            self.serves.push(pid);
        }
    }

    pub(crate) fn add_parent(&mut self, pid: ProxyId) {
        if !self.parents.contains(&pid) {
            self.parents.push(pid);
        }
    }

    pub(crate) fn remove_proxy(&mut self, pid: ProxyId) {
        self.serves.retain(|p| *p != pid);
        self.parents.retain(|p| *p != pid);
    }

    pub(crate) fn packet_fd(&self) -> Option<RawFd> {
        self.packet.as_ref().map(Socket::raw_fd)
    }

    pub(crate) fn icmp6_fd(&self) -> Option<RawFd> {
        self.icmp6.as_ref().map(Socket::raw_fd)
    }

    /// Read one frame off the packet socket; `None` when drained.
    pub fn recv_packet(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match &self.packet {
            Some(sock) => sock.recv(buf),
            None => Ok(None),
        }
    }

    /// Read one ICMPv6 datagram and its source; `None` when drained.
    pub fn recv_advert(&self, buf: &mut [u8]) -> io::Result<Option<(usize, Ipv6Addr)>> {
        match &self.icmp6 {
            Some(sock) => sock.recv_from6(buf),
            None => Ok(None),
        }
    }

    /// Emit a neighbor solicitation for `taddr` toward its solicited-node
    /// multicast group.
    pub fn write_solicit(&self, taddr: &Ipv6Addr) -> io::Result<()> {
        let Some(sock) = &self.icmp6 else {
            debug!(iface = %self.name, target = %taddr, "no icmpv6 socket, solicit dropped");
            return Ok(());
        };
        let msg = packet::build_solicit(taddr, &self.hwaddr);
        let daddr = packet::solicited_node(taddr);
        debug!(iface = %self.name, target = %taddr, dst = %daddr, "write solicit");
        sock.send_to6(&msg, daddr)?;
        Ok(())
    }

    /// Emit a neighbor advertisement for `taddr` to `daddr`.
    pub fn write_advert(&self, daddr: &Ipv6Addr, taddr: &Ipv6Addr, router: bool) -> io::Result<()> {
        let Some(sock) = &self.icmp6 else {
            debug!(iface = %self.name, target = %taddr, "no icmpv6 socket, advert dropped");
            return Ok(());
        };
        let msg = packet::build_advert(daddr, taddr, &self.hwaddr, router);
        debug!(iface = %self.name, dst = %daddr, target = %taddr, router, "write advert");
        sock.send_to6(&msg, *daddr)?;
        Ok(())
    }
}

impl Drop for Iface {
    fn drop(&mut self) {
        self.restore_flags();
    }
}

/// All interfaces known to the process, keyed by id. An interface appears
/// once no matter how many proxies reference it; the poll table is rebuilt
/// lazily whenever a socket is added or removed.
pub struct IfaceMap {
    slots: Vec<Iface>,
    dirty: bool,
}

impl Default for IfaceMap {
    fn default() -> Self {
        Self::new()
    }
}

impl IfaceMap {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            dirty: true,
        }
    }

    pub fn get(&self, id: IfaceId) -> &Iface {
        &self.slots[id.0]
    }

    pub fn get_mut(&mut self, id: IfaceId) -> &mut Iface {
        &mut self.slots[id.0]
    }

    pub fn iter(&self) -> impl Iterator<Item = (IfaceId, &Iface)> {
        self.slots.iter().enumerate().map(|(i, s)| (IfaceId(i), s))
    }

    pub fn by_name(&self, name: &str) -> Option<IfaceId> {
        self.slots.iter().position(|s| s.name == name).map(IfaceId)
    }

    pub fn by_index(&self, index: u32) -> Option<IfaceId> {
        self.slots.iter().position(|s| s.index == index).map(IfaceId)
    }

    /// Lazily-rebuilt poll table support.
    pub(crate) fn take_dirty(&mut self) -> bool {
        mem::replace(&mut self.dirty, false)
    }

    fn push(&mut self, ifa: Iface) -> IfaceId {
        self.slots.push(ifa);
        self.dirty = true;
        IfaceId(self.slots.len() - 1)
    }

    /// Open an interface (ICMPv6 side only), reusing an existing entry.
    pub fn open(&mut self, name: &str) -> Result<IfaceId> {
        if let Some(id) = self.by_name(name) {
            return Ok(id);
        }
        let ifa = Iface::open(name)?;
        Ok(self.push(ifa))
    }

    /// Open an interface and its solicitation listener (parent side).
    pub fn open_listener(&mut self, name: &str, promiscuous: bool) -> Result<IfaceId> {
        let id = self.open(name)?;
        self.slots[id.0].enable_listener(promiscuous)?;
        self.dirty = true;
        Ok(id)
    }

    /// Resolve a routing-table egress index to an interface usable for
    /// probing, opening it on first use, and record the proxy as a parent.
    pub fn ensure_probe(&mut self, ifindex: u32, pid: ProxyId) -> Result<IfaceId> {
        let id = match self.by_index(ifindex) {
            Some(id) => id,
            None => {
                let name = if_indextoname(ifindex)?;
                self.open(&name)?
            }
        };
        self.slots[id.0].add_parent(pid);
        Ok(id)
    }

    /// Register an interface without opening sockets. Reads return empty
    /// and writes are dropped; static and auto rule handling works as
    /// usual. Used by tests and exercised by nothing else at runtime.
    pub fn insert_unbound(&mut self, name: &str, index: u32) -> IfaceId {
        self.push(Iface {
            name: name.to_string(),
            index,
            hwaddr: [0x02, 0x00, 0x00, 0x00, 0x00, index as u8],
            icmp6: None,
            packet: None,
            prev_allmulti: None,
            prev_promisc: None,
            serves: Vec::new(),
            parents: Vec::new(),
        })
    }

    /// Remove a destroyed proxy from every interface's reference lists.
    pub(crate) fn remove_proxy(&mut self, pid: ProxyId) {
        for ifa in &mut self.slots {
            ifa.remove_proxy(pid);
        }
    }

    /// Drop every interface, restoring kernel flags on the way out.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.dirty = true;
    }
}
