//! Local-address and routing oracle backed by rtnetlink.
//!
//! At startup the kernel's IPv6 address and route tables are dumped into
//! two caches: the set of locally configured addresses (loopback
//! suppression) and a longest-prefix-match map from destination prefix to
//! egress interface index (auto rules). The socket stays subscribed to the
//! IPv6 address/route multicast groups so the reactor can keep both caches
//! fresh while the daemon runs.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv6Addr};
use std::os::fd::RawFd;

use ipnet::Ipv6Net;
use netlink_packet_core::{
    NLM_F_DUMP, NLM_F_REQUEST, NetlinkHeader, NetlinkMessage, NetlinkPayload,
};
use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteMessage};
use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
use prefix_trie::PrefixMap;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::socket::Socket;

const RTMGRP_IPV6_IFADDR: u32 = 0x100;
const RTMGRP_IPV6_ROUTE: u32 = 0x400;

const RT_TABLE_MAIN: u8 = 254;

const RECV_BUF: usize = 64 * 1024;
const DUMP_TIMEOUT_MS: u16 = 2_000;

#[derive(Default)]
struct Cache {
    locals: BTreeSet<Ipv6Addr>,
    routes: PrefixMap<Ipv6Net, u32>,
}

impl Cache {
    /// Walk one datagram worth of netlink messages into the caches.
    /// Returns true when a dump terminator was seen.
    fn apply_datagram(&mut self, bytes: &[u8]) -> bool {
        let mut offset = 0;
        let mut done = false;
        while offset < bytes.len() {
            let msg = match NetlinkMessage::<RouteNetlinkMessage>::deserialize(&bytes[offset..]) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(error = %e, "undecodable netlink message");
                    break;
                }
            };
            let len = msg.header.length as usize;
            if len == 0 {
                break;
            }
            match msg.payload {
                NetlinkPayload::Done(_) => done = true,
                NetlinkPayload::Error(e) => {
                    warn!(error = ?e, "netlink error message");
                    done = true;
                }
                NetlinkPayload::InnerMessage(inner) => self.apply_message(inner),
                _ => {}
            }
            offset += (len + 3) & !3;
        }
        done
    }

    fn apply_message(&mut self, msg: RouteNetlinkMessage) {
        match msg {
            RouteNetlinkMessage::NewAddress(m) => {
                if let Some(addr) = address_of(&m)
                    && self.locals.insert(addr)
                {
                    debug!(address = %addr, "registered local address");
                }
            }
            RouteNetlinkMessage::DelAddress(m) => {
                if let Some(addr) = address_of(&m)
                    && self.locals.remove(&addr)
                {
                    debug!(address = %addr, "forgot local address");
                }
            }
            RouteNetlinkMessage::NewRoute(m) => {
                if let Some((net, oif)) = route_of(&m) {
                    debug!(route = %net, oif, "registered route");
                    self.routes.insert(net, oif);
                }
            }
            RouteNetlinkMessage::DelRoute(m) => {
                if let Some((net, _)) = route_of(&m) {
                    self.routes.remove(&net);
                }
            }
            _ => {}
        }
    }
}

fn address_of(msg: &AddressMessage) -> Option<Ipv6Addr> {
    if msg.header.family != AddressFamily::Inet6 {
        return None;
    }
    msg.attributes
        .iter()
        .find_map(|attr| match attr {
            AddressAttribute::Address(IpAddr::V6(addr)) => Some(*addr),
            _ => None,
        })
        .filter(|addr| !addr.is_loopback())
}

fn route_of(msg: &RouteMessage) -> Option<(Ipv6Net, u32)> {
    if msg.header.address_family != AddressFamily::Inet6 {
        return None;
    }
    if msg.header.table != RT_TABLE_MAIN {
        return None;
    }
    let mut dst = None;
    let mut oif = None;
    for attr in &msg.attributes {
        match attr {
            RouteAttribute::Destination(RouteAddress::Inet6(addr)) => dst = Some(*addr),
            RouteAttribute::Oif(index) => oif = Some(*index),
            _ => {}
        }
    }
    let dst = dst.unwrap_or(Ipv6Addr::UNSPECIFIED);
    let net = Ipv6Net::new(dst, msg.header.destination_prefix_length).ok()?;
    Some((net, oif?))
}

pub struct Oracle {
    sock: Option<Socket>,
    cache: Cache,
    seq: u32,
}

impl Oracle {
    /// An oracle with no kernel connection. Nothing is local and no route
    /// resolves until entries are added by hand.
    pub fn empty() -> Self {
        Self {
            sock: None,
            cache: Cache::default(),
            seq: 0,
        }
    }

    /// Connect to rtnetlink, subscribe to IPv6 address/route updates, and
    /// dump the current state.
    pub fn load() -> Result<Self> {
        let sock = Socket::open(libc::AF_NETLINK, libc::SOCK_RAW, libc::NETLINK_ROUTE)?;
        sock.bind_netlink(RTMGRP_IPV6_IFADDR | RTMGRP_IPV6_ROUTE)?;

        let mut oracle = Self {
            sock: Some(sock),
            cache: Cache::default(),
            seq: 0,
        };
        let mut addr_req = AddressMessage::default();
        addr_req.header.family = AddressFamily::Inet6;
        oracle.run_dump(RouteNetlinkMessage::GetAddress(addr_req))?;

        let mut route_req = RouteMessage::default();
        route_req.header.address_family = AddressFamily::Inet6;
        oracle.run_dump(RouteNetlinkMessage::GetRoute(route_req))?;

        info!(
            locals = oracle.cache.locals.len(),
            routes = oracle.cache.routes.iter().count(),
            "netlink caches loaded"
        );
        Ok(oracle)
    }

    fn run_dump(&mut self, request: RouteNetlinkMessage) -> Result<()> {
        let sock = self.sock.as_ref().expect("dump without a netlink socket");

        self.seq += 1;
        let mut header = NetlinkHeader::default();
        header.flags = NLM_F_REQUEST | NLM_F_DUMP;
        header.sequence_number = self.seq;
        let mut msg = NetlinkMessage::new(header, NetlinkPayload::from(request));
        msg.finalize();
        let mut buf = vec![0u8; msg.buffer_len()];
        msg.serialize(&mut buf);
        sock.send_netlink(&buf)?;

        let mut buf = vec![0u8; RECV_BUF];
        loop {
            if !sock.wait_readable(DUMP_TIMEOUT_MS)? {
                return Err(Error::Netlink("dump timed out".into()));
            }
            let Some(n) = sock.recv(&mut buf)? else {
                continue;
            };
            if self.cache.apply_datagram(&buf[..n]) {
                return Ok(());
            }
        }
    }

    /// File descriptor to watch for address/route updates, if connected.
    pub fn poll_fd(&self) -> Option<RawFd> {
        self.sock.as_ref().map(Socket::raw_fd)
    }

    /// Apply queued multicast updates; called when the socket is readable.
    pub fn drain(&mut self) {
        let Some(sock) = self.sock.as_ref() else {
            return;
        };
        let mut buf = vec![0u8; RECV_BUF];
        loop {
            match sock.recv(&mut buf) {
                Ok(Some(n)) => {
                    self.cache.apply_datagram(&buf[..n]);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "netlink receive failed");
                    break;
                }
            }
        }
    }

    /// Is this one of the host's own addresses?
    pub fn is_local(&self, addr: &Ipv6Addr) -> bool {
        self.cache.locals.contains(addr)
    }

    /// Egress interface index for a destination, by longest prefix match.
    pub fn route_oif(&self, addr: &Ipv6Addr) -> Option<u32> {
        let host = Ipv6Net::new(*addr, 128).ok()?;
        self.cache.routes.get_lpm(&host).map(|(_, oif)| *oif)
    }

    pub fn add_local(&mut self, addr: Ipv6Addr) {
        self.cache.locals.insert(addr);
    }

    pub fn add_route(&mut self, net: Ipv6Net, oif: u32) {
        self.cache.routes.insert(net, oif);
    }
}
