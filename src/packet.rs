//! Neighbor Discovery wire codecs.
//!
//! Inbound solicitations arrive as full Ethernet frames (packet socket);
//! inbound advertisements and all outbound messages are bare ICMPv6
//! payloads (raw ICMPv6 socket, the kernel fills in the checksum).

use std::net::Ipv6Addr;

use smoltcp::wire::{EthernetFrame, EthernetProtocol, IpProtocol, Ipv6Packet};

pub const ND_NEIGHBOR_SOLICIT: u8 = 135;
pub const ND_NEIGHBOR_ADVERT: u8 = 136;

pub const ND_OPT_SOURCE_LINKADDR: u8 = 1;
pub const ND_OPT_TARGET_LINKADDR: u8 = 2;

/// R flag in the first flags byte of a Neighbor Advertisement.
pub const NA_FLAG_ROUTER: u8 = 0x80;
/// S flag in the first flags byte of a Neighbor Advertisement.
pub const NA_FLAG_SOLICITED: u8 = 0x40;

/// NS and NA share the same shape: ICMPv6 header (8) + target (16) +
/// one link-layer address option (8).
pub const ND_MSG_LEN: usize = 32;

/// A decoded Neighbor Solicitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Solicit {
    pub saddr: Ipv6Addr,
    pub daddr: Ipv6Addr,
    pub taddr: Ipv6Addr,
}

/// A decoded Neighbor Advertisement (source comes from recvfrom).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advert {
    pub taddr: Ipv6Addr,
}

/// An address ND messages can actually be sent to.
pub fn is_unicast(addr: &Ipv6Addr) -> bool {
    !addr.is_multicast() && !addr.is_unspecified()
}

/// Solicited-node multicast address for a target: ff02::1:ff00:0/104 with
/// the low 24 bits of the target spliced in.
pub fn solicited_node(taddr: &Ipv6Addr) -> Ipv6Addr {
    let t = taddr.octets();
    let mut out = [0u8; 16];
    out[0] = 0xff;
    out[1] = 0x02;
    out[11] = 0x01;
    out[12] = 0xff;
    out[13] = t[13];
    out[14] = t[14];
    out[15] = t[15];
    Ipv6Addr::from(out)
}

/// Parse a Neighbor Solicitation out of an Ethernet frame.
///
/// The packet socket filter already drops everything else, but the frame is
/// re-checked here so a missing or lax filter cannot feed garbage into the
/// proxy.
pub fn parse_solicit(frame: &[u8]) -> Option<Solicit> {
    let eth = EthernetFrame::new_checked(frame).ok()?;
    if eth.ethertype() != EthernetProtocol::Ipv6 {
        return None;
    }
    let ip = Ipv6Packet::new_checked(eth.payload()).ok()?;
    if ip.next_header() != IpProtocol::Icmpv6 {
        return None;
    }
    let icmp = ip.payload();
    if icmp.len() < 24 || icmp[0] != ND_NEIGHBOR_SOLICIT {
        return None;
    }
    let target: [u8; 16] = icmp[8..24].try_into().ok()?;
    Some(Solicit {
        saddr: ip.src_addr(),
        daddr: ip.dst_addr(),
        taddr: Ipv6Addr::from(target),
    })
}

/// Parse a Neighbor Advertisement from a raw ICMPv6 datagram.
pub fn parse_advert(msg: &[u8]) -> Option<Advert> {
    if msg.len() < 24 || msg[0] != ND_NEIGHBOR_ADVERT {
        return None;
    }
    let target: [u8; 16] = msg[8..24].try_into().ok()?;
    Some(Advert {
        taddr: Ipv6Addr::from(target),
    })
}

/// Link-layer address option carried by an ND message, if present.
pub fn parse_lladdr_opt(msg: &[u8]) -> Option<(u8, [u8; 6])> {
    if msg.len() < ND_MSG_LEN || msg[25] != 1 {
        return None;
    }
    let mac: [u8; 6] = msg[26..32].try_into().ok()?;
    Some((msg[24], mac))
}

/// Build a Neighbor Solicitation payload with a source link-layer option.
pub fn build_solicit(taddr: &Ipv6Addr, hwaddr: &[u8; 6]) -> [u8; ND_MSG_LEN] {
    let mut buf = [0u8; ND_MSG_LEN];
    buf[0] = ND_NEIGHBOR_SOLICIT;
    buf[8..24].copy_from_slice(&taddr.octets());
    buf[24] = ND_OPT_SOURCE_LINKADDR;
    buf[25] = 1;
    buf[26..32].copy_from_slice(hwaddr);
    buf
}

/// Build a Neighbor Advertisement payload with a target link-layer option.
///
/// The SOLICITED flag is set iff the destination is unicast.
pub fn build_advert(
    daddr: &Ipv6Addr,
    taddr: &Ipv6Addr,
    hwaddr: &[u8; 6],
    router: bool,
) -> [u8; ND_MSG_LEN] {
    let mut buf = [0u8; ND_MSG_LEN];
    buf[0] = ND_NEIGHBOR_ADVERT;
    let mut flags = 0u8;
    if is_unicast(daddr) {
        flags |= NA_FLAG_SOLICITED;
    }
    if router {
        flags |= NA_FLAG_ROUTER;
    }
    buf[4] = flags;
    buf[8..24].copy_from_slice(&taddr.octets());
    buf[24] = ND_OPT_TARGET_LINKADDR;
    buf[25] = 1;
    buf[26..32].copy_from_slice(hwaddr);
    buf
}

/// Format a link-layer address for logging.
pub fn format_lladdr(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}
