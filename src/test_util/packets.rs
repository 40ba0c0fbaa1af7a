//! Neighbor Discovery frame builders for tests.
//!
//! Built with smoltcp's emit path so checksums and lengths are what a real
//! peer would put on the wire.

use std::net::Ipv6Addr;

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr, Icmpv6Packet, Icmpv6Repr,
    IpProtocol, Ipv6Packet, Ipv6Repr, NdiscRepr, RawHardwareAddress,
};

/// A complete Ethernet frame carrying a neighbor solicitation with a
/// source link-layer address option.
pub fn neighbor_solicit_frame(
    src_mac: [u8; 6],
    saddr: Ipv6Addr,
    daddr: Ipv6Addr,
    taddr: Ipv6Addr,
) -> Vec<u8> {
    let icmp_repr = Icmpv6Repr::Ndisc(NdiscRepr::NeighborSolicit {
        target_addr: taddr,
        lladdr: Some(RawHardwareAddress::from_bytes(&src_mac)),
    });

    let ipv6_repr = Ipv6Repr {
        src_addr: saddr,
        dst_addr: daddr,
        next_header: IpProtocol::Icmpv6,
        payload_len: icmp_repr.buffer_len(),
        hop_limit: 255,
    };

    // Solicited-node traffic goes to the matching 33:33 multicast group.
    let dst_mac = if daddr.is_multicast() {
        let octets = daddr.octets();
        EthernetAddress::from_bytes(&[0x33, 0x33, octets[12], octets[13], octets[14], octets[15]])
    } else {
        EthernetAddress::BROADCAST
    };
    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress::from_bytes(&src_mac),
        dst_addr: dst_mac,
        ethertype: EthernetProtocol::Ipv6,
    };

    let total = eth_repr.buffer_len() + ipv6_repr.buffer_len() + icmp_repr.buffer_len();
    let mut buffer = vec![0u8; total];

    let mut frame = EthernetFrame::new_unchecked(&mut buffer);
    eth_repr.emit(&mut frame);

    let mut ipv6_packet = Ipv6Packet::new_unchecked(frame.payload_mut());
    ipv6_repr.emit(&mut ipv6_packet);

    let mut icmp_packet = Icmpv6Packet::new_unchecked(ipv6_packet.payload_mut());
    icmp_repr.emit(
        &saddr,
        &daddr,
        &mut icmp_packet,
        &ChecksumCapabilities::default(),
    );

    buffer
}
