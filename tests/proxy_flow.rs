//! End-to-end proxy behavior over the sans-io layer: decoded messages go
//! in, wire emissions come out. No sockets or privileges involved.

use std::net::Ipv6Addr;

use ndproxyd::netlink::Oracle;
use ndproxyd::packet::Solicit;
use ndproxyd::packet::solicited_node;
use ndproxyd::proxy::{Rule, RuleMode};
use ndproxyd::reactor::Reactor;
use ndproxyd::session::{Emission, ProxyParams, Status};

fn addr(s: &str) -> Ipv6Addr {
    s.parse().unwrap()
}

fn net(s: &str) -> ipnet::Ipv6Net {
    s.parse().unwrap()
}

fn solicit(saddr: &str, taddr: &str) -> Solicit {
    let taddr = addr(taddr);
    Solicit {
        saddr: addr(saddr),
        daddr: solicited_node(&taddr),
        taddr,
    }
}

/// proxy eth0 { rule 2001:db8::/64 iface eth1 }
fn forwarding_reactor() -> (Reactor, ndproxyd::iface::IfaceId, ndproxyd::iface::IfaceId) {
    let mut reactor = Reactor::new(Oracle::empty());
    let eth0 = reactor.ifaces_mut().insert_unbound("eth0", 2);
    let eth1 = reactor.ifaces_mut().insert_unbound("eth1", 3);
    let pid = reactor.add_proxy(eth0, ProxyParams::new(eth0));
    reactor.add_rule(
        pid,
        Rule {
            net: net("2001:db8::/64"),
            mode: RuleMode::Iface(eth1),
            autovia: false,
        },
    );
    (reactor, eth0, eth1)
}

#[test]
fn first_touch_probes_then_answers() {
    let (mut reactor, eth0, eth1) = forwarding_reactor();
    let taddr = addr("2001:db8::abcd");

    // Solicit on the parent: exactly one probe toward the daughter.
    let mut out = Vec::new();
    reactor.dispatch_solicit(eth0, solicit("fe80::1", "2001:db8::abcd"), &mut out);
    assert_eq!(out, vec![Emission::Solicit { ifid: eth1, taddr }]);

    // The target answers on the daughter: the requester gets its advert
    // on the parent, with the router flag from the proxy defaults.
    out.clear();
    reactor.dispatch_advert(eth1, addr("fe80::2"), taddr, &mut out);
    assert_eq!(
        out,
        vec![Emission::Advert {
            ifid: eth0,
            daddr: addr("fe80::1"),
            taddr,
            router: true,
        }]
    );
    assert_eq!(
        reactor.proxies()[0].session_for(&taddr).unwrap().status(),
        Status::Valid
    );
}

#[test]
fn unanswered_probes_retry_then_invalidate() {
    let (mut reactor, eth0, eth1) = forwarding_reactor();
    let taddr = addr("2001:db8::1");

    let mut out = Vec::new();
    reactor.dispatch_solicit(eth0, solicit("fe80::1", "2001:db8::1"), &mut out);
    assert_eq!(out.len(), 1, "probe at t=0");

    // Three retries at t=500, 1000, 1500.
    for t in [500, 1000, 1500] {
        out.clear();
        reactor.age_sessions(500, &mut out);
        assert_eq!(
            out,
            vec![Emission::Solicit { ifid: eth1, taddr }],
            "expected a retry at t={t}"
        );
    }

    // t=2000: the retry budget is exhausted; the session turns invalid
    // and further solicits are answered by silence.
    out.clear();
    reactor.age_sessions(500, &mut out);
    assert!(out.is_empty());
    assert_eq!(
        reactor.proxies()[0].session_for(&taddr).unwrap().status(),
        Status::Invalid
    );

    out.clear();
    reactor.dispatch_solicit(eth0, solicit("fe80::3", "2001:db8::1"), &mut out);
    assert!(
        out.iter()
            .all(|e| !matches!(e, Emission::Advert { .. })),
        "no advert while the target is unreachable"
    );
    // But probing restarts on the touch.
    assert_eq!(out, vec![Emission::Solicit { ifid: eth1, taddr }]);
    assert_eq!(
        reactor.proxies()[0].session_for(&taddr).unwrap().status(),
        Status::Waiting
    );

    // Within deadtime, the invalid dwell ends in eviction when untouched.
    out.clear();
    reactor.age_sessions(500, &mut out); // retry 1
    reactor.age_sessions(500, &mut out);
    reactor.age_sessions(500, &mut out);
    reactor.age_sessions(500, &mut out); // invalid again
    out.clear();
    reactor.age_sessions(3000, &mut out); // deadtime expires
    assert!(reactor.proxies()[0].session_for(&taddr).is_none());
}

#[test]
fn static_rule_answers_without_probing() {
    let mut reactor = Reactor::new(Oracle::empty());
    let eth0 = reactor.ifaces_mut().insert_unbound("eth0", 2);
    let pid = reactor.add_proxy(eth0, ProxyParams::new(eth0));
    reactor.add_rule(
        pid,
        Rule {
            net: net("2001:db8::/64"),
            mode: RuleMode::Static,
            autovia: false,
        },
    );

    let mut out = Vec::new();
    reactor.dispatch_solicit(eth0, solicit("fe80::1", "2001:db8::1"), &mut out);
    assert_eq!(
        out,
        vec![Emission::Advert {
            ifid: eth0,
            daddr: addr("fe80::1"),
            taddr: addr("2001:db8::1"),
            router: true,
        }]
    );
}

#[test]
fn dad_solicit_probes_without_answering() {
    let (mut reactor, eth0, eth1) = forwarding_reactor();
    let taddr = addr("2001:db8::1");

    let mut out = Vec::new();
    reactor.dispatch_solicit(eth0, solicit("::", "2001:db8::1"), &mut out);
    assert_eq!(out, vec![Emission::Solicit { ifid: eth1, taddr }]);

    let session = reactor.proxies()[0].session_for(&taddr).unwrap();
    assert!(!session.pending_contains(&addr("::")));

    // Even once valid, nothing is ever sent toward the unspecified address.
    out.clear();
    reactor.dispatch_advert(eth1, addr("fe80::2"), taddr, &mut out);
    assert!(out.is_empty());
    out.clear();
    reactor.dispatch_solicit(eth0, solicit("::", "2001:db8::1"), &mut out);
    assert!(out.iter().all(|e| !matches!(e, Emission::Advert { .. })));
}

#[test]
fn repeated_solicits_get_one_advert_per_requester() {
    let (mut reactor, eth0, eth1) = forwarding_reactor();
    let taddr = addr("2001:db8::1");

    let mut out = Vec::new();
    reactor.dispatch_solicit(eth0, solicit("fe80::1", "2001:db8::1"), &mut out);
    reactor.dispatch_advert(eth1, addr("fe80::2"), taddr, &mut out);

    out.clear();
    reactor.dispatch_solicit(eth0, solicit("fe80::1", "2001:db8::1"), &mut out);
    reactor.dispatch_solicit(eth0, solicit("fe80::1", "2001:db8::1"), &mut out);
    reactor.dispatch_solicit(eth0, solicit("fe80::9", "2001:db8::1"), &mut out);
    let adverts: Vec<_> = out
        .iter()
        .filter(|e| matches!(e, Emission::Advert { .. }))
        .collect();
    assert_eq!(adverts.len(), 2, "one advert per distinct requester");
}

#[test]
fn local_sources_are_ignored() {
    let (mut reactor, eth0, _eth1) = forwarding_reactor();
    reactor.oracle_mut().add_local(addr("fe80::51"));

    let mut out = Vec::new();
    reactor.dispatch_solicit(eth0, solicit("fe80::51", "2001:db8::1"), &mut out);
    assert!(out.is_empty());
    assert!(reactor.proxies()[0].sessions.is_empty());
}

#[test]
fn local_targets_are_answered_directly() {
    let (mut reactor, eth0, _eth1) = forwarding_reactor();
    reactor.oracle_mut().add_local(addr("2001:db8::5"));

    let mut out = Vec::new();
    reactor.dispatch_solicit(eth0, solicit("fe80::1", "2001:db8::5"), &mut out);
    // Answered with R=0 and without creating a session.
    assert_eq!(
        out,
        vec![Emission::Advert {
            ifid: eth0,
            daddr: addr("fe80::1"),
            taddr: addr("2001:db8::5"),
            router: false,
        }]
    );
    assert!(reactor.proxies()[0].sessions.is_empty());
}

#[test]
fn reverse_path_sessions_converge_in_a_duplex_setup() {
    let mut reactor = Reactor::new(Oracle::empty());
    let eth0 = reactor.ifaces_mut().insert_unbound("eth0", 2);
    let eth1 = reactor.ifaces_mut().insert_unbound("eth1", 3);

    // A: eth0 -> eth1, B: eth1 -> eth0, both for the same prefix.
    let a = reactor.add_proxy(eth0, ProxyParams::new(eth0));
    reactor.add_rule(
        a,
        Rule {
            net: net("2001:db8::/64"),
            mode: RuleMode::Iface(eth1),
            autovia: false,
        },
    );
    let b = reactor.add_proxy(eth1, ProxyParams::new(eth1));
    reactor.add_rule(
        b,
        Rule {
            net: net("2001:db8::/64"),
            mode: RuleMode::Iface(eth0),
            autovia: false,
        },
    );

    // A solicit from ::2 for ::1 arrives on eth0: the forward probe goes
    // out on eth1, and proxy B quietly learns about ::2.
    let mut out = Vec::new();
    reactor.dispatch_solicit(eth0, solicit("2001:db8::2", "2001:db8::1"), &mut out);
    assert_eq!(
        out,
        vec![Emission::Solicit {
            ifid: eth1,
            taddr: addr("2001:db8::1"),
        }]
    );
    let reverse = reactor.proxy(b).session_for(&addr("2001:db8::2")).unwrap();
    assert_eq!(reverse.status(), Status::Waiting);

    // A real advert from ::2 seen on eth0 completes the reverse session.
    out.clear();
    reactor.dispatch_advert(eth0, addr("fe80::2"), addr("2001:db8::2"), &mut out);
    let reverse = reactor.proxy(b).session_for(&addr("2001:db8::2")).unwrap();
    assert_eq!(reverse.status(), Status::Valid);
}

#[test]
fn auto_rules_probe_the_routed_interface() {
    let mut reactor = Reactor::new(Oracle::empty());
    let eth0 = reactor.ifaces_mut().insert_unbound("eth0", 2);
    let eth1 = reactor.ifaces_mut().insert_unbound("eth1", 3);
    reactor.oracle_mut().add_route(net("2001:db8::/64"), 3);

    let pid = reactor.add_proxy(eth0, ProxyParams::new(eth0));
    reactor.add_rule(
        pid,
        Rule {
            net: net("2001:db8::/64"),
            mode: RuleMode::Auto,
            autovia: false,
        },
    );

    let mut out = Vec::new();
    reactor.dispatch_solicit(eth0, solicit("fe80::1", "2001:db8::1"), &mut out);
    assert_eq!(
        out,
        vec![Emission::Solicit {
            ifid: eth1,
            taddr: addr("2001:db8::1"),
        }]
    );

    // The advert comes back on the auto-resolved interface.
    out.clear();
    reactor.dispatch_advert(eth1, addr("fe80::2"), addr("2001:db8::1"), &mut out);
    assert_eq!(
        out,
        vec![Emission::Advert {
            ifid: eth0,
            daddr: addr("fe80::1"),
            taddr: addr("2001:db8::1"),
            router: true,
        }]
    );
}
