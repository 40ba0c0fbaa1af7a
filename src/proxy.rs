//! Proxies: an ordered rule set bound to one parent interface, plus the
//! sessions spawned for solicited targets.

use std::fmt;
use std::net::Ipv6Addr;

use ipnet::Ipv6Net;
use tracing::{debug, warn};

use crate::iface::{IfaceId, IfaceMap};
use crate::netlink::Oracle;
use crate::session::{Emission, ProxyParams, Session, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProxyId(pub(crate) usize);

impl fmt::Display for ProxyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proxy#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleMode {
    /// Probe a fixed daughter interface.
    Iface(IfaceId),
    /// No probing; the target is considered reachable.
    Static,
    /// Daughter resolved through the routing table when a session is created.
    Auto,
}

#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub net: Ipv6Net,
    pub mode: RuleMode,
    pub autovia: bool,
}

impl Rule {
    pub fn matches(&self, addr: &Ipv6Addr) -> bool {
        self.net.contains(addr)
    }

    pub fn is_auto(&self) -> bool {
        matches!(self.mode, RuleMode::Auto)
    }

    pub fn daughter(&self) -> Option<IfaceId> {
        match self.mode {
            RuleMode::Iface(ifid) => Some(ifid),
            _ => None,
        }
    }
}

pub struct Proxy {
    pub id: ProxyId,
    /// Parent interface: where solicits come in and adverts go out.
    pub ifid: IfaceId,
    pub params: ProxyParams,
    pub rules: Vec<Rule>,
    pub sessions: Vec<Session>,
}

impl Proxy {
    pub fn new(id: ProxyId, ifid: IfaceId, params: ProxyParams) -> Self {
        Self {
            id,
            ifid,
            params,
            rules: Vec::new(),
            sessions: Vec::new(),
        }
    }

    pub fn add_rule(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    pub fn session_for(&self, taddr: &Ipv6Addr) -> Option<&Session> {
        self.sessions.iter().find(|s| s.taddr == *taddr)
    }

    /// Find the session for `taddr`, or create one from the first matching
    /// rules. One session accumulates daughters from every matching rule.
    /// Returns `None` when no rule covers the target.
    pub fn find_or_create_session(
        &mut self,
        taddr: Ipv6Addr,
        ifaces: &mut IfaceMap,
        oracle: &Oracle,
        out: &mut Vec<Emission>,
    ) -> Option<usize> {
        if let Some(i) = self.sessions.iter().position(|s| s.taddr == taddr) {
            return Some(i);
        }

        let params = self.params;
        let parent_index = ifaces.get(self.ifid).index;
        let mut session: Option<Session> = None;

        for rule in &self.rules {
            if !rule.matches(&taddr) {
                continue;
            }
            debug!(proxy = %self.id, rule = %rule.net, target = %taddr, "rule matched");
            let se = session.get_or_insert_with(|| Session::new(taddr, &params));
            match rule.mode {
                RuleMode::Static => se.handle_advert(&params, out),
                RuleMode::Iface(ifid) => se.add_iface(ifid),
                RuleMode::Auto => match oracle.route_oif(&taddr) {
                    Some(oif) if oif == parent_index => {
                        debug!(target = %taddr, "route points back at the parent interface");
                    }
                    Some(oif) => match ifaces.ensure_probe(oif, self.id) {
                        Ok(ifid) => se.add_iface(ifid),
                        Err(e) => {
                            warn!(target = %taddr, oif, error = %e, "cannot open route interface");
                        }
                    },
                    None => debug!(target = %taddr, "no route for target"),
                },
            }
        }

        let se = session?;
        self.sessions.push(se);
        Some(self.sessions.len() - 1)
    }

    /// A solicit for `taddr` arrived on the parent interface from `saddr`.
    pub fn handle_solicit(
        &mut self,
        saddr: Ipv6Addr,
        taddr: Ipv6Addr,
        ifaces: &mut IfaceMap,
        oracle: &Oracle,
        out: &mut Vec<Emission>,
    ) {
        let Some(si) = self.find_or_create_session(taddr, ifaces, oracle, out) else {
            debug!(proxy = %self.id, target = %taddr, "no rule matches, solicit ignored");
            return;
        };

        let params = self.params;
        let se = &mut self.sessions[si];
        se.touch(&params, out);

        // Duplicate address detection only needs the probe above.
        if saddr == taddr {
            return;
        }

        match se.status() {
            Status::Waiting | Status::Invalid => se.add_pending(saddr),
            Status::Valid | Status::Renewing => se.answer(saddr, &params, out),
        }
    }

    /// A neighbor advertisement for `taddr` arrived on a daughter interface.
    pub fn handle_advert(
        &mut self,
        saddr: Ipv6Addr,
        taddr: Ipv6Addr,
        _autovia: bool,
        out: &mut Vec<Emission>,
    ) {
        let params = self.params;
        if let Some(se) = self.sessions.iter_mut().find(|s| s.taddr == taddr) {
            if params.autowire && se.status() == Status::Waiting {
                debug!(proxy = %self.id, source = %saddr, target = %taddr, "autowire is a no-op");
            }
            se.handle_advert(&params, out);
        }
    }

    /// Reverse-path maintenance: pre-create a session for a host seen
    /// soliciting on the far side, so the opposite direction converges
    /// without waiting for a probe.
    pub fn handle_stateless_advert(
        &mut self,
        saddr: Ipv6Addr,
        taddr: Ipv6Addr,
        _autovia: bool,
        ifaces: &mut IfaceMap,
        oracle: &Oracle,
        out: &mut Vec<Emission>,
    ) {
        debug!(proxy = %self.id, source = %saddr, target = %taddr, "stateless advert");
        let Some(si) = self.find_or_create_session(taddr, ifaces, oracle, out) else {
            return;
        };
        if self.params.autowire && self.sessions[si].status() == Status::Waiting {
            debug!(proxy = %self.id, target = %taddr, "autowire is a no-op");
        }
    }

    /// Does an advert for `taddr` received on `ifid` concern this proxy?
    /// Returns the matching rule's autovia flag. An auto rule matches when
    /// the session's creation-time route resolution picked `ifid`.
    pub fn advert_match(&self, taddr: &Ipv6Addr, ifid: IfaceId) -> Option<bool> {
        for rule in &self.rules {
            if !rule.matches(taddr) {
                continue;
            }
            match rule.mode {
                RuleMode::Iface(daughter) if daughter == ifid => return Some(rule.autovia),
                RuleMode::Auto => {
                    if self
                        .sessions
                        .iter()
                        .any(|s| s.taddr == *taddr && s.ifaces.contains(&ifid))
                    {
                        return Some(rule.autovia);
                    }
                }
                _ => {}
            }
        }
        None
    }

    /// Does a solicit from `saddr` seen on daughter `ifid` warrant
    /// reverse-path maintenance for this proxy?
    pub fn reverse_match(&self, saddr: &Ipv6Addr, ifid: IfaceId) -> Option<bool> {
        self.rules
            .iter()
            .find(|r| r.matches(saddr) && r.daughter() == Some(ifid))
            .map(|r| r.autovia)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::IfaceMap;
    use crate::netlink::Oracle;

    fn addr(s: &str) -> Ipv6Addr {
        s.parse().unwrap()
    }

    fn net(s: &str) -> Ipv6Net {
        s.parse().unwrap()
    }

    struct Fixture {
        ifaces: IfaceMap,
        oracle: Oracle,
        proxy: Proxy,
        eth1: IfaceId,
    }

    fn fixture() -> Fixture {
        let mut ifaces = IfaceMap::new();
        let eth0 = ifaces.insert_unbound("eth0", 2);
        let eth1 = ifaces.insert_unbound("eth1", 3);
        let proxy = Proxy::new(ProxyId(0), eth0, ProxyParams::new(eth0));
        Fixture {
            ifaces,
            oracle: Oracle::empty(),
            proxy,
            eth1,
        }
    }

    #[test]
    fn no_matching_rule_means_no_session() {
        let mut fx = fixture();
        fx.proxy.add_rule(Rule {
            net: net("2001:db8:1::/64"),
            mode: RuleMode::Iface(fx.eth1),
            autovia: false,
        });
        let mut out = Vec::new();
        let si = fx.proxy.find_or_create_session(
            addr("2001:db8:2::1"),
            &mut fx.ifaces,
            &fx.oracle,
            &mut out,
        );
        assert!(si.is_none());
        assert!(fx.proxy.sessions.is_empty());
    }

    #[test]
    fn one_session_per_target() {
        let mut fx = fixture();
        fx.proxy.add_rule(Rule {
            net: net("2001:db8::/64"),
            mode: RuleMode::Iface(fx.eth1),
            autovia: false,
        });
        let mut out = Vec::new();
        let a = fx
            .proxy
            .find_or_create_session(addr("2001:db8::1"), &mut fx.ifaces, &fx.oracle, &mut out);
        let b = fx
            .proxy
            .find_or_create_session(addr("2001:db8::1"), &mut fx.ifaces, &fx.oracle, &mut out);
        assert_eq!(a, b);
        assert_eq!(fx.proxy.sessions.len(), 1);
    }

    #[test]
    fn overlapping_rules_accumulate_daughters() {
        let mut fx = fixture();
        let eth2 = fx.ifaces.insert_unbound("eth2", 4);
        fx.proxy.add_rule(Rule {
            net: net("2001:db8::/64"),
            mode: RuleMode::Iface(fx.eth1),
            autovia: false,
        });
        fx.proxy.add_rule(Rule {
            net: net("2001:db8::/48"),
            mode: RuleMode::Iface(eth2),
            autovia: false,
        });
        let mut out = Vec::new();
        let si = fx
            .proxy
            .find_or_create_session(addr("2001:db8::1"), &mut fx.ifaces, &fx.oracle, &mut out)
            .unwrap();
        assert_eq!(fx.proxy.sessions[si].ifaces, vec![fx.eth1, eth2]);
    }

    #[test]
    fn static_rule_is_valid_immediately() {
        let mut fx = fixture();
        fx.proxy.add_rule(Rule {
            net: net("2001:db8::/64"),
            mode: RuleMode::Static,
            autovia: false,
        });
        let mut out = Vec::new();
        fx.proxy.handle_solicit(
            addr("fe80::1"),
            addr("2001:db8::1"),
            &mut fx.ifaces,
            &fx.oracle,
            &mut out,
        );
        // Exactly one advert back to the requester, no probe anywhere.
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Emission::Advert { daddr, router: true, .. } if daddr == addr("fe80::1")));
        assert_eq!(fx.proxy.sessions[0].status(), Status::Valid);
    }

    #[test]
    fn waiting_session_queues_requesters() {
        let mut fx = fixture();
        fx.proxy.add_rule(Rule {
            net: net("2001:db8::/64"),
            mode: RuleMode::Iface(fx.eth1),
            autovia: false,
        });
        let mut out = Vec::new();
        fx.proxy.handle_solicit(
            addr("fe80::1"),
            addr("2001:db8::1"),
            &mut fx.ifaces,
            &fx.oracle,
            &mut out,
        );
        assert_eq!(
            out,
            vec![Emission::Solicit {
                ifid: fx.eth1,
                taddr: addr("2001:db8::1"),
            }]
        );
        assert!(fx.proxy.sessions[0].pending_contains(&addr("fe80::1")));

        // The daughter answers: queued requester gets an advert.
        out.clear();
        fx.proxy
            .handle_advert(addr("fe80::2"), addr("2001:db8::1"), false, &mut out);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Emission::Advert { daddr, .. } if daddr == addr("fe80::1")));
    }

    #[test]
    fn dad_solicit_probes_but_queues_nothing() {
        let mut fx = fixture();
        fx.proxy.add_rule(Rule {
            net: net("2001:db8::/64"),
            mode: RuleMode::Iface(fx.eth1),
            autovia: false,
        });
        let mut out = Vec::new();
        fx.proxy.handle_solicit(
            addr("::"),
            addr("2001:db8::1"),
            &mut fx.ifaces,
            &fx.oracle,
            &mut out,
        );
        assert_eq!(out.len(), 1, "probe still goes out");
        assert!(!fx.proxy.sessions[0].pending_contains(&addr("::")));
    }

    #[test]
    fn auto_rule_resolves_daughter_from_routes() {
        let mut fx = fixture();
        fx.proxy.add_rule(Rule {
            net: net("2001:db8::/64"),
            mode: RuleMode::Auto,
            autovia: false,
        });
        fx.oracle.add_route(net("2001:db8::/64"), 3); // eth1
        let mut out = Vec::new();
        let si = fx
            .proxy
            .find_or_create_session(addr("2001:db8::1"), &mut fx.ifaces, &fx.oracle, &mut out)
            .unwrap();
        assert_eq!(fx.proxy.sessions[si].ifaces, vec![fx.eth1]);

        // Adverts from the resolved interface now correlate.
        assert_eq!(
            fx.proxy.advert_match(&addr("2001:db8::1"), fx.eth1),
            Some(false)
        );
    }

    #[test]
    fn auto_rule_skips_routes_via_parent() {
        let mut fx = fixture();
        fx.proxy.add_rule(Rule {
            net: net("2001:db8::/64"),
            mode: RuleMode::Auto,
            autovia: false,
        });
        fx.oracle.add_route(net("2001:db8::/64"), 2); // the parent itself
        let mut out = Vec::new();
        let si = fx
            .proxy
            .find_or_create_session(addr("2001:db8::1"), &mut fx.ifaces, &fx.oracle, &mut out)
            .unwrap();
        assert!(fx.proxy.sessions[si].ifaces.is_empty());
    }

    #[test]
    fn advert_match_requires_the_daughter_interface() {
        let mut fx = fixture();
        let eth2 = fx.ifaces.insert_unbound("eth2", 4);
        fx.proxy.add_rule(Rule {
            net: net("2001:db8::/64"),
            mode: RuleMode::Iface(fx.eth1),
            autovia: true,
        });
        assert_eq!(
            fx.proxy.advert_match(&addr("2001:db8::1"), fx.eth1),
            Some(true)
        );
        assert_eq!(fx.proxy.advert_match(&addr("2001:db8::1"), eth2), None);
        assert_eq!(fx.proxy.advert_match(&addr("2001:db9::1"), fx.eth1), None);
    }

    #[test]
    fn stateless_advert_creates_waiting_session() {
        let mut fx = fixture();
        fx.proxy.add_rule(Rule {
            net: net("2001:db8::/64"),
            mode: RuleMode::Iface(fx.eth1),
            autovia: false,
        });
        let mut out = Vec::new();
        fx.proxy.handle_stateless_advert(
            addr("2001:db8::2"),
            addr("2001:db8::2"),
            false,
            &mut fx.ifaces,
            &fx.oracle,
            &mut out,
        );
        let se = fx.proxy.session_for(&addr("2001:db8::2")).unwrap();
        assert_eq!(se.status(), Status::Waiting);
        assert!(out.is_empty(), "no probe until someone solicits");
    }
}
