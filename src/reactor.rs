//! The event loop: one bounded poll over every socket, ingest dispatch,
//! and the periodic aging of all sessions.
//!
//! The reactor owns all process-scoped state (interfaces, proxies, the
//! netlink oracle) and threads it into the state layer; nothing lives in
//! module globals. Readiness is dispatched over tagged tokens rather than
//! per-socket callbacks.

use std::io;
use std::net::Ipv6Addr;
use std::os::fd::{BorrowedFd, RawFd};
use std::time::{Duration, Instant};

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, info, warn};

use crate::config::{Config, RuleModeConfig};
use crate::error::{Error, Result};
use crate::iface::{IfaceId, IfaceMap};
use crate::netlink::Oracle;
use crate::packet::{self, Solicit};
use crate::proxy::{Proxy, ProxyId, Rule, RuleMode};
use crate::session::{Emission, ProxyParams};
use crate::signals;

/// Poll is bounded so session aging keeps running through silence.
const POLL_TIMEOUT_MS: u16 = 50;

/// Inbound ND messages are small; this comfortably covers header + options.
const READ_BUF: usize = 256;

#[derive(Debug, Clone, Copy)]
enum Token {
    /// The packet socket of an interface has solicitations queued.
    Solicit(IfaceId),
    /// The ICMPv6 socket of an interface has advertisements queued.
    Advert(IfaceId),
    /// The rtnetlink socket has address/route updates queued.
    Netlink,
}

pub struct Reactor {
    // Proxies are declared before the interface map so sessions die
    // before any interface restores its kernel flags.
    proxies: Vec<Proxy>,
    ifaces: IfaceMap,
    oracle: Oracle,
    poll_table: Vec<(RawFd, Token)>,
}

impl Reactor {
    pub fn new(oracle: Oracle) -> Self {
        Self {
            proxies: Vec::new(),
            ifaces: IfaceMap::new(),
            oracle,
            poll_table: Vec::new(),
        }
    }

    pub fn ifaces(&self) -> &IfaceMap {
        &self.ifaces
    }

    pub fn ifaces_mut(&mut self) -> &mut IfaceMap {
        &mut self.ifaces
    }

    pub fn proxies(&self) -> &[Proxy] {
        &self.proxies
    }

    pub fn proxy(&self, pid: ProxyId) -> &Proxy {
        &self.proxies[pid.0]
    }

    pub fn oracle_mut(&mut self) -> &mut Oracle {
        &mut self.oracle
    }

    /// Register a proxy answering solicits on `ifid`.
    pub fn add_proxy(&mut self, ifid: IfaceId, params: ProxyParams) -> ProxyId {
        let pid = ProxyId(self.proxies.len());
        self.ifaces.get_mut(ifid).add_serves(pid);
        self.proxies.push(Proxy::new(pid, ifid, params));
        pid
    }

    /// Append a rule to a proxy; daughter interfaces learn about the
    /// proxy so adverts arriving there can be correlated back.
    pub fn add_rule(&mut self, pid: ProxyId, rule: Rule) {
        if let RuleMode::Iface(ifid) = rule.mode {
            self.ifaces.get_mut(ifid).add_parent(pid);
        }
        self.proxies[pid.0].add_rule(rule);
    }

    /// Open interfaces and build proxies from a parsed configuration.
    pub fn configure(&mut self, config: &Config) -> Result<()> {
        for pc in &config.proxies {
            let ifid = self.ifaces.open_listener(&pc.ifname, pc.promiscuous)?;
            let params = ProxyParams {
                parent: ifid,
                router: pc.router,
                ttl: pc.ttl,
                deadtime: pc.deadtime,
                timeout: pc.timeout,
                retries: pc.retries,
                keepalive: pc.keepalive,
                autowire: pc.autowire,
            };
            let pid = self.add_proxy(ifid, params);

            for rc in &pc.rules {
                let mode = match &rc.mode {
                    RuleModeConfig::Iface(name) => RuleMode::Iface(self.ifaces.open(name)?),
                    RuleModeConfig::Static => RuleMode::Static,
                    RuleModeConfig::Auto => RuleMode::Auto,
                };
                self.add_rule(
                    pid,
                    Rule {
                        net: rc.net,
                        mode,
                        autovia: rc.autovia,
                    },
                );
            }

            info!(
                iface = %pc.ifname,
                rules = pc.rules.len(),
                promiscuous = pc.promiscuous,
                "proxy configured"
            );
        }
        Ok(())
    }

    /// Run until a shutdown signal arrives.
    pub fn run(&mut self) -> Result<()> {
        let mut last = Instant::now();
        while signals::running() {
            for token in self.poll_ready()? {
                match token {
                    Token::Solicit(ifid) => self.ingest_solicits(ifid),
                    Token::Advert(ifid) => self.ingest_adverts(ifid),
                    Token::Netlink => self.oracle.drain(),
                }
            }

            let elapsed = last.elapsed().as_millis() as i64;
            last = Instant::now();
            let mut out = Vec::new();
            self.age_sessions(elapsed, &mut out);
            self.flush(out);
        }
        info!("event loop stopped");
        Ok(())
    }

    /// Tear everything down in dependency order: sessions and proxies
    /// first, then interfaces (restoring their kernel flags).
    pub fn shutdown(&mut self) {
        for proxy in self.proxies.drain(..) {
            debug!(proxy = %proxy.id, sessions = proxy.sessions.len(), "proxy stopped");
            self.ifaces.remove_proxy(proxy.id);
        }
        self.ifaces.clear();
    }

    fn rebuild_poll_table(&mut self) {
        self.poll_table.clear();
        for (ifid, ifa) in self.ifaces.iter() {
            if let Some(fd) = ifa.packet_fd() {
                self.poll_table.push((fd, Token::Solicit(ifid)));
            }
            if let Some(fd) = ifa.icmp6_fd() {
                self.poll_table.push((fd, Token::Advert(ifid)));
            }
        }
        if let Some(fd) = self.oracle.poll_fd() {
            self.poll_table.push((fd, Token::Netlink));
        }
        debug!(entries = self.poll_table.len(), "poll table rebuilt");
    }

    /// One bounded poll; returns the tokens that became readable.
    fn poll_ready(&mut self) -> Result<Vec<Token>> {
        if self.ifaces.take_dirty() {
            self.rebuild_poll_table();
        }

        if self.poll_table.is_empty() {
            std::thread::sleep(Duration::from_millis(POLL_TIMEOUT_MS as u64));
            return Ok(Vec::new());
        }

        let mut fds: Vec<PollFd> = self
            .poll_table
            .iter()
            .map(|(fd, _)| PollFd::new(unsafe { BorrowedFd::borrow_raw(*fd) }, PollFlags::POLLIN))
            .collect();

        match poll(&mut fds, PollTimeout::from(POLL_TIMEOUT_MS)) {
            Ok(0) => Ok(Vec::new()),
            Ok(_) => Ok(fds
                .iter()
                .zip(&self.poll_table)
                .filter(|(pfd, _)| {
                    pfd.revents()
                        .unwrap_or(PollFlags::empty())
                        .intersects(PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP)
                })
                .map(|(_, (_, token))| *token)
                .collect()),
            Err(nix::errno::Errno::EINTR) => Ok(Vec::new()),
            Err(e) => Err(Error::Io(e.into())),
        }
    }

    /// Drain the packet socket of an interface.
    fn ingest_solicits(&mut self, ifid: IfaceId) {
        let mut out = Vec::new();
        loop {
            let mut buf = [0u8; READ_BUF];
            let n = match self.ifaces.get(ifid).recv_packet(&mut buf) {
                Ok(Some(n)) => n,
                Ok(None) => break,
                Err(e) => {
                    warn!(iface = %self.ifaces.get(ifid).name, error = %e, "packet read failed");
                    break;
                }
            };
            let Some(sol) = packet::parse_solicit(&buf[..n]) else {
                debug!(iface = %self.ifaces.get(ifid).name, len = n, "malformed frame dropped");
                continue;
            };
            self.dispatch_solicit(ifid, sol, &mut out);
        }
        self.flush(out);
    }

    /// Drain the ICMPv6 socket of an interface.
    fn ingest_adverts(&mut self, ifid: IfaceId) {
        let mut out = Vec::new();
        loop {
            let mut buf = [0u8; READ_BUF];
            let (n, saddr) = match self.ifaces.get(ifid).recv_advert(&mut buf) {
                Ok(Some(read)) => read,
                Ok(None) => break,
                Err(e) => {
                    warn!(iface = %self.ifaces.get(ifid).name, error = %e, "icmpv6 read failed");
                    break;
                }
            };
            let Some(adv) = packet::parse_advert(&buf[..n]) else {
                debug!(iface = %self.ifaces.get(ifid).name, "not a neighbor advertisement, dropped");
                continue;
            };
            self.dispatch_advert(ifid, saddr, adv.taddr, &mut out);
        }
        self.flush(out);
    }

    /// Route one decoded solicitation through the proxy layer.
    pub fn dispatch_solicit(&mut self, ifid: IfaceId, sol: Solicit, out: &mut Vec<Emission>) {
        let Self {
            proxies,
            ifaces,
            oracle,
            ..
        } = self;

        if oracle.is_local(&sol.saddr) {
            debug!(source = %sol.saddr, "solicit from a local address, ignored");
            return;
        }

        // Targets the host owns are answered directly when a proxy covers
        // them on this interface; the session machinery is not involved.
        if oracle.is_local(&sol.taddr) {
            let covered = ifaces.get(ifid).serves.iter().any(|pid| {
                proxies[pid.0]
                    .rules
                    .iter()
                    .any(|rule| rule.matches(&sol.taddr))
            });
            if covered {
                debug!(target = %sol.taddr, "target is a local address, answering directly");
                out.push(Emission::Advert {
                    ifid,
                    daddr: sol.saddr,
                    taddr: sol.taddr,
                    router: false,
                });
                return;
            }
        }

        // Keep the reverse leg warm: proxies probing through this
        // interface learn about the requester without a probe.
        if packet::is_unicast(&sol.saddr) {
            let parents = ifaces.get(ifid).parents.clone();
            for pid in parents {
                if let Some(autovia) = proxies[pid.0].reverse_match(&sol.saddr, ifid) {
                    proxies[pid.0]
                        .handle_stateless_advert(sol.saddr, sol.saddr, autovia, ifaces, oracle, out);
                }
            }
        }

        let serves = ifaces.get(ifid).serves.clone();
        if serves.is_empty() {
            debug!(iface = %ifaces.get(ifid).name, target = %sol.taddr, "solicit ignored");
            return;
        }
        for pid in serves {
            proxies[pid.0].handle_solicit(sol.saddr, sol.taddr, ifaces, oracle, out);
        }
    }

    /// Route one decoded advertisement through the proxy layer.
    pub fn dispatch_advert(
        &mut self,
        ifid: IfaceId,
        saddr: Ipv6Addr,
        taddr: Ipv6Addr,
        out: &mut Vec<Emission>,
    ) {
        let Self {
            proxies,
            ifaces,
            oracle,
            ..
        } = self;

        if oracle.is_local(&saddr) {
            debug!(source = %saddr, "advert from a local address, ignored");
            return;
        }

        let parents = ifaces.get(ifid).parents.clone();
        let mut handled = false;
        for pid in parents {
            let Some(autovia) = proxies[pid.0].advert_match(&taddr, ifid) else {
                continue;
            };
            handled = true;
            proxies[pid.0].handle_advert(saddr, taddr, autovia, out);
        }
        if !handled {
            debug!(
                iface = %ifaces.get(ifid).name,
                target = %taddr,
                "advert with no matching rule, dropped"
            );
        }
    }

    /// Age every live session by `elapsed` milliseconds.
    pub fn age_sessions(&mut self, elapsed: i64, out: &mut Vec<Emission>) {
        if elapsed <= 0 {
            return;
        }
        for proxy in &mut self.proxies {
            let params = proxy.params;
            proxy.sessions.retain_mut(|session| {
                let keep = session.tick(elapsed, &params, out);
                if !keep {
                    debug!(target = %session.taddr, "session evicted");
                }
                keep
            });
        }
    }

    /// Execute the wire operations the state layer asked for.
    pub fn flush(&self, out: Vec<Emission>) {
        for emission in out {
            let result = match emission {
                Emission::Solicit { ifid, taddr } => self.ifaces.get(ifid).write_solicit(&taddr),
                Emission::Advert {
                    ifid,
                    daddr,
                    taddr,
                    router,
                } => {
                    if !packet::is_unicast(&daddr) {
                        debug!(dst = %daddr, "advert to non-unicast destination suppressed");
                        continue;
                    }
                    self.ifaces.get(ifid).write_advert(&daddr, &taddr, router)
                }
            };
            if let Err(e) = result {
                if e.kind() == io::ErrorKind::WouldBlock {
                    continue;
                }
                warn!(error = %e, "send failed");
            }
        }
    }
}
