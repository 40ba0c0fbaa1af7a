//! Per-target reachability sessions.
//!
//! A session tracks one target address within one proxy: whether the real
//! owner answered on a daughter interface, who is still waiting for an
//! answer on the parent side, and when to probe again. Sessions never touch
//! sockets themselves; every state change appends [`Emission`] values that
//! the reactor executes.

use std::collections::BTreeSet;
use std::net::Ipv6Addr;

use tracing::debug;

use crate::iface::IfaceId;
use crate::packet;

pub const DEFAULT_TTL_MS: i64 = 30_000;
pub const DEFAULT_DEADTIME_MS: i64 = 3_000;
pub const DEFAULT_TIMEOUT_MS: i64 = 500;
pub const DEFAULT_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Probes are out, no answer yet.
    Waiting,
    /// The target answered and is being advertised.
    Valid,
    /// The ttl ran out; re-probing before giving the session up.
    Renewing,
    /// Probing failed; the session lingers for `deadtime` to absorb
    /// repeated solicits for an unreachable target.
    Invalid,
}

/// A wire operation requested by the state layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emission {
    /// Neighbor solicitation for `taddr` out of `ifid`.
    Solicit { ifid: IfaceId, taddr: Ipv6Addr },
    /// Neighbor advertisement for `taddr` to `daddr` out of `ifid`.
    Advert {
        ifid: IfaceId,
        daddr: Ipv6Addr,
        taddr: Ipv6Addr,
        router: bool,
    },
}

/// Proxy tunables threaded into every session operation.
#[derive(Debug, Clone, Copy)]
pub struct ProxyParams {
    pub parent: IfaceId,
    pub router: bool,
    pub ttl: i64,
    pub deadtime: i64,
    pub timeout: i64,
    pub retries: u32,
    pub keepalive: bool,
    pub autowire: bool,
}

impl ProxyParams {
    pub fn new(parent: IfaceId) -> Self {
        Self {
            parent,
            router: true,
            ttl: DEFAULT_TTL_MS,
            deadtime: DEFAULT_DEADTIME_MS,
            timeout: DEFAULT_TIMEOUT_MS,
            retries: DEFAULT_RETRIES,
            keepalive: true,
            autowire: false,
        }
    }
}

pub struct Session {
    pub taddr: Ipv6Addr,
    status: Status,
    ttl: i64,
    fails: u32,
    touched: bool,
    /// Daughter interfaces to probe, deduplicated.
    pub ifaces: Vec<IfaceId>,
    /// Requesters waiting for the target to become reachable.
    pending: BTreeSet<Ipv6Addr>,
    /// Requesters already answered since the last aging pass.
    answered: BTreeSet<Ipv6Addr>,
}

impl Session {
    pub fn new(taddr: Ipv6Addr, params: &ProxyParams) -> Self {
        debug!(target = %taddr, "session created");
        Self {
            taddr,
            status: Status::Waiting,
            ttl: params.ttl,
            fails: 0,
            touched: false,
            ifaces: Vec::new(),
            pending: BTreeSet::new(),
            answered: BTreeSet::new(),
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Add a daughter interface to probe; already-present entries are a no-op.
    pub fn add_iface(&mut self, ifid: IfaceId) {
        if !self.ifaces.contains(&ifid) {
            self.ifaces.push(ifid);
        }
    }

    /// Register a requester to answer once the target turns out reachable.
    /// The target itself and non-unicast sources are never queued.
    pub fn add_pending(&mut self, addr: Ipv6Addr) {
        if addr != self.taddr && packet::is_unicast(&addr) {
            self.pending.insert(addr);
        }
    }

    pub fn pending_contains(&self, addr: &Ipv6Addr) -> bool {
        self.pending.contains(addr)
    }

    /// A solicit came in for this target. The first touch of a probing
    /// cycle sends the solicits; an invalidated session restarts probing
    /// with a fresh retry budget.
    pub fn touch(&mut self, params: &ProxyParams, out: &mut Vec<Emission>) {
        match self.status {
            Status::Waiting if !self.touched => {
                self.ttl = params.timeout;
                debug!(target = %self.taddr, "session is now probing");
                self.probe(out);
            }
            Status::Invalid => {
                self.status = Status::Waiting;
                self.ttl = params.timeout;
                self.fails = 0;
                debug!(target = %self.taddr, "session reprobing after deadtime");
                self.probe(out);
            }
            _ => {}
        }
        self.touched = true;
    }

    /// Answer a requester right away (session already VALID/RENEWING).
    /// Each requester is answered at most once per aging pass.
    pub fn answer(&mut self, daddr: Ipv6Addr, params: &ProxyParams, out: &mut Vec<Emission>) {
        if !packet::is_unicast(&daddr) {
            return;
        }
        if self.answered.insert(daddr) {
            out.push(Emission::Advert {
                ifid: params.parent,
                daddr,
                taddr: self.taddr,
                router: params.router,
            });
        }
    }

    /// The target proved reachable (a daughter advert arrived, or the rule
    /// is static): go VALID and flush everyone who was waiting.
    pub fn handle_advert(&mut self, params: &ProxyParams, out: &mut Vec<Emission>) {
        if self.status != Status::Valid {
            debug!(target = %self.taddr, "session is active");
        }
        self.status = Status::Valid;
        self.ttl = params.ttl;
        self.fails = 0;
        for daddr in std::mem::take(&mut self.pending) {
            debug!(target = %self.taddr, requester = %daddr, "forwarding advert");
            out.push(Emission::Advert {
                ifid: params.parent,
                daddr,
                taddr: self.taddr,
                router: params.router,
            });
        }
    }

    /// Age the session by `elapsed` milliseconds. Returns false when the
    /// session should be evicted from its proxy.
    pub fn tick(&mut self, elapsed: i64, params: &ProxyParams, out: &mut Vec<Emission>) -> bool {
        self.answered.clear();
        self.ttl -= elapsed;
        if self.ttl > 0 {
            return true;
        }

        match self.status {
            Status::Waiting => {
                if self.fails < params.retries {
                    self.ttl = params.timeout;
                    self.fails += 1;
                    debug!(target = %self.taddr, fails = self.fails, "session retrying");
                    self.probe(out);
                } else {
                    debug!(target = %self.taddr, "session is now invalid");
                    self.status = Status::Invalid;
                    self.ttl = params.deadtime;
                }
                true
            }
            Status::Renewing => {
                if self.fails < params.retries {
                    self.ttl = params.timeout;
                    self.fails += 1;
                    debug!(target = %self.taddr, fails = self.fails, "session retrying renewal");
                    self.probe(out);
                    true
                } else {
                    debug!(target = %self.taddr, "renewal failed");
                    false
                }
            }
            Status::Valid => {
                if self.touched || params.keepalive {
                    self.status = Status::Renewing;
                    self.ttl = params.timeout;
                    self.fails = 0;
                    self.touched = false;
                    debug!(target = %self.taddr, "session is renewing");
                    self.probe(out);
                    true
                } else {
                    false
                }
            }
            Status::Invalid => false,
        }
    }

    fn probe(&self, out: &mut Vec<Emission>) {
        for &ifid in &self.ifaces {
            out.push(Emission::Solicit {
                ifid,
                taddr: self.taddr,
            });
        }
    }
}
