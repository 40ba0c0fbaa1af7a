//! Configuration file parsing.
//!
//! The format is an ordered list of `proxy <ifname> { ... }` sections.
//! Each section holds parameter lines (`key value`) and ordered
//! `rule <cidr> { ... }` sections; a rule names exactly one of
//! `iface <name>`, `static` or `auto`, plus an optional `autovia` flag.
//! `#` introduces a comment that runs to the end of the line.

use std::fs;
use std::path::Path;

use ipnet::Ipv6Net;
use tracing::warn;

use crate::error::{Error, Result};
use crate::session;

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub proxies: Vec<ProxyConfig>,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub ifname: String,
    pub router: bool,
    pub ttl: i64,
    pub deadtime: i64,
    pub timeout: i64,
    pub retries: u32,
    pub keepalive: bool,
    pub autowire: bool,
    pub promiscuous: bool,
    pub rules: Vec<RuleConfig>,
}

impl ProxyConfig {
    fn new(ifname: String) -> Self {
        Self {
            ifname,
            router: true,
            ttl: session::DEFAULT_TTL_MS,
            deadtime: session::DEFAULT_DEADTIME_MS,
            timeout: session::DEFAULT_TIMEOUT_MS,
            retries: session::DEFAULT_RETRIES,
            keepalive: true,
            autowire: false,
            promiscuous: false,
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleModeConfig {
    Iface(String),
    Static,
    Auto,
}

#[derive(Debug, Clone)]
pub struct RuleConfig {
    pub net: Ipv6Net,
    pub mode: RuleModeConfig,
    pub autovia: bool,
}

pub fn load(path: &Path) -> Result<Config> {
    let text = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
    parse(&text)
}

pub fn parse(text: &str) -> Result<Config> {
    let tokens = tokenize(text);
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
    };
    let mut config = Config::default();
    while let Some(tok) = parser.next() {
        match tok {
            "proxy" => config.proxies.push(parser.parse_proxy()?),
            other => {
                return Err(Error::Config(format!("unknown directive '{other}'")));
            }
        }
    }
    Ok(config)
}

fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for line in text.lines() {
        let line = line.split('#').next().unwrap_or("");
        for raw in line.split_whitespace() {
            let mut word = String::new();
            for ch in raw.chars() {
                if ch == '{' || ch == '}' {
                    if !word.is_empty() {
                        tokens.push(std::mem::take(&mut word));
                    }
                    tokens.push(ch.to_string());
                } else {
                    word.push(ch);
                }
            }
            if !word.is_empty() {
                tokens.push(word);
            }
        }
    }
    tokens
}

struct Parser<'a> {
    tokens: &'a [String],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn next(&mut self) -> Option<&'a str> {
        let tok = self.tokens.get(self.pos)?;
        self.pos += 1;
        Some(tok.as_str())
    }

    fn peek(&self) -> Option<&'a str> {
        self.tokens.get(self.pos).map(String::as_str)
    }

    fn expect(&mut self, want: &str) -> Result<()> {
        match self.next() {
            Some(tok) if tok == want => Ok(()),
            Some(tok) => Err(Error::Config(format!("expected '{want}', found '{tok}'"))),
            None => Err(Error::Config(format!("expected '{want}', found end of file"))),
        }
    }

    /// The value token following a key; braces mean the value is missing.
    fn value(&mut self, key: &str) -> Result<&'a str> {
        match self.next() {
            Some("{") | Some("}") | None => {
                Err(Error::Config(format!("'{key}' expects a value")))
            }
            Some(tok) => Ok(tok),
        }
    }

    fn bool_value(&mut self, key: &str) -> Result<bool> {
        match self.value(key)? {
            "yes" | "true" | "on" => Ok(true),
            "no" | "false" | "off" => Ok(false),
            other => Err(Error::Config(format!(
                "'{key}' expects a boolean, found '{other}'"
            ))),
        }
    }

    fn ms_value(&mut self, key: &str) -> Result<i64> {
        let tok = self.value(key)?;
        tok.parse::<i64>()
            .ok()
            .filter(|v| *v >= 0)
            .ok_or_else(|| Error::Config(format!("'{key}' expects milliseconds, found '{tok}'")))
    }

    fn parse_proxy(&mut self) -> Result<ProxyConfig> {
        let ifname = match self.next() {
            Some("{") | None => {
                return Err(Error::Config("'proxy' section is missing an interface name".into()));
            }
            Some(name) => name.to_string(),
        };
        self.expect("{")?;

        let mut proxy = ProxyConfig::new(ifname);
        loop {
            match self.next() {
                None => return Err(Error::Config("unterminated 'proxy' section".into())),
                Some("}") => break,
                Some("rule") => proxy.rules.push(self.parse_rule()?),
                Some("router") => proxy.router = self.bool_value("router")?,
                Some("keepalive") => proxy.keepalive = self.bool_value("keepalive")?,
                Some("autowire") => proxy.autowire = self.bool_value("autowire")?,
                Some("promiscuous") => proxy.promiscuous = self.bool_value("promiscuous")?,
                Some("ttl") => proxy.ttl = self.ms_value("ttl")?,
                Some("deadtime") => proxy.deadtime = self.ms_value("deadtime")?,
                Some("timeout") => proxy.timeout = self.ms_value("timeout")?,
                Some("retries") => {
                    let tok = self.value("retries")?;
                    proxy.retries = tok.parse().map_err(|_| {
                        Error::Config(format!("'retries' expects a count, found '{tok}'"))
                    })?;
                }
                Some(other) => {
                    warn!(key = other, "unknown proxy setting ignored");
                    if self.peek().is_some_and(|t| t != "{" && t != "}") {
                        self.next();
                    }
                }
            }
        }

        if proxy.rules.is_empty() {
            return Err(Error::Config(format!(
                "proxy '{}' has no rules",
                proxy.ifname
            )));
        }
        Ok(proxy)
    }

    fn parse_rule(&mut self) -> Result<RuleConfig> {
        let cidr = match self.next() {
            Some("{") | None => {
                return Err(Error::Config("'rule' is missing an IPv6 address or net".into()));
            }
            Some(tok) => tok,
        };
        let net: Ipv6Net = cidr
            .parse()
            .or_else(|_| cidr.parse::<std::net::Ipv6Addr>().map(Ipv6Net::from))
            .map_err(|_| Error::Config(format!("'{cidr}' is not a valid IPv6 address or net")))?;
        self.expect("{")?;

        let mut mode: Option<RuleModeConfig> = None;
        let mut autovia = false;
        let set_mode = |mode_slot: &mut Option<RuleModeConfig>, m: RuleModeConfig| {
            if mode_slot.is_some() {
                return Err(Error::Config(
                    "only one of 'iface', 'static' and 'auto' may be specified".into(),
                ));
            }
            *mode_slot = Some(m);
            Ok(())
        };

        loop {
            match self.next() {
                None => return Err(Error::Config("unterminated 'rule' section".into())),
                Some("}") => break,
                Some("iface") => {
                    let name = self.value("iface")?.to_string();
                    set_mode(&mut mode, RuleModeConfig::Iface(name))?;
                }
                Some("static") => set_mode(&mut mode, RuleModeConfig::Static)?,
                Some("auto") => set_mode(&mut mode, RuleModeConfig::Auto)?,
                Some("autovia") => autovia = self.bool_value("autovia")?,
                Some(other) => {
                    warn!(key = other, "unknown rule setting ignored");
                    if self.peek().is_some_and(|t| t != "{" && t != "}") {
                        self.next();
                    }
                }
            }
        }

        let Some(mode) = mode else {
            return Err(Error::Config(
                "you must specify one of 'iface', 'static' and 'auto'".into(),
            ));
        };

        if mode == RuleModeConfig::Static && net.prefix_len() <= 120 {
            warn!(
                rule = %net,
                "low prefix length with 'static' answers a very large range"
            );
        }

        Ok(RuleConfig {
            net,
            mode,
            autovia,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_a_full_example() {
        let text = r#"
            # forward 2001:db8::/64 from eth0 to eth1
            proxy eth0 {
                router no
                timeout 250
                ttl 10000
                retries 2
                rule 2001:db8::/64 {
                    iface eth1
                    autovia yes
                }
                rule 2001:db8:1::/64 {
                    static
                }
                rule 2001:db8:2::/64 {
                    auto
                }
            }
        "#;
        let config = parse(text).unwrap();
        assert_eq!(config.proxies.len(), 1);

        let proxy = &config.proxies[0];
        assert_eq!(proxy.ifname, "eth0");
        assert!(!proxy.router);
        assert_eq!(proxy.timeout, 250);
        assert_eq!(proxy.ttl, 10000);
        assert_eq!(proxy.retries, 2);
        // Untouched settings keep their defaults.
        assert!(proxy.keepalive);
        assert_eq!(proxy.deadtime, 3000);
        assert!(!proxy.promiscuous);

        assert_eq!(proxy.rules.len(), 3);
        assert_eq!(
            proxy.rules[0].mode,
            RuleModeConfig::Iface("eth1".to_string())
        );
        assert!(proxy.rules[0].autovia);
        assert_eq!(proxy.rules[1].mode, RuleModeConfig::Static);
        assert_eq!(proxy.rules[2].mode, RuleModeConfig::Auto);
    }

    #[test]
    fn braces_may_hug_the_words() {
        let config = parse("proxy eth0 {rule 2001:db8::/64 {static}}").unwrap();
        assert_eq!(config.proxies[0].rules.len(), 1);
    }

    #[test]
    fn bare_address_becomes_a_host_net() {
        let config = parse("proxy eth0 { rule 2001:db8::1 { static } }").unwrap();
        assert_eq!(config.proxies[0].rules[0].net.prefix_len(), 128);
    }

    #[test]
    fn rejects_conflicting_modes() {
        let err = parse("proxy eth0 { rule 2001:db8::/64 { iface eth1 static } }").unwrap_err();
        assert!(err.to_string().contains("only one of"));
    }

    #[test]
    fn rejects_missing_mode() {
        let err = parse("proxy eth0 { rule 2001:db8::/64 { autovia no } }").unwrap_err();
        assert!(err.to_string().contains("must specify"));
    }

    #[test]
    fn rejects_empty_proxy() {
        assert!(parse("proxy eth0 { }").is_err());
        assert!(parse("proxy { }").is_err());
    }

    #[test]
    fn rejects_bad_values() {
        assert!(parse("proxy eth0 { ttl fast rule 2001:db8::/64 { auto } }").is_err());
        assert!(parse("proxy eth0 { rule nonsense { auto } }").is_err());
        assert!(parse("proxy eth0 { router maybe rule 2001:db8::/64 { auto } }").is_err());
        assert!(parse("proxy eth0 { rule 2001:db8::/64 { auto }").is_err());
    }

    #[test]
    fn loads_from_a_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "proxy lo {{ rule 2001:db8::/64 {{ static }} }}").unwrap();
        let config = load(file.path()).unwrap();
        assert_eq!(config.proxies[0].ifname, "lo");

        assert!(load(Path::new("/nonexistent/ndproxyd.conf")).is_err());
    }
}
