//! Host routing rules.
//!
//! An ordered list of host patterns decides which requests may be served
//! from the content channel and which get special connection handling.
//! The list is loaded once at startup and never changes.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::{info, warn};

use crate::http::scan;

/// Per-rule policy bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuleFlags(u16);

impl RuleFlags {
    /// Host must carry a dot in the resource name.
    pub const NEED_DOT: u16 = 0x1;

    /// Disqualified when the request carries a cookie.
    pub const NO_COOKIE: u16 = 0x2;

    /// Disqualified when the request carries a referer.
    pub const NO_REFERER: u16 = 0x4;

    /// Disqualified when the resource name carries a query.
    pub const NO_QUERY: u16 = 0x8;

    /// Cap origin connections for this host at one.
    pub const SINGLE_CONN: u16 = 0x10;

    /// The resource name starts with a further host to peel off.
    pub const PROXY: u16 = 0x20;

    /// Reject the request outright, no response bytes.
    pub const FAIL_QUICK: u16 = 0x100;

    pub fn empty() -> Self {
        RuleFlags(0)
    }

    pub fn set(&mut self, flag: u16) {
        self.0 |= flag;
    }

    pub fn is_set(&self, flag: u16) -> bool {
        (self.0 & flag) != 0
    }

    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

/// One line of the routing list.
#[derive(Debug, Clone)]
pub struct HostRule {
    /// Literal host, or a `*`-prefixed suffix pattern.
    pub pattern: String,
    pub flags: RuleFlags,
}

fn same_host(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

impl HostRule {
    /// True when `host` falls under this rule. A `*.suffix` pattern also
    /// accepts the bare suffix without its leading dot, so `*.example.com`
    /// covers `example.com` itself.
    pub fn matches(&self, host: &str) -> bool {
        let pat = self.pattern.as_bytes();
        if pat.first() == Some(&b'*') {
            let suffix = &self.pattern[1..];
            if host.len() >= suffix.len()
                && same_host(&host[host.len() - suffix.len()..], suffix)
            {
                return true;
            }
            if pat.get(1) == Some(&b'.') && same_host(host, &self.pattern[2..]) {
                return true;
            }
            false
        } else {
            same_host(host, &self.pattern)
        }
    }
}

/// Ordered rule list; first match wins.
#[derive(Debug, Default)]
pub struct RoutingTable {
    rules: Vec<HostRule>,
}

impl RoutingTable {
    pub fn new() -> Self {
        RoutingTable { rules: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn push(&mut self, rule: HostRule) {
        self.rules.push(rule);
    }

    pub fn select(&self, host: &str) -> Option<&HostRule> {
        self.rules.iter().find(|r| r.matches(host))
    }

    /// Load rules from a line-oriented list file. A missing file is not an
    /// error; the proxy just runs with no fetch-eligible hosts.
    pub fn load(path: &Path) -> RoutingTable {
        let mut table = RoutingTable::new();
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "no routing list, all traffic stays HTTP");
                return table;
            }
        };
        for line in BufReader::new(file).lines() {
            let Ok(line) = line else { break };
            let buf = line.as_bytes();
            let start = scan::skip_over_blank(buf, 0);
            let end = scan::skip_to_blank(buf, start);
            if end <= start || buf[start] == b'#' {
                continue;
            }
            let mut rule = HostRule {
                pattern: line[start..end].to_string(),
                flags: RuleFlags::empty(),
            };
            let mut pos = end;
            loop {
                let start = scan::skip_over_blank(buf, pos);
                pos = scan::skip_to_blank(buf, start);
                if pos <= start {
                    break;
                }
                match &line[start..pos] {
                    "-noCookie" => rule.flags.set(RuleFlags::NO_COOKIE),
                    "-noReferer" => rule.flags.set(RuleFlags::NO_REFERER),
                    "-needDot" => rule.flags.set(RuleFlags::NEED_DOT),
                    "-noQuery" => rule.flags.set(RuleFlags::NO_QUERY),
                    "-single" => rule.flags.set(RuleFlags::SINGLE_CONN),
                    "-proxy" => rule.flags.set(RuleFlags::PROXY),
                    "-fail" => rule.flags.set(RuleFlags::FAIL_QUICK),
                    other => warn!(flag = other, pattern = rule.pattern, "unknown rule flag"),
                }
            }
            table.push(rule);
        }
        info!(path = %path.display(), rules = table.len(), "routing list loaded");
        table
    }
}
