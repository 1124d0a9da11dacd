//! Selection evaluation against a target's facts.
//!
//! Every term reduces to `(matched, hit)`: `matched` is the boolean value
//! the fold consumes, `hit` records whether the target even carried the
//! attribute the term queried. The distinction lets the scheduler keep a
//! pipe whose master-side facts are incomplete and let the minion-side
//! refinement make the final decision.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::error::{Error, Result};

use super::{Selection, SelectionOptions, SelectionTarget};

/// Parses a comma-separated CIDR list; bare addresses become host routes.
pub(super) fn parse_cidr_list(text: &str) -> Result<Vec<IpNet>> {
    text.split(',')
        .map(str::trim)
        .map(|part| {
            if let Ok(net) = part.parse::<IpNet>() {
                return Ok(net);
            }
            let addr: IpAddr = part
                .parse()
                .map_err(|_| Error::bad_request(format!("invalid cidr '{part}'")))?;
            Ok(IpNet::from(addr))
        })
        .collect()
}

impl Selection {
    /// Matches a minion name against a host list, host regex, or id
    /// range. `hit` is true exactly when this term queries the name.
    #[must_use]
    pub fn match_id(&self, id: &str) -> (bool, bool) {
        match self {
            Self::Hosts(hosts) => {
                let matched = hosts.iter().any(|h| h == "*" || h == id);
                (matched, true)
            }
            Self::HostRegex(pattern) => {
                let matched = regex::Regex::new(pattern)
                    .map(|re| re.is_match(id))
                    .unwrap_or(false);
                (matched, true)
            }
            Self::IdRange(range) => (match_id_range(range, id), true),
            _ => (false, false),
        }
    }

    /// Matches a target address against a CIDR list term.
    #[must_use]
    pub fn match_ip(&self, ip: &str) -> (bool, bool) {
        let Self::IpCidr(cidr) = self else {
            return (false, false);
        };
        let Ok(addr) = ip.parse::<IpAddr>() else {
            return (false, true);
        };
        let matched = parse_cidr_list(cidr)
            .map(|nets| nets.iter().any(|net| net.contains(&addr)))
            .unwrap_or(false);
        (matched, true)
    }

    /// Reduces this term to `(matched, hit)` against `target`.
    ///
    /// Returns `None` for connectives and — in `simple` mode — for grain
    /// and pillar terms, which the caller's fold must skip entirely.
    fn evaluate(&self, target: &dyn SelectionTarget, simple: bool) -> Option<(bool, bool)> {
        match self {
            Self::And | Self::Or => None,
            Self::Hosts(_) | Self::HostRegex(_) | Self::IdRange(_) => {
                Some(self.match_id(target.id()))
            }
            Self::IpCidr(_) => {
                if target.ip().is_empty() {
                    Some((false, false))
                } else {
                    Some(self.match_ip(target.ip()))
                }
            }
            Self::Groups(wanted) => {
                let groups = target.groups();
                if groups.is_empty() {
                    Some((false, false))
                } else {
                    let matched = groups.iter().any(|g| wanted.contains(g));
                    Some((matched, true))
                }
            }
            _ if simple => None,
            Self::Grain { key, value } => Some(match_fact_eq(target.grains(), key, value)),
            Self::GrainRegex { key, pattern } => {
                Some(match_fact_regex(target.grains(), key, pattern))
            }
            Self::Pillar { key, value } => Some(match_fact_eq(target.pillars(), key, value)),
            Self::PillarRegex { key, pattern } => {
                Some(match_fact_regex(target.pillars(), key, pattern))
            }
        }
    }
}

fn match_id_range(range: &str, id: &str) -> bool {
    let mut core = range;
    let suffix_mode = core.starts_with('%');
    if suffix_mode {
        core = &core[1..];
    }
    let prefix_mode = !core.is_empty() && core.ends_with('%');
    if prefix_mode {
        core = &core[..core.len() - 1];
    }

    match (suffix_mode, prefix_mode) {
        (true, true) => id.contains(core),
        (true, false) => id.ends_with(core),
        (false, true) => id.starts_with(core),
        (false, false) => id == range,
    }
}

fn match_fact_eq(
    facts: &std::collections::HashMap<String, String>,
    key: &str,
    value: &str,
) -> (bool, bool) {
    match facts.get(key) {
        Some(v) => (v == value, true),
        None => (false, false),
    }
}

fn match_fact_regex(
    facts: &std::collections::HashMap<String, String>,
    key: &str,
    pattern: &str,
) -> (bool, bool) {
    match facts.get(key) {
        Some(v) => {
            let matched = regex::Regex::new(pattern)
                .map(|re| re.is_match(v))
                .unwrap_or(false);
            (matched, true)
        }
        None => (false, false),
    }
}

impl SelectionOptions {
    /// Evaluates the expression against `target`, folding terms with the
    /// inline connectives in document order.
    ///
    /// In `simple` mode grain and pillar terms are skipped together with
    /// their connective, so an expression that only queries facts the
    /// master does not hold reduces to `(true, false)` — kept, pending
    /// minion-side refinement.
    ///
    /// The returned `hit` flag is true when at least one evaluated term
    /// found the attribute it queried on the target.
    #[must_use]
    pub fn match_target(&self, target: &dyn SelectionTarget, simple: bool) -> (bool, bool) {
        let mut acc: Option<bool> = None;
        let mut pending: Option<Selection> = None;
        let mut any_hit = false;

        for sel in &self.selections {
            if sel.is_logic() {
                pending = Some(sel.clone());
                continue;
            }
            let Some((matched, hit)) = sel.evaluate(target, simple) else {
                // Skipped term: its connective must not dangle.
                pending = None;
                continue;
            };
            any_hit |= hit;
            acc = Some(match (acc, pending.take()) {
                (None, _) => matched,
                (Some(prev), Some(Selection::Or)) => prev || matched,
                (Some(prev), _) => prev && matched,
            });
        }

        (acc.unwrap_or(true), any_hit)
    }
}
