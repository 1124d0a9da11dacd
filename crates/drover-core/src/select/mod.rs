//! Compound target-selection expressions.
//!
//! A selection is an ordered sequence of terms interleaved with `and`/`or`
//! connectives, evaluated strictly left to right — there is no precedence
//! and no grouping. The textual form (`droverctl call -C ...`) round-trips
//! through [`SelectionOptions::parse`] and [`SelectionOptions::to_text`]:
//!
//! ```text
//! web01,web02              exact names ("*" matches all)
//! E@web[0-9]+              host name regex
//! R@%-prod                 id range (leading % = suffix, trailing % = prefix)
//! N@web,api                host-group membership
//! S@10.0.0.0/8             IP in CIDR range
//! G@os:linux               grain equals
//! P@os:ubuntu.*            grain regex
//! I@role:db                pillar equals
//! J@role:web.*             pillar regex
//! ```

mod matcher;
mod parse;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Facts a selection expression is evaluated against.
///
/// The master synthesizes implementations from pipe-cached fields; the
/// minion implements it over its own configuration.
pub trait SelectionTarget {
    /// The minion name.
    fn id(&self) -> &str;
    /// The minion address, empty when unknown.
    fn ip(&self) -> &str;
    /// Host groups the minion belongs to.
    fn groups(&self) -> &[String];
    /// Static facts (os, arch, ...).
    fn grains(&self) -> &HashMap<String, String>;
    /// Configuration data attached to the minion.
    fn pillars(&self) -> &HashMap<String, String>;
}

/// One element of a selection sequence: a term or a connective.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Selection {
    /// Exact host-name list; `*` matches every target.
    Hosts(Vec<String>),
    /// Host-name regex.
    HostRegex(String),
    /// Id-range pattern with `%` prefix/suffix markers.
    IdRange(String),
    /// Membership in any listed host group.
    Groups(Vec<String>),
    /// IP membership in a comma-separated CIDR list.
    IpCidr(String),
    /// Grain equality.
    Grain {
        /// Grain key.
        key: String,
        /// Expected value.
        value: String,
    },
    /// Grain regex.
    GrainRegex {
        /// Grain key.
        key: String,
        /// Pattern over the grain value.
        pattern: String,
    },
    /// Pillar equality.
    Pillar {
        /// Pillar key.
        key: String,
        /// Expected value.
        value: String,
    },
    /// Pillar regex.
    PillarRegex {
        /// Pillar key.
        key: String,
        /// Pattern over the pillar value.
        pattern: String,
    },
    /// Logical AND connective.
    And,
    /// Logical OR connective.
    Or,
}

impl Selection {
    /// True for the `and`/`or` connectives.
    #[must_use]
    pub const fn is_logic(&self) -> bool {
        matches!(self, Self::And | Self::Or)
    }

    /// True for grain/pillar terms, which the scheduler's coarse filter
    /// skips.
    #[must_use]
    pub const fn is_fact_term(&self) -> bool {
        matches!(
            self,
            Self::Grain { .. }
                | Self::GrainRegex { .. }
                | Self::Pillar { .. }
                | Self::PillarRegex { .. }
        )
    }

    /// Renders the element in expression text form.
    #[must_use]
    pub fn to_text(&self) -> String {
        match self {
            Self::Hosts(hosts) => hosts.join(","),
            Self::HostRegex(pattern) => format!("E@{pattern}"),
            Self::IdRange(range) => format!("R@{range}"),
            Self::Groups(groups) => format!("N@{}", groups.join(",")),
            Self::IpCidr(cidr) => format!("S@{cidr}"),
            Self::Grain { key, value } => format!("G@{key}:{value}"),
            Self::GrainRegex { key, pattern } => format!("P@{key}:{pattern}"),
            Self::Pillar { key, value } => format!("I@{key}:{value}"),
            Self::PillarRegex { key, pattern } => format!("J@{key}:{pattern}"),
            Self::And => "and".to_string(),
            Self::Or => "or".to_string(),
        }
    }
}

/// An ordered selection expression.
///
/// The sequence shape is `term (connective term)*`; [`validate`]
/// (SelectionOptions::validate) enforces it and pre-compiles every regex
/// and CIDR so evaluation cannot hit a syntax error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionOptions {
    /// The element sequence.
    pub selections: Vec<Selection>,
}

impl SelectionOptions {
    /// Starts an expression from its first term.
    ///
    /// # Errors
    ///
    /// Returns `bad-request` when `term` is a connective.
    pub fn with(term: Selection) -> Result<Self> {
        if term.is_logic() {
            return Err(Error::bad_request("selection cannot start with a connective"));
        }
        Ok(Self {
            selections: vec![term],
        })
    }

    /// Appends `and <term>` to the expression.
    #[must_use]
    pub fn and(mut self, term: Selection) -> Self {
        self.selections.push(Selection::And);
        self.selections.push(term);
        self
    }

    /// Appends `or <term>` to the expression.
    #[must_use]
    pub fn or(mut self, term: Selection) -> Self {
        self.selections.push(Selection::Or);
        self.selections.push(term);
        self
    }

    /// Renders the whole expression as space-separated text.
    #[must_use]
    pub fn to_text(&self) -> String {
        self.selections
            .iter()
            .map(Selection::to_text)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// When the expression is exactly one host-list term, returns the
    /// hosts. This is the scheduler's fast path.
    #[must_use]
    pub fn single_host_list(&self) -> Option<&[String]> {
        match self.selections.as_slice() {
            [Selection::Hosts(hosts)] if !hosts.is_empty() => Some(hosts),
            _ => None,
        }
    }

    /// Checks the structural invariants and compiles every regex/CIDR.
    ///
    /// Invariants: the sequence is non-empty, the first element is a
    /// term, terms and connectives strictly alternate, and the last
    /// element is a term.
    ///
    /// # Errors
    ///
    /// Returns `bad-request` naming the offending element.
    pub fn validate(&self) -> Result<()> {
        if self.selections.is_empty() {
            return Err(Error::bad_request("empty selection"));
        }

        let mut last_was_logic = true; // position 0 must be a term
        for (i, sel) in self.selections.iter().enumerate() {
            if sel.is_logic() == last_was_logic {
                return Err(Error::bad_request(format!(
                    "misplaced '{}' at selection[{i}]",
                    sel.to_text()
                )));
            }
            last_was_logic = sel.is_logic();

            match sel {
                Selection::Hosts(hosts) if hosts.iter().any(|h| h.is_empty()) => {
                    return Err(Error::bad_request(format!(
                        "empty host name at selection[{i}]"
                    )));
                }
                Selection::HostRegex(pattern)
                | Selection::GrainRegex { pattern, .. }
                | Selection::PillarRegex { pattern, .. } => {
                    regex::Regex::new(pattern).map_err(|_| {
                        Error::bad_request(format!(
                            "invalid regexp '{pattern}' at selection[{i}]"
                        ))
                    })?;
                }
                Selection::IpCidr(cidr) => {
                    matcher::parse_cidr_list(cidr).map_err(|_| {
                        Error::bad_request(format!("invalid ip range at selection[{i}]"))
                    })?;
                }
                _ => {}
            }
        }

        if last_was_logic {
            return Err(Error::bad_request("selection ends with a connective"));
        }
        Ok(())
    }
}
