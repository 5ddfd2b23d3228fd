//! Resolved routing table.
//!
//! # Responsibilities
//! - Hold the fully expanded, ordered (matcher, target) list
//! - Answer lookups with first-match-wins semantics
//!
//! # Design Decisions
//! - Immutable after construction (shared freely between compilers)
//! - Tagged with the model snapshot version it was computed from
//! - Regexes compiled once at construction, never in the lookup path

use regex::Regex;

use crate::model::Target;
use crate::rules::matcher::{Destination, Matcher};

/// Where a route came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteOrigin {
    /// Id of the rule that produced the route.
    pub rule_id: String,
    /// Rule set the matcher was expanded from, if any.
    pub rule_set: Option<String>,
    /// Implicit trailing catch-all added by resolution.
    pub implicit: bool,
}

/// One (matcher, target) pair.
#[derive(Debug, Clone)]
pub struct Route {
    pub matcher: Matcher,
    pub target: Target,
    pub origin: RouteOrigin,
    regex: Option<Regex>,
}

impl Route {
    /// Build a route, compiling the regex of a `DomainRegex` matcher.
    pub fn new(matcher: Matcher, target: Target, origin: RouteOrigin) -> Result<Self, regex::Error> {
        let regex = match &matcher {
            Matcher::DomainRegex(pattern) => Some(Regex::new(pattern)?),
            _ => None,
        };
        Ok(Self {
            matcher,
            target,
            origin,
            regex,
        })
    }

    pub fn matches(&self, dest: &Destination) -> bool {
        self.matcher.matches(dest, self.regex.as_ref())
    }
}

/// Ordered routing table terminated by a catch-all.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    routes: Vec<Route>,
    version: u64,
}

impl RoutingTable {
    pub fn new(routes: Vec<Route>, version: u64) -> Self {
        Self { routes, version }
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Snapshot version this table was resolved from.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// First matching route, if any.
    pub fn find(&self, dest: &Destination) -> Option<&Route> {
        self.routes.iter().find(|r| r.matches(dest))
    }

    /// Target for a destination. A resolved table always ends in a catch-all,
    /// so the fallback only applies to hand-built tables.
    pub fn lookup(&self, dest: &Destination) -> &Target {
        self.find(dest).map(|r| &r.target).unwrap_or(&Target::Direct)
    }
}
