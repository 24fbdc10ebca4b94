//! Host and path matching on segment tries
//!
//! Patterns have the form `host/path`. The host part may be empty (matches
//! requests for any host) and may use `*` for a single label, as in
//! `*.example.com`. Path segments are literal, `*` for exactly one segment,
//! or a trailing `*` covering one or more remaining segments.
//!
//! Lookups backtrack: at every level the literal child is tried first, then
//! the single-segment wildcard, then a trailing wildcard, so the most literal
//! route that fully matches wins. Routes bound to a host are tried before
//! host-less ones.

use crate::error::{Result, ToolkitError};
use std::collections::HashMap;

const WILDCARD: &str = "*";

struct PathNode<V> {
    exact: HashMap<String, PathNode<V>>,
    wildcard: Option<Box<PathNode<V>>>,
    /// Value when the path ends here
    value: Option<V>,
    /// Value for one or more further segments
    rest: Option<V>,
}

impl<V> Default for PathNode<V> {
    fn default() -> Self {
        Self {
            exact: HashMap::new(),
            wildcard: None,
            value: None,
            rest: None,
        }
    }
}

impl<V> PathNode<V> {
    fn insert(&mut self, segments: &[&str], value: V) -> Option<V> {
        match segments {
            [] => self.value.replace(value),
            [last] if *last == WILDCARD => self.rest.replace(value),
            [first, tail @ ..] => {
                let child: &mut PathNode<V> = if *first == WILDCARD {
                    self.wildcard.get_or_insert_with(Default::default)
                } else {
                    self.exact.entry(first.to_string()).or_default()
                };
                child.insert(tail, value)
            }
        }
    }

    fn find(&self, segments: &[&str]) -> Option<&V> {
        let Some((first, tail)) = segments.split_first() else {
            return self.value.as_ref();
        };

        if let Some(found) = self.exact.get(*first).and_then(|child| child.find(tail)) {
            return Some(found);
        }
        if let Some(found) = self.wildcard.as_ref().and_then(|child| child.find(tail)) {
            return Some(found);
        }
        self.rest.as_ref()
    }
}

struct HostNode<V> {
    labels: HashMap<String, HostNode<V>>,
    wildcard: Option<Box<HostNode<V>>>,
    paths: Option<PathNode<V>>,
}

impl<V> Default for HostNode<V> {
    fn default() -> Self {
        Self {
            labels: HashMap::new(),
            wildcard: None,
            paths: None,
        }
    }
}

impl<V> HostNode<V> {
    fn descend(&mut self, labels: &[&str]) -> &mut PathNode<V> {
        match labels.split_first() {
            None => self.paths.get_or_insert_with(Default::default),
            Some((first, tail)) => {
                let child: &mut HostNode<V> = if *first == WILDCARD {
                    self.wildcard.get_or_insert_with(Default::default)
                } else {
                    self.labels.entry(first.to_string()).or_default()
                };
                child.descend(tail)
            }
        }
    }

    fn find(&self, labels: &[&str], segments: &[&str]) -> Option<&V> {
        let Some((first, tail)) = labels.split_first() else {
            return self.paths.as_ref().and_then(|paths| paths.find(segments));
        };

        if let Some(found) = self
            .labels
            .get(*first)
            .and_then(|child| child.find(tail, segments))
        {
            return Some(found);
        }
        self.wildcard
            .as_ref()
            .and_then(|child| child.find(tail, segments))
    }
}

/// Router mapping `host/path` patterns to values
pub struct UrlRouter<V> {
    hosts: HostNode<V>,
    any_host: PathNode<V>,
    routes: usize,
}

impl<V> Default for UrlRouter<V> {
    fn default() -> Self {
        Self {
            hosts: HostNode::default(),
            any_host: PathNode::default(),
            routes: 0,
        }
    }
}

impl<V> UrlRouter<V> {
    /// Create an empty router
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a router from `(pattern, value)` rules, failing on the first bad
    /// pattern
    pub fn from_rules<I, S>(rules: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, V)>,
        S: AsRef<str>,
    {
        let mut router = Self::new();
        for (pattern, value) in rules {
            router.add(pattern.as_ref(), value)?;
        }
        Ok(router)
    }

    /// Register `value` under `pattern`, replacing any previous value for
    /// the same pattern
    pub fn add(&mut self, pattern: &str, value: V) -> Result<()> {
        let Some(path_start) = pattern.find('/') else {
            return Err(ToolkitError::invalid_pattern(format!(
                "{}: missing path",
                pattern
            )));
        };

        let host = pattern[..path_start].to_ascii_lowercase();
        if host.contains(':') && !is_ip_literal(&host) {
            return Err(ToolkitError::invalid_pattern(format!(
                "{}: ports are not allowed in host patterns",
                pattern
            )));
        }

        let segments = split_path(&pattern[path_start..]);

        let paths = if host.is_empty() {
            &mut self.any_host
        } else {
            let labels: Vec<&str> = host.split('.').collect();
            if labels.iter().any(|label| label.is_empty()) {
                return Err(ToolkitError::invalid_pattern(format!(
                    "{}: empty host label",
                    pattern
                )));
            }
            self.hosts.descend(&labels)
        };

        if paths.insert(&segments, value).is_none() {
            self.routes += 1;
        }
        Ok(())
    }

    /// Look up a path, optionally for a given host
    pub fn find(&self, host: Option<&str>, path: &str) -> Option<&V> {
        let segments = split_path(path);

        if let Some(host) = host.filter(|host| !host.is_empty()) {
            let host = host.to_ascii_lowercase();
            let labels: Vec<&str> = host.split('.').collect();
            if let Some(found) = self.hosts.find(&labels, &segments) {
                return Some(found);
            }
        }

        let found = self.any_host.find(&segments);
        if found.is_none() {
            tracing::debug!("No route for {:?}{}", host, path);
        }
        found
    }

    /// Look up a request target of the form `host[:port]/path[?query]`
    pub fn find_url(&self, url: &str) -> Option<&V> {
        let path_start = url.find('/')?;
        let (authority, rest) = url.split_at(path_start);

        let host = strip_port(authority);
        let path = match rest.find('?') {
            Some(query) => &rest[..query],
            None => rest,
        };

        self.find(Some(host), path)
    }

    /// Number of distinct patterns registered
    pub fn len(&self) -> usize {
        self.routes
    }

    /// Check if no pattern is registered
    pub fn is_empty(&self) -> bool {
        self.routes == 0
    }
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|segment| !segment.is_empty()).collect()
}

/// Bracketed IPv6 literal such as `[::1]`
fn is_ip_literal(host: &str) -> bool {
    host.starts_with('[') && host.ends_with(']')
}

/// Drop a trailing `:port`, leaving IPv6 literals intact
fn strip_port(authority: &str) -> &str {
    match authority.rsplit_once(':') {
        Some((host, port))
            if port.bytes().all(|b| b.is_ascii_digit())
                && (!host.contains(':') || is_ip_literal(host)) =>
        {
            host
        }
        _ => authority,
    }
}
