//! Route table
//!
//! Patterns are `/`-separated segments. A segment is either a literal,
//! compared case-insensitively, or a `{name}` capture matching one segment.
//! A final `{*name}` captures the rest of the path. Captured values are
//! percent-decoded.
//!
//! Lookup distinguishes a path nothing matches (404) from a path that
//! matches with the wrong verb (405).

use kestrun_common::{KestrunError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::languages::{Delegate, ScriptLanguage};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Capture(String),
    CatchAll(String),
}

/// A parsed route pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    raw: String,
    segments: Vec<Segment>,
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

impl RoutePattern {
    /// # Errors
    ///
    /// `Config` if the pattern does not start with `/`, a capture name is
    /// not an identifier or repeats, or a catch-all is not last.
    pub fn parse(pattern: &str) -> Result<Self> {
        if !pattern.starts_with('/') {
            return Err(KestrunError::Config(format!("Route pattern '{}' must start with '/'", pattern)));
        }

        let parts: Vec<&str> = split_path(pattern).collect();
        let mut segments = Vec::with_capacity(parts.len());
        let mut names = BTreeSet::new();

        for (index, part) in parts.iter().enumerate() {
            let segment = match part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                Some(inner) => {
                    let (catch_all, name) = match inner.strip_prefix('*') {
                        Some(name) => (true, name),
                        None => (false, inner),
                    };
                    if !is_identifier(name) {
                        return Err(KestrunError::Config(format!(
                            "Invalid route parameter '{}' in '{}'",
                            name, pattern
                        )));
                    }
                    if !names.insert(name.to_ascii_lowercase()) {
                        return Err(KestrunError::Config(format!(
                            "Duplicate route parameter '{}' in '{}'",
                            name, pattern
                        )));
                    }
                    if catch_all && index + 1 != parts.len() {
                        return Err(KestrunError::Config(format!(
                            "Catch-all parameter must be the last segment in '{}'",
                            pattern
                        )));
                    }
                    if catch_all {
                        Segment::CatchAll(name.to_string())
                    } else {
                        Segment::Capture(name.to_string())
                    }
                }
                None if part.contains(['{', '}']) => {
                    return Err(KestrunError::Config(format!(
                        "Malformed segment '{}' in '{}'",
                        part, pattern
                    )));
                }
                None => Segment::Literal(part.to_string()),
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Matches `path`, returning the captured values.
    pub fn matches(&self, path: &str) -> Option<BTreeMap<String, String>> {
        let parts: Vec<&str> = split_path(path).collect();
        let mut values = BTreeMap::new();

        for (index, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Literal(literal) => {
                    if !parts.get(index)?.eq_ignore_ascii_case(literal) {
                        return None;
                    }
                }
                Segment::Capture(name) => {
                    values.insert(name.clone(), decode(parts.get(index)?));
                }
                Segment::CatchAll(name) => {
                    let rest = parts.get(index..).map(|rest| rest.join("/")).unwrap_or_default();
                    values.insert(name.clone(), decode(&rest));
                    return Some(values);
                }
            }
        }

        (parts.len() == self.segments.len()).then_some(values)
    }

    /// Two patterns collide when they have the same shape.
    fn same_shape(&self, other: &RoutePattern) -> bool {
        self.segments.len() == other.segments.len()
            && self.segments.iter().zip(&other.segments).all(|pair| match pair {
                (Segment::Literal(a), Segment::Literal(b)) => a.eq_ignore_ascii_case(b),
                (Segment::Capture(_), Segment::Capture(_)) | (Segment::CatchAll(_), Segment::CatchAll(_)) => true,
                _ => false,
            })
    }
}

fn decode(segment: &str) -> String {
    urlencoding::decode(segment).map_or_else(|_| segment.to_string(), |s| s.into_owned())
}

/// A registered route.
pub struct Route {
    pattern: RoutePattern,
    methods: BTreeSet<String>,
    delegate: Arc<dyn Delegate>,
    policy: Option<String>,
}

impl Route {
    /// `methods` empty means any verb.
    pub fn new<I, S>(pattern: RoutePattern, methods: I, delegate: Arc<dyn Delegate>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            pattern,
            methods: methods.into_iter().map(|m| m.as_ref().to_ascii_uppercase()).collect(),
            delegate,
            policy: None,
        }
    }

    pub fn with_policy(mut self, policy: impl Into<String>) -> Self {
        self.policy = Some(policy.into());
        self
    }

    pub fn pattern(&self) -> &RoutePattern {
        &self.pattern
    }

    pub fn methods(&self) -> &BTreeSet<String> {
        &self.methods
    }

    pub fn delegate(&self) -> &Arc<dyn Delegate> {
        &self.delegate
    }

    pub fn language(&self) -> ScriptLanguage {
        self.delegate.language()
    }

    pub fn policy(&self) -> Option<&str> {
        self.policy.as_deref()
    }

    fn allows(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.contains(method)
    }

    fn overlaps(&self, other: &Route) -> bool {
        self.pattern.same_shape(&other.pattern)
            && (self.methods.is_empty()
                || other.methods.is_empty()
                || !self.methods.is_disjoint(&other.methods))
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("pattern", &self.pattern.raw)
            .field("methods", &self.methods)
            .field("language", &self.language())
            .field("policy", &self.policy)
            .finish()
    }
}

/// Result of a route lookup.
#[derive(Debug)]
pub enum RouteMatch<'a> {
    Found {
        route: &'a Route,
        values: BTreeMap<String, String>,
    },
    MethodNotAllowed {
        allowed: BTreeSet<String>,
    },
    NotFound,
}

/// Routes in registration order. The first match wins.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    ///
    /// `Config` if a route with the same shape already handles one of the
    /// verbs.
    pub fn add(&mut self, route: Route) -> Result<()> {
        if let Some(existing) = self.routes.iter().find(|r| r.overlaps(&route)) {
            return Err(KestrunError::Config(format!(
                "Route '{}' conflicts with existing route '{}'",
                route.pattern.raw, existing.pattern.raw
            )));
        }
        tracing::debug!(pattern = %route.pattern.raw, methods = ?route.methods, language = %route.language(), "Route registered");
        self.routes.push(route);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }

    pub fn find(&self, method: &str, path: &str) -> RouteMatch<'_> {
        let method = method.to_ascii_uppercase();
        let mut allowed = BTreeSet::new();

        for route in &self.routes {
            let Some(values) = route.pattern.matches(path) else {
                continue;
            };
            if route.allows(&method) {
                return RouteMatch::Found { route, values };
            }
            allowed.extend(route.methods.iter().cloned());
        }

        if allowed.is_empty() {
            RouteMatch::NotFound
        } else {
            RouteMatch::MethodNotAllowed { allowed }
        }
    }
}
