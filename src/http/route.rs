//! Route matching against the request's "METHOD path" line.

use regex::{Captures, Regex};
use std::{collections::BTreeMap, fmt};

/// The canonical `"METHOD path"` string of a request, e.g. `"GET /login"`.
///
/// It compares against a literal route string or a [`Regex`]. Patterns must
/// match from the first byte, so `GET /products/(?P<id>\d+)` accepts
/// `GET /products/5` and `GET /products/5/edit` but not `PUT /x GET /products/5`.
///
/// ```
/// use paddock::route::LineOne;
/// use regex::Regex;
///
/// let line = LineOne::new("GET /products/42");
/// assert!(line == "GET /products/42");
///
/// let pattern = Regex::new(r"^GET /products/(?P<id>\d+)$").unwrap();
/// let found = line.matches(&pattern).unwrap();
/// assert_eq!(found.param("id"), Some("42"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LineOne(String);

impl LineOne {
    #[inline]
    pub fn new<S: Into<String>>(line: S) -> Self {
        LineOne(line.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Literal comparison.
    #[inline]
    pub fn is(&self, route: &str) -> bool {
        self.0 == route
    }

    /// Pattern comparison anchored at the start of the line.
    pub fn matches<'l>(&'l self, pattern: &Regex) -> Option<RouteMatch<'l>> {
        pattern
            .captures(&self.0)
            .filter(|caps| caps.get(0).map_or(false, |m| m.start() == 0))
            .map(|caps| RouteMatch {
                names: pattern.capture_names().flatten().map(str::to_owned).collect(),
                captures: caps,
            })
    }
}

impl fmt::Display for LineOne {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for LineOne {
    fn eq(&self, other: &str) -> bool {
        self.is(other)
    }
}

impl PartialEq<&str> for LineOne {
    fn eq(&self, other: &&str) -> bool {
        self.is(other)
    }
}

/// A successful pattern match.
#[derive(Debug)]
pub struct RouteMatch<'l> {
    captures: Captures<'l>,
    names: Vec<String>,
}

impl RouteMatch<'_> {
    /// A named capture group, if it took part in the match.
    #[inline]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.captures.name(name).map(|m| m.as_str())
    }

    /// Every named group that took part in the match.
    pub fn params(&self) -> BTreeMap<String, String> {
        self.names
            .iter()
            .filter_map(|name| {
                self.captures
                    .name(name)
                    .map(|m| (name.clone(), m.as_str().to_owned()))
            })
            .collect()
    }
}
