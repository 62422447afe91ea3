//! Per-server location table: maps a request path to the pool that serves it.

use std::borrow::Cow;

use serde::Deserialize;
use strum::Display;
use tracing::debug;

use crate::{
    config::LocationConfig,
    upstream::{PoolKey, RoutingContext, UpstreamServer},
    ProxyError, Result,
};

/// How request paths are compared against location prefixes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum MatchMode {
    /// Only the first path segment is compared, case-insensitively, and the
    /// first rule in ascending prefix length order wins. A rule such as
    /// `/api/v2` can never match in this mode.
    #[default]
    FirstSegment,
    /// Segment-anchored longest-prefix match: `/api/v2` matches `/api/v2` and
    /// `/api/v2/...` but not `/api/v20`; `/` matches everything.
    LongestPrefix,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationRule {
    prefix: String,
    pool_key: PoolKey,
}

impl LocationRule {
    pub fn new(prefix: impl Into<String>, pool_key: PoolKey) -> Self {
        Self {
            prefix: prefix.into(),
            pool_key,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn pool_key(&self) -> &PoolKey {
        &self.pool_key
    }

    fn matches_segment(&self, segment: &str) -> bool {
        self.prefix.eq_ignore_ascii_case(segment)
    }

    fn matches_prefix(&self, path: &str) -> bool {
        let prefix = self.prefix.trim_end_matches('/');
        if prefix.is_empty() {
            return true;
        }
        match path.get(..prefix.len()) {
            Some(head) if head.eq_ignore_ascii_case(prefix) => {
                matches!(path.as_bytes().get(prefix.len()), None | Some(b'/'))
            }
            _ => false,
        }
    }
}

/// Immutable, per-server list of location rules.
#[derive(Debug, Clone)]
pub struct LocationTable {
    rules: Vec<LocationRule>,
    mode: MatchMode,
}

impl LocationTable {
    /// Resolves every configured `prefix -> proxyPass` entry to a pool key.
    ///
    /// A proxyPass host naming an explicit upstream routes to that pool;
    /// anything else gets a single-member pool synthesized for `host:port`.
    /// Fails on an unparsable URL, or on a rule whose pool the registry does
    /// not know.
    pub fn build(
        locations: &[(String, LocationConfig)],
        routing: &RoutingContext,
        mode: MatchMode,
    ) -> Result<Self> {
        let mut rules = Vec::with_capacity(locations.len());
        for (prefix, location) in locations {
            let target = UpstreamServer::from_url(&location.proxy_pass)?;
            let pool_key = if routing.has_explicit_pool(target.address()) {
                PoolKey::from(target.address())
            } else {
                routing.resolve_or_synthesize(&target)
            };
            if !routing.contains(&pool_key) {
                return Err(ProxyError::UnknownPool(pool_key));
            }
            debug!(%prefix, pool = %pool_key, "location rule");
            rules.push(LocationRule::new(prefix.as_str(), pool_key));
        }
        Ok(Self::from_rules(rules, mode))
    }

    /// Sorts `rules` into matching priority. The sort is stable, so equal
    /// lengths keep their declaration order.
    pub fn from_rules(mut rules: Vec<LocationRule>, mode: MatchMode) -> Self {
        match mode {
            MatchMode::FirstSegment => rules.sort_by_key(|r| r.prefix.len()),
            MatchMode::LongestPrefix => rules.sort_by_key(|r| std::cmp::Reverse(r.prefix.len())),
        }
        Self { rules, mode }
    }

    pub fn find(&self, path: &str) -> Option<&LocationRule> {
        match self.mode {
            MatchMode::FirstSegment => {
                let segment = first_segment(path);
                self.rules.iter().find(|r| r.matches_segment(&segment))
            }
            MatchMode::LongestPrefix => self.rules.iter().find(|r| r.matches_prefix(path)),
        }
    }

    /// Like [`find`](Self::find), failing with `RouteNotFound` on a miss.
    pub fn resolve(&self, path: &str) -> Result<&LocationRule> {
        self.find(path)
            .ok_or_else(|| ProxyError::RouteNotFound(path.to_string()))
    }

    pub fn rules(&self) -> &[LocationRule] {
        &self.rules
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// `/` plus the text up to the next `/`: `/api/x/y` and `api/x` give `/api`,
/// while `/`, the empty path and `//x` all give `/`.
pub fn first_segment(path: &str) -> Cow<'_, str> {
    let rest = path.strip_prefix('/').unwrap_or(path);
    let end = rest.find('/').unwrap_or(rest.len());
    if end == 0 {
        Cow::Borrowed("/")
    } else if rest.len() < path.len() {
        Cow::Borrowed(&path[..=end])
    } else {
        Cow::Owned(format!("/{}", &rest[..end]))
    }
}
