//! Upstream pool registry with round-robin backend selection.
//!
//! Pools are registered explicitly from the `upstream` section of the config,
//! or synthesized (one member each) the first time a `proxyPass` target that
//! is not a named upstream shows up while building a location table.

use std::{
    borrow::Borrow,
    fmt,
    hash::{Hash, Hasher},
    str::FromStr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use dashmap::{mapref::entry::Entry, DashMap};
use derive_more::{Display, From};
use tracing::{debug, info};
use url::Url;

use crate::{config::Config, ProxyError, Result};

const DEFAULT_PORT: u16 = 80;

/// Name under which a pool is registered: either an explicit upstream name or
/// a synthesized `address:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Display, From)]
pub struct PoolKey(String);

impl PoolKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PoolKey {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl Borrow<str> for PoolKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// One backend server. Two servers are the same backend when `address:port`
/// matches; the path prefix is carried along but does not take part in
/// equality.
#[derive(Debug, Clone)]
pub struct UpstreamServer {
    address: String,
    port: u16,
    path_prefix: String,
}

impl UpstreamServer {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            path_prefix: "/".to_string(),
        }
    }

    /// Builds a backend descriptor from a `proxyPass` URL such as
    /// `http://backend1:9000/v1`. A missing port means 80 regardless of scheme.
    pub fn from_url(raw: &str) -> Result<Self> {
        let url = Url::parse(raw)
            .map_err(|e| ProxyError::ConfigurationMalformed(format!("proxyPass `{raw}`: {e}")))?;
        let address = url.host_str().filter(|h| !h.is_empty()).ok_or_else(|| {
            ProxyError::ConfigurationMalformed(format!("proxyPass `{raw}` has no host"))
        })?;
        Ok(Self {
            address: address.to_string(),
            port: url.port().unwrap_or(DEFAULT_PORT),
            path_prefix: url.path().to_string(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path_prefix(&self) -> &str {
        &self.path_prefix
    }

    /// The `address:port` composite used as a synthesized pool key.
    pub fn key(&self) -> PoolKey {
        PoolKey(format!("{}:{}", self.address, self.port))
    }
}

impl PartialEq for UpstreamServer {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.port == other.port
    }
}

impl Eq for UpstreamServer {}

impl Hash for UpstreamServer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for UpstreamServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Parses a `host:port` member entry; the port defaults to 80.
impl FromStr for UpstreamServer {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (address, port) = match s.rsplit_once(':') {
            Some((address, port)) => {
                let port = port.parse::<u16>().map_err(|e| {
                    ProxyError::ConfigurationMalformed(format!("upstream member `{s}`: {e}"))
                })?;
                (address, port)
            }
            None => (s, DEFAULT_PORT),
        };
        if address.is_empty() {
            return Err(ProxyError::ConfigurationMalformed(format!(
                "upstream member `{s}` has no address"
            )));
        }
        Ok(Self::new(address, port))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolOrigin {
    Explicit,
    Synthesized,
}

/// A named, non-empty, immutable group of backends plus its rotation cursor.
#[derive(Debug)]
pub struct UpstreamPool {
    key: PoolKey,
    members: Vec<UpstreamServer>,
    cursor: AtomicUsize,
    origin: PoolOrigin,
}

impl UpstreamPool {
    fn new(key: PoolKey, members: Vec<UpstreamServer>, origin: PoolOrigin) -> Self {
        debug_assert!(!members.is_empty());
        Self {
            key,
            members,
            cursor: AtomicUsize::new(0),
            origin,
        }
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn members(&self) -> &[UpstreamServer] {
        &self.members
    }

    pub fn origin(&self) -> PoolOrigin {
        self.origin
    }

    /// Round-robin pick. A single relaxed `fetch_add`: concurrent callers may
    /// briefly see the same member, the long-run spread stays even.
    pub fn next(&self) -> &UpstreamServer {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.members.len();
        &self.members[index]
    }
}

/// Process-wide registry of upstream pools.
#[derive(Debug, Default)]
pub struct RoutingContext {
    pools: DashMap<PoolKey, Arc<UpstreamPool>>,
}

impl RoutingContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every `upstream` entry of the configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let ctx = Self::new();
        for (name, upstream) in &config.upstream {
            let members = upstream
                .members
                .iter()
                .map(|m| m.parse::<UpstreamServer>())
                .collect::<Result<Vec<_>>>()?;
            ctx.register_explicit_pool(name.as_str(), members)?;
        }
        Ok(ctx)
    }

    pub fn register_explicit_pool(
        &self,
        name: impl Into<PoolKey>,
        members: Vec<UpstreamServer>,
    ) -> Result<()> {
        let key = name.into();
        if members.is_empty() {
            return Err(ProxyError::ConfigurationMalformed(format!(
                "upstream `{key}` has no members"
            )));
        }
        match self.pools.entry(key.clone()) {
            Entry::Occupied(_) => Err(ProxyError::DuplicatePool(key)),
            Entry::Vacant(slot) => {
                info!(pool = %key, members = members.len(), "registered upstream pool");
                slot.insert(Arc::new(UpstreamPool::new(
                    key,
                    members,
                    PoolOrigin::Explicit,
                )));
                Ok(())
            }
        }
    }

    /// Returns the pool key serving `target`: the pool registered under the
    /// literal host if there is one, otherwise a single-member pool keyed by
    /// `address:port`, created on first use.
    pub fn resolve_or_synthesize(&self, target: &UpstreamServer) -> PoolKey {
        if let Some(pool) = self.pools.get(target.address()) {
            return pool.key().clone();
        }
        let key = target.key();
        self.pools
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(pool = %key, "synthesized single-member pool");
                Arc::new(UpstreamPool::new(
                    key.clone(),
                    vec![target.clone()],
                    PoolOrigin::Synthesized,
                ))
            })
            .key()
            .clone()
    }

    pub fn next(&self, key: &PoolKey) -> Result<UpstreamServer> {
        self.pools
            .get(key.as_str())
            .map(|pool| pool.next().clone())
            .ok_or_else(|| ProxyError::UnknownPool(key.clone()))
    }

    pub fn has_explicit_pool(&self, name: &str) -> bool {
        self.pools
            .get(name)
            .is_some_and(|pool| pool.origin() == PoolOrigin::Explicit)
    }

    pub fn contains(&self, key: &PoolKey) -> bool {
        self.pools.contains_key(key.as_str())
    }

    pub fn pool(&self, key: &PoolKey) -> Option<Arc<UpstreamPool>> {
        self.pools.get(key.as_str()).map(|pool| Arc::clone(&pool))
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}
