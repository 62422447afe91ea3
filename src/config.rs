//! YAML configuration: `proxy`, `log`, `upstream` and `servers` sections.

use std::{
    collections::HashSet,
    fmt,
    fs,
    marker::PhantomData,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{
    de::{self, MapAccess, Visitor},
    Deserialize, Deserializer,
};
use tracing::debug;

use crate::{
    compression::CompressionConfig,
    http::DEFAULT_MAX_CONTENT_LENGTH,
    link::ConnectFailurePolicy,
    location::MatchMode,
    upstream::UpstreamServer,
    ProxyError, Result,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub log: LogConfig,
    /// Named pools in declaration order.
    #[serde(default, deserialize_with = "ordered_map")]
    pub upstream: Vec<(String, UpstreamConfig)>,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyConfig {
    pub bind: IpAddr,
    /// Runtime worker threads; the CPU count when unset.
    pub workers: Option<usize>,
    pub max_content_length: usize,
    pub connect_timeout_ms: Option<u64>,
    pub location_match: MatchMode,
    pub connect_failure: ConnectFailurePolicy,
    pub compression: CompressionConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            workers: None,
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
            connect_timeout_ms: None,
            location_match: MatchMode::default(),
            connect_failure: ConnectFailurePolicy::default(),
            compression: CompressionConfig::default(),
        }
    }
}

impl ProxyConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn listen_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.bind, port)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// An `EnvFilter` directive; `RUST_LOG` takes precedence.
    pub level: String,
    /// When set, logs also go to a daily-rolling file in this directory.
    pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(alias = "server")]
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub listen: u16,
    #[serde(default)]
    pub server_name: Option<String>,
    /// `prefix -> proxyPass` entries in declaration order.
    #[serde(default, deserialize_with = "ordered_map")]
    pub location: Vec<(String, LocationConfig)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationConfig {
    pub proxy_pass: String,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        debug!(path = %path.display(), "loaded configuration");
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(malformed("at least one server is required"));
        }
        if self.proxy.workers == Some(0) {
            return Err(malformed("proxy.workers must be positive"));
        }

        let mut ports = HashSet::new();
        for server in &self.servers {
            // Port 0 asks the OS for an ephemeral port, so repeats are fine.
            if server.listen != 0 && !ports.insert(server.listen) {
                return Err(malformed(format!("listen port {} is used twice", server.listen)));
            }
        }

        for (name, upstream) in &self.upstream {
            if upstream.members.is_empty() {
                return Err(malformed(format!("upstream `{name}` has no members")));
            }
            for member in &upstream.members {
                member.parse::<UpstreamServer>()?;
            }
        }
        Ok(())
    }
}

fn malformed(msg: impl Into<String>) -> ProxyError {
    ProxyError::ConfigurationMalformed(msg.into())
}

/// Deserializes a YAML mapping into its entries, keeping document order.
fn ordered_map<'de, D, T>(deserializer: D) -> std::result::Result<Vec<(String, T)>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    struct OrderedMap<T>(PhantomData<T>);

    impl<'de, T: Deserialize<'de>> Visitor<'de> for OrderedMap<T> {
        type Value = Vec<(String, T)>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a mapping")
        }

        fn visit_map<A>(self, mut map: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some(entry) = map.next_entry::<String, T>()? {
                entries.push(entry);
            }
            Ok(entries)
        }

        fn visit_unit<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
            Ok(Vec::new())
        }
    }

    deserializer.deserialize_map(OrderedMap(PhantomData))
}
