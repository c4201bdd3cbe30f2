use nerpipe_core::{Error, Result};
use nerpipe_local::{Blocklist, DictionaryOptions};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheType {
    Local,
    Redis,
    Elasticsearch,
}

impl FromStr for CacheType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(Self::Local),
            "redis" => Ok(Self::Redis),
            "elasticsearch" => Ok(Self::Elasticsearch),
            other => Err(Error::Config(format!("unknown cache_type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// HTTP listen address.
    pub bind: String,
    pub pipeline_size: usize,
    pub compound_token_length: usize,
    /// One of `local`, `redis`, `elasticsearch`.
    pub cache_type: String,
    /// Entries in the per-recogniser front cache for remote backends (0 disables it).
    pub local_cache_size: usize,
    pub redis: RedisConfig,
    pub elasticsearch: ElasticConfig,
    #[serde(rename = "dictionary")]
    pub dictionaries: Vec<DictionaryConfig>,
    #[serde(rename = "regex")]
    pub patterns: Vec<PatternConfig>,
    pub leadmine: Vec<LeadmineConfig>,
    pub blocklist: BlocklistConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            pipeline_size: 10_000,
            compound_token_length: 5,
            cache_type: "local".to_string(),
            local_cache_size: 100_000,
            redis: RedisConfig::default(),
            elasticsearch: ElasticConfig::default(),
            dictionaries: Vec::new(),
            patterns: Vec::new(),
            leadmine: Vec::new(),
            blocklist: BlocklistConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ElasticConfig {
    pub url: String,
    pub index: String,
}

impl Default for ElasticConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:9200".to_string(),
            index: "nerpipe".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DictionaryConfig {
    pub name: String,
    /// Loaded at startup when `cache_type = "local"`; imported separately otherwise.
    #[serde(default)]
    pub files: Vec<PathBuf>,
    /// `leadmine` or `pubchem`.
    #[serde(default = "default_dictionary_format")]
    pub format: String,
}

fn default_dictionary_format() -> String {
    "leadmine".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PatternConfig {
    pub name: String,
    /// Pattern name to regex source.
    #[serde(default)]
    pub patterns: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LeadmineConfig {
    pub name: String,
    pub url: String,
    /// Overrides the port in `url`.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl LeadmineConfig {
    pub fn endpoint(&self) -> Result<String> {
        let mut url = url::Url::parse(&self.url)
            .map_err(|e| Error::Config(format!("leadmine {}: {e}", self.name)))?;
        if let Some(port) = self.port {
            url.set_port(Some(port))
                .map_err(|_| Error::Config(format!("leadmine {}: url cannot carry a port", self.name)))?;
        }
        Ok(url.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct BlocklistConfig {
    pub case_sensitive: Vec<String>,
    pub case_insensitive: Vec<String>,
}

impl BlocklistConfig {
    pub fn to_blocklist(&self) -> Blocklist {
        Blocklist::new(
            self.case_sensitive.iter().cloned(),
            self.case_insensitive.iter().cloned(),
        )
    }
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    /// The file at `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => Ok(Self::default()),
        }
    }

    pub fn dictionary_options(&self) -> DictionaryOptions {
        DictionaryOptions {
            compound_token_length: self.compound_token_length,
            pipeline_size: self.pipeline_size,
            local_cache_size: self.local_cache_size,
        }
    }

    pub fn cache_type(&self) -> Result<CacheType> {
        self.cache_type.parse()
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.bind
            .parse()
            .map_err(|e| Error::Config(format!("bind {:?}: {e}", self.bind)))
    }

    pub fn validate(&self) -> Result<()> {
        self.socket_addr()?;
        self.cache_type()?;
        if self.pipeline_size == 0 {
            return Err(Error::Config("pipeline_size must be positive".to_string()));
        }
        if self.compound_token_length == 0 {
            return Err(Error::Config(
                "compound_token_length must be positive".to_string(),
            ));
        }

        let mut names = BTreeSet::new();
        let all = self
            .dictionaries
            .iter()
            .map(|d| d.name.as_str())
            .chain(self.patterns.iter().map(|p| p.name.as_str()))
            .chain(self.leadmine.iter().map(|l| l.name.as_str()));
        for name in all {
            if name.trim().is_empty() {
                return Err(Error::Config("recogniser name is empty".to_string()));
            }
            if !names.insert(name) {
                return Err(Error::Config(format!("duplicate recogniser name: {name}")));
            }
        }
        for dictionary in &self.dictionaries {
            dictionary.format.parse::<nerpipe_local::dictfile::DictFormat>()?;
        }
        for leadmine in &self.leadmine {
            leadmine.endpoint()?;
            if leadmine.timeout_ms == 0 {
                return Err(Error::Config(format!(
                    "leadmine {}: timeout_ms must be positive",
                    leadmine.name
                )));
            }
        }
        Ok(())
    }
}
