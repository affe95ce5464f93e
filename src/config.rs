use serde::Deserialize;
use std::collections::HashSet;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// `postgres://...` for a real deployment, `memory://` for a dry run.
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

impl DatabaseConfig {
    pub fn is_memory(&self) -> bool {
        self.url.starts_with("memory:")
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChainType {
    Evm,
    Utxo,
    Substrate,
}

impl ChainType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainType::Evm => "evm",
            ChainType::Utxo => "utxo",
            ChainType::Substrate => "substrate",
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    #[default]
    JsonRpc,
    Rest,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EndpointConfig {
    pub url: String,
    #[serde(default)]
    pub priority: u32,
    /// Requests per second; falls back to [`DEFAULT_RATE_LIMIT`].
    pub rate_limit: Option<u32>,
    #[serde(default)]
    pub kind: EndpointKind,
}

pub const DEFAULT_RATE_LIMIT: u32 = 15;

impl EndpointConfig {
    pub fn requests_per_second(&self) -> u32 {
        self.rate_limit.unwrap_or(DEFAULT_RATE_LIMIT).max(1)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChainConfig {
    pub name: String,
    pub chain_id: u64,
    pub chain_type: ChainType,
    pub endpoints: Vec<EndpointConfig>,
    /// Block to start from when no cursor exists yet. `None` starts at the tip.
    pub start_block: Option<u64>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_blocks_per_batch")]
    pub blocks_per_batch: u64,
    /// Overrides `scheduler.catchup_parallel_batches` for this chain.
    pub catchup_parallel_batches: Option<usize>,
    #[serde(default = "default_true")]
    pub traces: bool,
    /// `finalized` or `safe`; takes precedence over `confirmation_depth`.
    pub finality_tag: Option<String>,
    #[serde(default)]
    pub confirmation_depth: u64,
    #[serde(default = "default_true")]
    pub autostart: bool,
}

fn default_poll_interval_secs() -> u64 {
    6
}

fn default_blocks_per_batch() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

impl ChainConfig {
    pub fn endpoints_of(&self, kind: EndpointKind) -> Vec<EndpointConfig> {
        let mut endpoints: Vec<EndpointConfig> = self
            .endpoints
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect();
        endpoints.sort_by_key(|e| e.priority);
        endpoints
    }
}

// ============================================================
// Scheduler Config
// ============================================================

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_catchup_threshold")]
    pub catchup_threshold: u64,
    #[serde(default = "default_catchup_batch_size")]
    pub catchup_batch_size: u64,
    #[serde(default = "default_catchup_parallel_batches")]
    pub catchup_parallel_batches: usize,
    /// Live blocks processed before the loop checkpoints and restarts itself.
    #[serde(default = "default_live_checkpoint_blocks")]
    pub live_checkpoint_blocks: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_block_timeout_secs")]
    pub block_timeout_secs: u64,
    #[serde(default = "default_batch_timeout_secs")]
    pub batch_timeout_secs: u64,
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            catchup_threshold: default_catchup_threshold(),
            catchup_batch_size: default_catchup_batch_size(),
            catchup_parallel_batches: default_catchup_parallel_batches(),
            live_checkpoint_blocks: default_live_checkpoint_blocks(),
            retry: RetryConfig::default(),
            block_timeout_secs: default_block_timeout_secs(),
            batch_timeout_secs: default_batch_timeout_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
        }
    }
}

fn default_catchup_threshold() -> u64 {
    50
}

fn default_catchup_batch_size() -> u64 {
    50
}

fn default_catchup_parallel_batches() -> usize {
    4
}

fn default_live_checkpoint_blocks() -> u64 {
    1000
}

fn default_block_timeout_secs() -> u64 {
    120
}

fn default_batch_timeout_secs() -> u64 {
    1800
}

fn default_heartbeat_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

// ============================================================
// API Config
// ============================================================

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default = "default_api_host")]
    pub host: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 3000,
            host: "0.0.0.0".to_string(),
        }
    }
}

fn default_api_port() -> u16 {
    3000
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

// ============================================================
// Log Format
// ============================================================

/// Output format for the log subscriber, read from `RUST_LOG_FORMAT`
/// before the config file is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

impl LogFormat {
    pub const ENV: &'static str = "RUST_LOG_FORMAT";

    pub fn parse(value: Option<&str>) -> eyre::Result<Self> {
        match value.map(str::trim) {
            None | Some("") | Some("plain") => Ok(LogFormat::Plain),
            Some("json") => Ok(LogFormat::Json),
            Some(other) => Err(eyre::eyre!(
                "Invalid {} '{}'. Valid values: plain, json",
                Self::ENV,
                other
            )),
        }
    }

    pub fn from_env() -> eyre::Result<Self> {
        Self::parse(std::env::var(Self::ENV).ok().as_deref())
    }
}

impl Config {
    pub fn load(path: &str) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre::eyre!("Failed to read config file '{}': {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| eyre::eyre!("Failed to parse config file '{}': {}", path, e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> eyre::Result<()> {
        if self.chains.is_empty() {
            return Err(eyre::eyre!("At least one chain must be configured"));
        }
        if self.scheduler.catchup_batch_size == 0 || self.scheduler.catchup_parallel_batches == 0 {
            return Err(eyre::eyre!(
                "scheduler.catchup_batch_size and catchup_parallel_batches must be positive"
            ));
        }

        let mut seen_ids = HashSet::new();
        for chain in &self.chains {
            if !seen_ids.insert(chain.chain_id) {
                return Err(eyre::eyre!("Duplicate chain_id {}", chain.chain_id));
            }
            if chain.blocks_per_batch == 0 {
                return Err(eyre::eyre!(
                    "Chain '{}' must have blocks_per_batch > 0",
                    chain.name
                ));
            }
            let rest = chain.endpoints_of(EndpointKind::Rest);
            let json_rpc = chain.endpoints_of(EndpointKind::JsonRpc);
            let usable = match chain.chain_type {
                ChainType::Substrate => !rest.is_empty(),
                ChainType::Evm | ChainType::Utxo => !json_rpc.is_empty(),
            };
            if !usable {
                return Err(eyre::eyre!(
                    "Chain '{}' has no usable endpoints for chain type {}",
                    chain.name,
                    chain.chain_type.as_str()
                ));
            }
            for endpoint in &chain.endpoints {
                if !endpoint.url.starts_with("http://") && !endpoint.url.starts_with("https://") {
                    return Err(eyre::eyre!(
                        "Invalid endpoint url '{}' on chain '{}'",
                        endpoint.url,
                        chain.name
                    ));
                }
            }
            if let Some(tag) = &chain.finality_tag {
                if tag != "finalized" && tag != "safe" && tag != "latest" {
                    return Err(eyre::eyre!(
                        "Chain '{}' has unsupported finality_tag '{}'",
                        chain.name,
                        tag
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_chain(chain_type: ChainType, kind: EndpointKind) -> ChainConfig {
        ChainConfig {
            name: "test".to_string(),
            chain_id: 1,
            chain_type,
            endpoints: vec![EndpointConfig {
                url: "http://localhost:8545".to_string(),
                priority: 0,
                rate_limit: None,
                kind,
            }],
            start_block: None,
            poll_interval_secs: 6,
            blocks_per_batch: 10,
            catchup_parallel_batches: None,
            traces: true,
            finality_tag: None,
            confirmation_depth: 0,
            autostart: true,
        }
    }

    fn test_config(chains: Vec<ChainConfig>) -> Config {
        Config {
            database: DatabaseConfig {
                url: "postgres://localhost/test".to_string(),
                max_connections: 5,
            },
            chains,
            scheduler: SchedulerConfig::default(),
            api: ApiConfig::default(),
        }
    }

    #[test]
    fn test_parse_config() {
        let toml_str = r#"
[database]
url = "postgres://localhost/test"
max_connections = 5

[scheduler]
catchup_parallel_batches = 8

[[chains]]
name = "ethereum"
chain_id = 1
chain_type = "evm"
finality_tag = "finalized"

[[chains.endpoints]]
url = "http://localhost:8545"
priority = 1

[[chains.endpoints]]
url = "http://backup:8545"
priority = 0
rate_limit = 40

[[chains]]
name = "polkadot"
chain_id = 1000
chain_type = "substrate"

[[chains.endpoints]]
url = "http://sidecar:8080"
kind = "rest"
"#;

        let config: Config = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.chains.len(), 2);
        assert_eq!(config.chains[0].chain_type, ChainType::Evm);
        assert_eq!(config.chains[0].poll_interval_secs, 6); // default
        assert_eq!(config.chains[0].blocks_per_batch, 10); // default
        assert_eq!(config.scheduler.catchup_threshold, 50); // default
        assert_eq!(config.scheduler.catchup_parallel_batches, 8);

        let ordered = config.chains[0].endpoints_of(EndpointKind::JsonRpc);
        assert_eq!(ordered[0].url, "http://backup:8545");
        assert_eq!(ordered[0].requests_per_second(), 40);
        assert_eq!(ordered[1].requests_per_second(), DEFAULT_RATE_LIMIT);

        assert_eq!(config.chains[1].endpoints[0].kind, EndpointKind::Rest);
    }

    #[test]
    fn test_validate_empty_chains() {
        assert!(test_config(vec![]).validate().is_err());
    }

    #[test]
    fn test_validate_missing_endpoint_kind() {
        // A substrate chain needs a REST endpoint for block retrieval.
        let config = test_config(vec![test_chain(ChainType::Substrate, EndpointKind::JsonRpc)]);
        assert!(config.validate().is_err());

        let config = test_config(vec![test_chain(ChainType::Utxo, EndpointKind::JsonRpc)]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_duplicate_chain_id() {
        let config = test_config(vec![
            test_chain(ChainType::Evm, EndpointKind::JsonRpc),
            test_chain(ChainType::Evm, EndpointKind::JsonRpc),
        ]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bad_url() {
        let mut chain = test_chain(ChainType::Evm, EndpointKind::JsonRpc);
        chain.endpoints[0].url = "localhost:8545".to_string();
        assert!(test_config(vec![chain]).validate().is_err());
    }

    #[test]
    fn test_log_format_values() {
        assert_eq!(LogFormat::parse(None).unwrap(), LogFormat::Plain);
        assert_eq!(LogFormat::parse(Some("plain")).unwrap(), LogFormat::Plain);
        assert_eq!(LogFormat::parse(Some(" json ")).unwrap(), LogFormat::Json);
        assert!(LogFormat::parse(Some("pretty")).is_err());
    }
}
