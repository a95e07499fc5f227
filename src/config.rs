use config::{Config as ConfigTree, ConfigError, Environment, File};
use nostr::RelayUrl;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

const ENVIRONMENT_PREFIX: &str = "NOSTRZH";
const CONFIG_SEPARATOR: &str = "__";

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default)]
    pub client: ClientSettings,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub community: CommunitySettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClientSettings {
    /// Well-connected relays used for profile and relay-list lookups
    #[serde(default = "default_big_relays")]
    pub big_relays: Vec<String>,
    /// Relays the community reads and writes by default
    #[serde(default = "default_relays")]
    pub default_relays: Vec<String>,
    #[serde(with = "humantime_serde", default = "default_connection_timeout")]
    pub connection_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_publish_timeout")]
    pub publish_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_eose_timeout")]
    pub eose_timeout: Duration,
    #[serde(default = "default_profile_relay_limit")]
    pub profile_relay_limit: usize,
    #[serde(default)]
    pub loader: LoaderSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoaderSettings {
    #[serde(with = "humantime_serde", default = "default_batch_window")]
    pub batch_window: Duration,
    #[serde(
        default = "default_max_batch_size",
        deserialize_with = "validate_batch_size"
    )]
    pub max_batch_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    #[serde(default = "default_local_addr")]
    pub local_addr: String,
    #[serde(default = "default_nip05_upstream")]
    pub nip05_upstream: String,
    #[serde(with = "humantime_serde", default = "default_cache_max_age")]
    pub cache_max_age: Duration,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CommunitySettings {
    #[serde(default = "default_backend_url")]
    pub backend_url: String,
    #[serde(default = "default_comment_base_url")]
    pub comment_base_url: String,
    #[serde(default = "default_home_relay")]
    pub home_relay: String,
    /// Proof-of-work bits on the auth event of a join request
    #[serde(default = "default_join_pow_difficulty")]
    pub join_pow_difficulty: u8,
}

fn default_big_relays() -> Vec<String> {
    vec![
        "wss://relay.damus.io/".to_string(),
        "wss://nos.lol/".to_string(),
        "wss://relay.nostr.band/".to_string(),
        "wss://relay.primal.net/".to_string(),
    ]
}

fn default_relays() -> Vec<String> {
    vec![
        "wss://relay.nostrzh.org/".to_string(),
        "wss://relay.damus.io/".to_string(),
        "wss://nos.lol/".to_string(),
    ]
}

fn default_connection_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_publish_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_eose_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_profile_relay_limit() -> usize {
    5
}

fn default_batch_window() -> Duration {
    Duration::from_millis(50)
}

fn default_max_batch_size() -> usize {
    500
}

fn default_local_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_nip05_upstream() -> String {
    "https://api.nostrzh.org/.well-known/nostr.json".to_string()
}

fn default_cache_max_age() -> Duration {
    Duration::from_secs(300)
}

fn default_backend_url() -> String {
    "https://api.nostrzh.org".to_string()
}

fn default_comment_base_url() -> String {
    "https://nostrzh.org/blog/".to_string()
}

fn default_home_relay() -> String {
    "wss://relay.nostrzh.org/".to_string()
}

fn default_join_pow_difficulty() -> u8 {
    20
}

fn validate_batch_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    let size = usize::deserialize(deserializer)?;
    if size == 0 {
        return Err(D::Error::custom("max_batch_size must be greater than 0"));
    }
    Ok(size)
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            big_relays: default_big_relays(),
            default_relays: default_relays(),
            connection_timeout: default_connection_timeout(),
            publish_timeout: default_publish_timeout(),
            eose_timeout: default_eose_timeout(),
            profile_relay_limit: default_profile_relay_limit(),
            loader: LoaderSettings::default(),
        }
    }
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            batch_window: default_batch_window(),
            max_batch_size: default_max_batch_size(),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            local_addr: default_local_addr(),
            nip05_upstream: default_nip05_upstream(),
            cache_max_age: default_cache_max_age(),
        }
    }
}

impl Default for CommunitySettings {
    fn default() -> Self {
        Self {
            backend_url: default_backend_url(),
            comment_base_url: default_comment_base_url(),
            home_relay: default_home_relay(),
            join_pow_difficulty: default_join_pow_difficulty(),
        }
    }
}

/// Parses relay URLs, skipping (and logging) entries that are not valid.
pub fn parse_relay_urls<S: AsRef<str>>(urls: &[S]) -> Vec<RelayUrl> {
    urls.iter()
        .filter_map(|url| match RelayUrl::parse(url.as_ref()) {
            Ok(url) => Some(url),
            Err(e) => {
                tracing::warn!("Ignoring invalid relay url {}: {}", url.as_ref(), e);
                None
            }
        })
        .collect()
}

impl ClientSettings {
    pub fn big_relay_urls(&self) -> Vec<RelayUrl> {
        parse_relay_urls(&self.big_relays)
    }

    pub fn default_relay_urls(&self) -> Vec<RelayUrl> {
        parse_relay_urls(&self.default_relays)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    config: ConfigTree,
}

impl Config {
    pub fn new<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let environment =
            std::env::var(format!("{ENVIRONMENT_PREFIX}{CONFIG_SEPARATOR}ENVIRONMENT"))
                .unwrap_or_else(|_| "development".into());

        let config_dir = config_dir.as_ref();
        let default_config = config_dir.join("settings.yml");
        let env_config = config_dir.join(format!("settings.{}.yml", environment));
        let local_config = config_dir.join("settings.local.yml");

        let config = ConfigTree::builder()
            .add_source(File::from(default_config).required(false))
            .add_source(File::from(env_config).required(false))
            .add_source(File::from(local_config).required(false))
            .add_source(
                Environment::with_prefix(ENVIRONMENT_PREFIX)
                    .separator(CONFIG_SEPARATOR)
                    .list_separator(",")
                    .with_list_parse_key("client.big_relays")
                    .with_list_parse_key("client.default_relays")
                    .try_parsing(true),
            )
            .build()?;

        Ok(Config { config })
    }

    pub fn get_settings(&self) -> Result<Settings, ConfigError> {
        let settings: Settings = self.config.clone().try_deserialize()?;
        tracing::debug!(
            "Client config: big_relays={}, default_relays={}, connection_timeout={:?}, batch_window={:?}",
            settings.client.big_relays.len(),
            settings.client.default_relays.len(),
            settings.client.connection_timeout,
            settings.client.loader.batch_window,
        );
        Ok(settings)
    }
}
