use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use http::Uri;
use serde::Deserialize;

use crate::engine::Mirror;
use crate::mirror_fetch::UpstreamSettings;
use crate::server::ServerSettings;

#[cfg(debug_assertions)]
static CONFIG_FILE: &str = "./etc/mirrorcache/mirrorcache.toml";

#[cfg(not(debug_assertions))]
static CONFIG_FILE: &str = "/etc/mirrorcache/mirrorcache.toml";

static CONFIG_FILE_ENV_VAR: &str = "MIRRORCACHE_CONFIG";
static ENV_PREFIX: &str = "MIRRORCACHE_";

static DEFAULT_LISTEN_IP_ADDRESS: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8996;
const DEFAULT_NUM_WORKERS: usize = 20;

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Toml(toml::de::Error),
    InvalidMirrorName(String),
    InvalidBaseUrl { mirror: String, url: String },
    InvalidListenAddress(String),
    Env { variable: String, message: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "unable to read {:?}: {}", path, e),
            ConfigError::Toml(e) => write!(f, "invalid TOML: {}", e),
            ConfigError::InvalidMirrorName(name) => {
                write!(f, "invalid mirror name {:?}: must be a single path segment", name)
            }
            ConfigError::InvalidBaseUrl { mirror, url } => {
                write!(f, "invalid base URL {:?} for mirror {:?}: must be an absolute http or https URL", url, mirror)
            }
            ConfigError::InvalidListenAddress(address) => write!(f, "invalid listen address: {:?}", address),
            ConfigError::Env { variable, message } => write!(f, "unable to parse {}: {}", variable, message),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<toml::de::Error> for ConfigError {
    fn from(error: toml::de::Error) -> Self {
        ConfigError::Toml(error)
    }
}

fn quote_str(s: String) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

trait TomlValue {
    // the default implementation is fine for most cases. However, since TOML requires Strings to be quoted,
    // we need to provide an implementation in case the type of the TOML value is a String.
    fn toml_value_from_str(s: String) -> String {
        s
    }
}

impl TomlValue for usize { }
impl TomlValue for u64 { }
impl TomlValue for u32 { }
impl TomlValue for u16 { }
impl TomlValue for BTreeMap<String, String> { }
impl TomlValue for String {
    fn toml_value_from_str(s: String) -> String {
        quote_str(s)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MirrorConfig {
    pub cache_directory: String,
    #[serde(default = "default_listen_ip_address")]
    pub listen_ip_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Milliseconds.
    pub connect_timeout: Option<u64>,
    pub low_speed_limit: Option<u32>,
    pub low_speed_time_secs: Option<u64>,
    pub max_speed_limit: Option<u64>,
    /// Mirror name to base URL.
    #[serde(default)]
    pub mirrors: BTreeMap<String, String>,
}

fn default_listen_ip_address() -> String {
    DEFAULT_LISTEN_IP_ADDRESS.to_owned()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_num_workers() -> usize {
    DEFAULT_NUM_WORKERS
}

impl MirrorConfig {
    pub fn from_toml_str(config_contents: &str) -> Result<Self, ConfigError> {
        let config: MirrorConfig = toml::from_str(config_contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, url) in &self.mirrors {
            if !is_valid_mirror_name(name) {
                return Err(ConfigError::InvalidMirrorName(name.clone()));
            }
            if !is_valid_base_url(url) {
                return Err(ConfigError::InvalidBaseUrl { mirror: name.clone(), url: url.clone() });
            }
        }
        Ok(())
    }

    pub fn mirrors(&self) -> Vec<Mirror> {
        self.mirrors.iter()
            .map(|(name, base_url)| Mirror { name: name.clone(), base_url: base_url.clone() })
            .collect()
    }

    pub fn upstream_settings(&self) -> UpstreamSettings {
        let defaults = UpstreamSettings::default();
        UpstreamSettings {
            connect_timeout: self.connect_timeout.map(Duration::from_millis).unwrap_or(defaults.connect_timeout),
            low_speed_limit: self.low_speed_limit,
            low_speed_time: self.low_speed_time_secs.map(Duration::from_secs).unwrap_or(defaults.low_speed_time),
            max_speed_limit: self.max_speed_limit,
        }
    }

    pub fn server_settings(&self) -> Result<ServerSettings, ConfigError> {
        let ip_address = self.listen_ip_address.parse::<IpAddr>()
            .map_err(|_| ConfigError::InvalidListenAddress(self.listen_ip_address.clone()))?;
        Ok(ServerSettings {
            listen_address: SocketAddr::new(ip_address, self.port),
            num_workers: self.num_workers,
            ..ServerSettings::default()
        })
    }
}

fn is_valid_mirror_name(name: &str) -> bool {
    !name.is_empty() &&
        name != "." &&
        name != ".." &&
        !name.chars().any(|c| matches!(c, '/' | '\\' | '?' | '#' | '%' | '\0') || c.is_whitespace())
}

fn is_valid_base_url(url: &str) -> bool {
    match url.parse::<Uri>() {
        Ok(uri) => {
            let scheme_ok = matches!(uri.scheme_str(), Some("http") | Some("https"));
            scheme_ok && uri.authority().is_some()
        }
        Err(_) => false,
    }
}

fn config_file_path() -> PathBuf {
    match std::env::var(CONFIG_FILE_ENV_VAR) {
        Ok(path) => PathBuf::from(path),
        Err(_) => PathBuf::from(CONFIG_FILE),
    }
}

fn load_toml_config() -> Result<MirrorConfig, ConfigError> {
    let path = config_file_path();
    info!("Reading configuration from {:?}", &path);
    let config_contents = fs::read_to_string(&path).map_err(|e| ConfigError::Io(path.clone(), e))?;
    MirrorConfig::from_toml_str(&config_contents)
}

#[derive(Deserialize)]
struct DValue <T> {
    value: T
}

fn parse_env_toml<T, F>(var: &F, name: &str) -> Result<Option<T>, ConfigError> where
          T: serde::de::DeserializeOwned + TomlValue + 'static,
          F: Fn(&str) -> Option<String>,
{
    let env_var = match var(name) {
        None => return Ok(None),
        Some(v) => v,
    };
    let toml_document = format!("value = {}", T::toml_value_from_str(env_var));
    // Our actual intent is to parse the environment variable as a TOML value, but the parser accepts only complete
    // TOML documents with key-value pairs. So we construct a TOML document with a single key-value pair, and
    // then extract the value.
    let deserialized = toml::from_str::<DValue<T>>(&toml_document).map_err(|e| ConfigError::Env {
        variable: name.to_owned(),
        message: e.to_string(),
    })?;
    Ok(Some(deserialized.value))
}

fn mirror_config_from_env<F>(var: F) -> Result<MirrorConfig, ConfigError> where F: Fn(&str) -> Option<String> {
    let cache_directory = parse_env_toml::<String, _>(&var, "MIRRORCACHE_CACHE_DIRECTORY")?
        .ok_or_else(|| ConfigError::Env {
            variable: "MIRRORCACHE_CACHE_DIRECTORY".to_owned(),
            message: "variable is required".to_owned(),
        })?;
    let listen_ip_address = parse_env_toml::<String, _>(&var, "MIRRORCACHE_LISTEN_IP_ADDRESS")?
        .unwrap_or_else(default_listen_ip_address);
    let port = parse_env_toml::<u16, _>(&var, "MIRRORCACHE_PORT")?.unwrap_or(DEFAULT_PORT);
    let num_workers = parse_env_toml::<usize, _>(&var, "MIRRORCACHE_NUM_WORKERS")?.unwrap_or(DEFAULT_NUM_WORKERS);
    let connect_timeout = parse_env_toml::<u64, _>(&var, "MIRRORCACHE_CONNECT_TIMEOUT")?;
    let low_speed_limit = parse_env_toml::<u32, _>(&var, "MIRRORCACHE_LOW_SPEED_LIMIT")?;
    let low_speed_time_secs = parse_env_toml::<u64, _>(&var, "MIRRORCACHE_LOW_SPEED_TIME_SECS")?;
    let max_speed_limit = parse_env_toml::<u64, _>(&var, "MIRRORCACHE_MAX_SPEED_LIMIT")?;
    let mirrors = parse_env_toml::<BTreeMap<String, String>, _>(&var, "MIRRORCACHE_MIRRORS")?
        .unwrap_or_default();
    let config = MirrorConfig {
        cache_directory,
        listen_ip_address,
        port,
        num_workers,
        connect_timeout,
        low_speed_limit,
        low_speed_time_secs,
        max_speed_limit,
        mirrors,
    };
    config.validate()?;
    Ok(config)
}

pub fn load_config() -> Result<MirrorConfig, ConfigError> {
    if std::env::vars().any(|(key, _value)| key.starts_with(ENV_PREFIX) && key != CONFIG_FILE_ENV_VAR) {
        info!("Environment variables with prefix {} found: Configuration is read from the environment", ENV_PREFIX);
        mirror_config_from_env(|name| std::env::var(name).ok())
    } else {
        load_toml_config()
    }
}
