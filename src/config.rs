//! Persistent configuration model, defaults, and environment credentials.

use std::path::{Path, PathBuf};

use log::info;

use crate::error::ResolveError;

pub const ACOUSTID_API_KEY_ENV: &str = "ACOUSTID_API_KEY";
pub const MUSICBRAINZ_USER_AGENT_ENV: &str = "MUSICBRAINZ_USER_AGENT";

const DEFAULT_APP_NAME: &str = "SongSearchOrganizer";
const DEFAULT_APP_VERSION: &str = "0.3";
const DEFAULT_CONTACT: &str = "you@example.com";

/// Root configuration persisted to `songsearch.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    #[serde(default)]
    /// Library database location.
    pub database: DatabaseConfig,
    #[serde(default)]
    /// Fingerprint enrichment preferences.
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    /// Duplicate scan preferences.
    pub duplicates: DuplicatesConfig,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct DatabaseConfig {
    /// Overrides the platform data directory location when set.
    #[serde(default)]
    pub path: Option<String>,
}

/// Enrichment knobs; service credentials live in the environment instead.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct EnrichmentConfig {
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_enrich_limit")]
    pub limit: usize,
    #[serde(default)]
    pub write_tags: bool,
    #[serde(default = "default_service_interval_ms")]
    pub acoustid_interval_ms: u64,
    #[serde(default = "default_service_interval_ms")]
    pub musicbrainz_interval_ms: u64,
    #[serde(default = "default_fpcalc_path")]
    pub fpcalc_path: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct DuplicatesConfig {
    /// Destination for relocated duplicates; previews only when unset.
    #[serde(default)]
    pub move_to: Option<String>,
    #[serde(default = "default_preview_limit")]
    pub preview_limit: usize,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            limit: default_enrich_limit(),
            write_tags: false,
            acoustid_interval_ms: default_service_interval_ms(),
            musicbrainz_interval_ms: default_service_interval_ms(),
            fpcalc_path: default_fpcalc_path(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for DuplicatesConfig {
    fn default() -> Self {
        Self {
            move_to: None,
            preview_limit: default_preview_limit(),
        }
    }
}

fn default_min_confidence() -> f64 {
    0.6
}

fn default_enrich_limit() -> usize {
    100
}

fn default_service_interval_ms() -> u64 {
    1_100
}

fn default_fpcalc_path() -> String {
    "fpcalc".to_string()
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_preview_limit() -> usize {
    50
}

/// Default config file location under the platform config directory.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("songsearch.toml"))
}

/// Clamps loaded values into ranges the pipelines accept.
pub fn sanitize_config(mut config: Config) -> Config {
    let confidence = config.enrichment.min_confidence;
    config.enrichment.min_confidence = if confidence.is_finite() {
        confidence.clamp(0.0, 1.0)
    } else {
        default_min_confidence()
    };
    config.enrichment.limit = config.enrichment.limit.max(1);
    config.enrichment.request_timeout_secs = config.enrichment.request_timeout_secs.max(1);
    if config.enrichment.fpcalc_path.trim().is_empty() {
        config.enrichment.fpcalc_path = default_fpcalc_path();
    }
    config.duplicates.preview_limit = config.duplicates.preview_limit.max(1);
    config
}

/// Reads the config file, writing defaults first when it does not exist yet.
pub fn load_or_create_config(path: &Path) -> Result<Config, Box<dyn std::error::Error>> {
    if !path.exists() {
        info!(
            "Config file not found. Creating default config. path={}",
            path.display()
        );
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string(&Config::default())?)?;
    }
    let content = std::fs::read_to_string(path)?;
    Ok(sanitize_config(toml::from_str::<Config>(&content)?))
}

/// Client identity sent to the metadata service as its user agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub app: String,
    pub version: String,
    pub contact: String,
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self {
            app: DEFAULT_APP_NAME.to_string(),
            version: DEFAULT_APP_VERSION.to_string(),
            contact: DEFAULT_CONTACT.to_string(),
        }
    }
}

impl ClientIdentity {
    /// Parses `"AppName/Version (contact)"`, falling back to defaults piecewise.
    ///
    /// `"App/1.0"` keeps the default contact; anything that cannot be split
    /// into app and version yields the default identity.
    pub fn parse(value: &str) -> Self {
        let defaults = Self::default();
        let value = value.trim();
        if value.contains('(') && value.contains(')') && value.contains('/') {
            let Some((app_version, contact_part)) = value.split_once('(') else {
                return defaults;
            };
            let Some((app, version)) = app_version.trim().split_once('/') else {
                return defaults;
            };
            return Self {
                app: app.trim().to_string(),
                version: version.trim().to_string(),
                contact: contact_part.trim_end_matches(')').trim().to_string(),
            };
        }
        if let Some((app, version)) = value.split_once('/') {
            return Self {
                app: app.trim().to_string(),
                version: version.trim().to_string(),
                ..defaults
            };
        }
        defaults
    }

    pub fn user_agent(&self) -> String {
        format!("{}/{} ( {} )", self.app, self.version, self.contact)
    }
}

/// Service credentials resolved for one enrichment invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichmentCredentials {
    pub acoustid_api_key: String,
    pub identity: ClientIdentity,
}

impl EnrichmentCredentials {
    pub fn from_env() -> Result<Self, ResolveError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Resolves credentials through `lookup`, failing fast on a missing API key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ResolveError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let acoustid_api_key = lookup(ACOUSTID_API_KEY_ENV)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ResolveError::Config(ACOUSTID_API_KEY_ENV.to_string()))?;
        let identity = lookup(MUSICBRAINZ_USER_AGENT_ENV)
            .map(|value| ClientIdentity::parse(&value))
            .unwrap_or_default();
        Ok(Self {
            acoustid_api_key,
            identity,
        })
    }
}
