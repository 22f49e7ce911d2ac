use serde::Deserialize;

/// Root application configuration. Loaded from an optional
/// `funnel-insights.toml` and environment variables with the prefix
/// `FUNNEL_INSIGHTS__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    /// Sessions matched per blocking worker.
    #[serde(default = "default_shard_size")]
    pub shard_size: usize,
    /// Upper bound on a single analysis request.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_top_drop_off_points")]
    pub top_drop_off_points: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

// Default functions
fn default_shard_size() -> usize {
    1024
}
fn default_timeout_ms() -> u64 {
    30_000
}
fn default_top_drop_off_points() -> usize {
    3
}
fn default_cache_enabled() -> bool {
    true
}
fn default_ttl_secs() -> u64 {
    300
}
fn default_max_entries() -> usize {
    10_000
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            shard_size: default_shard_size(),
            timeout_ms: default_timeout_ms(),
            top_drop_off_points: default_top_drop_off_points(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            ttl_secs: default_ttl_secs(),
            max_entries: default_max_entries(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            analysis: AnalysisConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default file (if present) and environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from("funnel-insights")
    }

    /// Load configuration from `path` (any extension the `config` crate
    /// understands, optional) layered under environment variables.
    pub fn load_from(path: &str) -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("FUNNEL_INSIGHTS")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.analysis.shard_size, 1024);
        assert_eq!(config.analysis.top_drop_off_points, 3);
        assert!(config.cache.enabled);
        assert_eq!(config.cache.ttl_secs, 300);
    }

    #[test]
    fn test_partial_section_keeps_field_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"analysis": {"shard_size": 16}}"#).unwrap();
        assert_eq!(config.analysis.shard_size, 16);
        assert_eq!(config.analysis.timeout_ms, 30_000);
        assert_eq!(config.cache.max_entries, 10_000);
    }
}
