//! Configuration parsing and structures

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::env;
use crate::keys::{self, KeySpace};
use crate::retry::RetryPolicy;

/// Scheme prefixes accepted in front of a bucket name
const BUCKET_SCHEMES: [&str; 2] = [GCS_SCHEME, "s3://"];

const GCS_SCHEME: &str = "gs://";

/// S3-compatible interoperability endpoint of Google Cloud Storage
pub const GCS_ENDPOINT: &str = "https://storage.googleapis.com";

/// Signing region accepted by the GCS interoperability endpoint
const GCS_REGION: &str = "auto";

/// Index URL used when none is configured
const DEFAULT_INDEX_URL: &str = "redis://127.0.0.1:6379/0";

// =============================================================================
// Raw Config (Deserialized from YAML)
// =============================================================================

/// Raw configuration as deserialized from YAML.
/// This is converted to `Config` via `resolve()`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    pub bucket: RawBucketConfig,

    #[serde(default)]
    pub index: IndexConfig,

    pub mount: MountConfig,

    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Bucket section as written; the name may carry a scheme prefix
#[derive(Debug, Clone, Deserialize)]
pub struct RawBucketConfig {
    /// Bucket name, optionally as `s3://name` or `gs://name`
    pub name: String,

    pub region: Option<String>,

    /// Custom endpoint URL (for S3-compatible stores).
    /// Defaults to the GCS endpoint for `gs://` names.
    pub endpoint: Option<String>,

    /// Force path-style addressing (for MinIO, LocalStack, etc.)
    #[serde(default)]
    pub force_path_style: bool,

    /// Credentials file in AWS profile format
    pub credentials_file: Option<PathBuf>,
}

// =============================================================================
// Resolved Config (Ready for use)
// =============================================================================

/// Top-level configuration (resolved from RawConfig)
#[derive(Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub bucket: BucketConfig,
    pub index: IndexConfig,
    pub mount: MountConfig,
    pub retry: RetryPolicy,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Bucket configuration (resolved)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketConfig {
    /// Bare bucket name
    pub name: String,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub force_path_style: bool,
    pub credentials_file: Option<PathBuf>,
}

/// Metadata index backend (tagged enum)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IndexConfig {
    /// Redis server shared by every mount of the bucket
    Redis {
        #[serde(default = "default_index_url")]
        url: String,
        /// Namespace prefix for every key
        #[serde(default)]
        base_key: String,
    },

    /// Process-local index, filled by indexing at startup
    Memory {
        #[serde(default)]
        base_key: String,
    },
}

fn default_index_url() -> String {
    DEFAULT_INDEX_URL.to_string()
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig::Redis {
            url: default_index_url(),
            base_key: String::new(),
        }
    }
}

impl IndexConfig {
    pub fn base_key(&self) -> &str {
        match self {
            IndexConfig::Redis { base_key, .. } | IndexConfig::Memory { base_key } => base_key,
        }
    }

    pub fn key_space(&self) -> KeySpace {
        KeySpace::new(self.base_key())
    }
}

/// Mount point configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MountConfig {
    /// Path where the filesystem will be mounted
    pub path: PathBuf,

    /// Index the whole bucket before serving
    #[serde(default)]
    pub init: bool,

    /// Block in the FUSE session loop instead of serving from a background thread
    #[serde(default = "default_foreground")]
    pub foreground: bool,

    /// Debug logging plus a trace of every kernel request
    #[serde(default)]
    pub debug: bool,

    /// Mount as read-only (disables all write operations)
    #[serde(default)]
    pub read_only: bool,

    /// User ID reported for every node (defaults to the process uid)
    pub uid: Option<u32>,

    /// Group ID reported for every node (defaults to the process gid)
    pub gid: Option<u32>,
}

fn default_foreground() -> bool {
    true
}

/// Command line flags layered over the file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Overrides {
    pub init: bool,
    pub debug: bool,
}

// =============================================================================
// Resolution Logic
// =============================================================================

/// Strip a `gs://` or `s3://` prefix and any trailing separator
pub fn bare_bucket_name(name: &str) -> &str {
    let name = name.trim();
    let name = BUCKET_SCHEMES
        .iter()
        .find_map(|scheme| name.strip_prefix(scheme))
        .unwrap_or(name);
    name.trim_end_matches('/')
}

impl RawConfig {
    /// Resolve raw config into final config
    pub fn resolve(self) -> Result<Config, ConfigError> {
        let RawConfig {
            logging,
            bucket,
            index,
            mount,
            retry,
        } = self;

        let gcs_default = bucket.name.trim().starts_with(GCS_SCHEME) && bucket.endpoint.is_none();
        let bucket = if gcs_default {
            BucketConfig {
                name: bare_bucket_name(&bucket.name).to_string(),
                region: bucket.region.or_else(|| Some(GCS_REGION.to_string())),
                endpoint: Some(GCS_ENDPOINT.to_string()),
                force_path_style: true,
                credentials_file: bucket.credentials_file,
            }
        } else {
            BucketConfig {
                name: bare_bucket_name(&bucket.name).to_string(),
                region: bucket.region,
                endpoint: bucket.endpoint,
                force_path_style: bucket.force_path_style,
                credentials_file: bucket.credentials_file,
            }
        };

        Ok(Config {
            logging,
            bucket,
            index,
            mount,
            retry,
        })
    }
}

impl Config {
    /// Load configuration from a YAML file, expanding `${VAR}` references
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(path.to_path_buf(), e.to_string()))?;

        let expanded = env::expand(&content)?;
        Self::from_str(&expanded)
    }

    /// Parse configuration from a YAML string
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        raw.resolve()
    }

    /// Apply command line flags; a set flag wins over the file
    pub fn apply(&mut self, overrides: Overrides) {
        self.mount.init |= overrides.init;
        self.mount.debug |= overrides.debug;
    }

    /// Effective log filter directive.
    ///
    /// Debug mode also enables the per-request trace of the FUSE adapter.
    pub fn log_level(&self) -> &str {
        if self.mount.debug {
            "debug,festivus::requests=trace"
        } else {
            &self.logging.level
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket.name.is_empty() {
            return Err(ConfigError::ValidationError(
                "bucket.name cannot be empty".to_string(),
            ));
        }

        if self.mount.path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "mount.path cannot be empty".to_string(),
            ));
        }

        if keys::contains_marker(self.index.base_key()) {
            return Err(ConfigError::ValidationError(format!(
                "index.base_key {:?} uses the reserved name {}",
                self.index.base_key(),
                keys::DIR_METADATA
            )));
        }

        if let IndexConfig::Redis { url, .. } = &self.index {
            if url.is_empty() {
                return Err(ConfigError::ValidationError(
                    "index.url cannot be empty".to_string(),
                ));
            }
        }

        let intervals = [
            ("initial_interval", self.retry.initial_interval),
            ("max_interval", self.retry.max_interval),
            ("max_elapsed", self.retry.max_elapsed),
        ];
        for (name, value) in intervals {
            if value == Duration::ZERO {
                return Err(ConfigError::ValidationError(format!(
                    "retry.{} must be greater than zero",
                    name
                )));
            }
        }
        if self.retry.initial_interval > self.retry.max_interval {
            return Err(ConfigError::ValidationError(
                "retry.initial_interval cannot exceed retry.max_interval".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    ReadError(PathBuf, String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FULL: &str = r#"
logging:
  level: warn

bucket:
  name: gs://photos
  region: us-east-1
  endpoint: "http://localhost:9000"
  force_path_style: true
  credentials_file: /etc/festivus/credentials

index:
  type: redis
  url: redis://cache:6379/2
  base_key: tenant-a

mount:
  path: /mnt/photos
  init: true
  foreground: false
  read_only: true
  uid: 1000
  gid: 100

retry:
  initial_interval: 50ms
  max_interval: 1s
  max_elapsed: 10s
"#;

    #[test]
    fn test_parse_full_config() {
        let config = Config::from_str(FULL).unwrap();
        assert_eq!(config.logging.level, "warn");

        assert_eq!(config.bucket.name, "photos");
        assert_eq!(config.bucket.region.as_deref(), Some("us-east-1"));
        assert_eq!(config.bucket.endpoint.as_deref(), Some("http://localhost:9000"));
        assert!(config.bucket.force_path_style);
        assert_eq!(
            config.bucket.credentials_file,
            Some(PathBuf::from("/etc/festivus/credentials"))
        );

        assert_eq!(
            config.index,
            IndexConfig::Redis {
                url: "redis://cache:6379/2".to_string(),
                base_key: "tenant-a".to_string(),
            }
        );
        assert_eq!(config.index.key_space().base(), "tenant-a");

        assert_eq!(config.mount.path, PathBuf::from("/mnt/photos"));
        assert!(config.mount.init);
        assert!(!config.mount.foreground);
        assert!(config.mount.read_only);
        assert_eq!(config.mount.uid, Some(1000));
        assert_eq!(config.mount.gid, Some(100));

        assert_eq!(config.retry.initial_interval, Duration::from_millis(50));
        assert_eq!(config.retry.max_elapsed, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let yaml = r#"
bucket:
  name: s3://data/
mount:
  path: /mnt/data
"#;
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.bucket.name, "data");
        assert!(!config.bucket.force_path_style);
        assert_eq!(config.index, IndexConfig::default());
        assert_eq!(config.index.base_key(), "");
        assert!(config.mount.foreground);
        assert!(!config.mount.init);
        assert!(!config.mount.read_only);
        assert_eq!(config.retry, RetryPolicy::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_memory_index() {
        let yaml = r#"
bucket: { name: b }
index: { type: memory, base_key: scratch }
mount: { path: /mnt/b }
"#;
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(
            config.index,
            IndexConfig::Memory {
                base_key: "scratch".to_string()
            }
        );
    }

    #[test]
    fn test_missing_bucket_is_parse_error() {
        let err = Config::from_str("mount: { path: /mnt/x }").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_validation_errors() {
        let base = Config::from_str("bucket: { name: b }\nmount: { path: /mnt/b }").unwrap();

        let mut empty_bucket = base.clone();
        empty_bucket.bucket.name = String::new();
        assert!(empty_bucket.validate().is_err());

        let mut empty_path = base.clone();
        empty_path.mount.path = PathBuf::new();
        assert!(empty_path.validate().is_err());

        let mut marker = base.clone();
        marker.index = IndexConfig::Memory {
            base_key: "x/__dir_metadata__".to_string(),
        };
        let err = marker.validate().unwrap_err();
        assert!(err.to_string().contains("__dir_metadata__"));

        let mut zero_retry = base.clone();
        zero_retry.retry.max_elapsed = Duration::ZERO;
        assert!(zero_retry.validate().is_err());

        let mut inverted = base;
        inverted.retry.initial_interval = Duration::from_secs(5);
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn test_overrides() {
        let mut config = Config::from_str("bucket: { name: b }\nmount: { path: /mnt/b }").unwrap();
        assert_eq!(config.log_level(), "info");

        config.apply(Overrides {
            init: true,
            debug: true,
        });
        assert!(config.mount.init);
        assert_eq!(config.log_level(), "debug,festivus::requests=trace");

        // Unset flags never clear file settings
        config.apply(Overrides::default());
        assert!(config.mount.init);
    }

    #[test]
    fn test_bare_bucket_name() {
        assert_eq!(bare_bucket_name("gs://photos"), "photos");
        assert_eq!(bare_bucket_name("s3://photos/"), "photos");
        assert_eq!(bare_bucket_name(" photos "), "photos");
    }

    #[test]
    fn test_gcs_bucket_uses_gcs_endpoint() {
        let yaml = "bucket: { name: gs://photos }\nmount: { path: /mnt/p }";
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.bucket.name, "photos");
        assert_eq!(config.bucket.endpoint.as_deref(), Some(GCS_ENDPOINT));
        assert_eq!(config.bucket.region.as_deref(), Some("auto"));
        assert!(config.bucket.force_path_style);

        let yaml = "bucket: { name: gs://photos, region: europe-west1 }\nmount: { path: /mnt/p }";
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.bucket.region.as_deref(), Some("europe-west1"));

        // Without a scheme or with s3:// the SDK's default endpoint applies
        for name in ["photos", "s3://photos"] {
            let yaml = format!("bucket: {{ name: \"{}\" }}\nmount: {{ path: /mnt/p }}", name);
            let config = Config::from_str(&yaml).unwrap();
            assert_eq!(config.bucket.endpoint, None, "endpoint for {}", name);
            assert!(!config.bucket.force_path_style);
        }
    }

    #[test]
    fn test_from_file_expands_environment() {
        std::env::set_var("FESTIVUS_CONFIG_TEST_BUCKET", "from-env");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "bucket:\n  name: ${{FESTIVUS_CONFIG_TEST_BUCKET}}\nmount:\n  path: ${{FESTIVUS_CONFIG_TEST_MOUNT:-/mnt/default}}"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.bucket.name, "from-env");
        assert_eq!(config.mount.path, PathBuf::from("/mnt/default"));
        std::env::remove_var("FESTIVUS_CONFIG_TEST_BUCKET");
    }

    #[test]
    fn test_from_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::from_file(&dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError(..)));
    }
}
