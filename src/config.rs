use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::cache::CacheConfig;
use crate::media::{MediaConfig, NameCharset, ObjectParameters, DEFAULT_ACL, DEFAULT_BUFFER_SIZE};
use crate::storage::s3::S3Settings;
use crate::storage::StorageConfig;

/// S3 rejects multipart segments below this size (except the last one).
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Top-level application configuration loaded from file + environment.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageSection,
    pub cache: CacheSection,
    pub logging: LoggingSection,
}

impl AppConfig {
    /// Load configuration from disk and environment.
    ///
    /// Environment overrides use the `COURSEMEDIA` prefix with `__` between
    /// path segments, e.g. `COURSEMEDIA_STORAGE__S3__BUCKET`.
    pub fn load() -> Result<Self> {
        let config_path =
            env::var("COURSEMEDIA_CONFIG").unwrap_or_else(|_| "config.toml".to_string());

        let mut builder = config::Config::builder();

        if Path::new(&config_path).exists() {
            builder = builder.add_source(config::File::from(PathBuf::from(&config_path)));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("COURSEMEDIA")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder.build()?;
        let mut config: Self = settings.try_deserialize()?;

        if config.logging.level.trim().is_empty() {
            config.logging.level = "info".to_string();
        }

        Ok(config)
    }

    /// Resolve the gateway configuration and the backend it runs on.
    pub fn media_runtime(&self) -> Result<(MediaConfig, StorageConfig)> {
        let storage_config = self.storage.to_runtime()?;

        let file_name_charset: NameCharset = self
            .storage
            .file_name_charset
            .parse()
            .context("invalid storage.file_name_charset")?;

        if self.storage.file_buffer_size < MIN_PART_SIZE
            && matches!(self.storage.backend, StorageBackendKind::S3)
        {
            bail!(
                "storage.file_buffer_size must be at least {} bytes for the S3 backend",
                MIN_PART_SIZE
            );
        }
        if self.storage.file_buffer_size == 0 {
            bail!("storage.file_buffer_size must be greater than zero");
        }
        if self.cache.ttl_secs == Some(0) {
            bail!("cache.ttl_secs must be greater than zero when set");
        }

        let location = self.storage.location.trim_matches('/').to_string();

        let media_config = MediaConfig {
            location,
            file_overwrite: self.storage.file_overwrite,
            object_parameters: self.storage.object_parameters.clone(),
            file_name_charset,
            max_memory_size: self.storage.max_memory_size,
            custom_domain: non_empty(self.storage.custom_domain.as_deref()),
            default_acl: non_empty(self.storage.default_acl.as_deref()),
            expire: Duration::from_secs(self.storage.querystring_expire),
            file_buffer_size: self.storage.file_buffer_size,
            cache: CacheConfig {
                enabled: self.cache.preload_metadata,
                ttl: self.cache.ttl_secs.map(Duration::from_secs),
            },
        };

        Ok((media_config, storage_config))
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub backend: StorageBackendKind,
    pub local: Option<LocalStorageSection>,
    pub s3: Option<S3StorageSection>,
    pub location: String,
    pub file_overwrite: bool,
    pub default_acl: Option<String>,
    pub custom_domain: Option<String>,
    pub querystring_expire: u64,
    pub file_name_charset: String,
    pub max_memory_size: usize,
    pub file_buffer_size: usize,
    pub object_parameters: ObjectParameters,
}

impl StorageSection {
    pub fn to_runtime(&self) -> Result<StorageConfig> {
        match self.backend {
            StorageBackendKind::Local => {
                let local = self.local.clone().unwrap_or_default();
                if local.root_path.trim().is_empty() {
                    bail!("storage.local.root_path must be specified");
                }
                Ok(StorageConfig::Local {
                    root_path: local.root_path,
                })
            }
            StorageBackendKind::S3 => {
                let s3 = self
                    .s3
                    .clone()
                    .context("storage.s3 configuration required when backend is 's3'")?;

                if s3.bucket.trim().is_empty() {
                    bail!("storage.s3.bucket must be specified");
                }
                if s3.access_key.is_some() != s3.secret_key.is_some() {
                    bail!("storage.s3.access_key and storage.s3.secret_key must be set together");
                }

                Ok(StorageConfig::S3(S3Settings {
                    bucket: s3.bucket.trim().to_string(),
                    region: non_empty(s3.region.as_deref()),
                    endpoint: non_empty(s3.endpoint.as_deref()),
                    access_key: s3.access_key,
                    secret_key: s3.secret_key,
                    use_ssl: s3.use_ssl,
                }))
            }
        }
    }
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::Local,
            local: Some(LocalStorageSection::default()),
            s3: None,
            location: String::new(),
            file_overwrite: true,
            default_acl: Some(DEFAULT_ACL.to_string()),
            custom_domain: None,
            querystring_expire: 3600,
            file_name_charset: "utf-8".to_string(),
            max_memory_size: 0,
            file_buffer_size: DEFAULT_BUFFER_SIZE,
            object_parameters: ObjectParameters::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    #[default]
    Local,
    S3,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocalStorageSection {
    pub root_path: String,
}

impl Default for LocalStorageSection {
    fn default() -> Self {
        Self {
            root_path: "./data".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct S3StorageSection {
    pub bucket: String,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub use_ssl: bool,
}

impl Default for S3StorageSection {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: None,
            endpoint: None,
            access_key: None,
            secret_key: None,
            use_ssl: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    /// Preload the object listing and answer exists/size from it
    pub preload_metadata: bool,
    /// Reload the listing after this many seconds; never when unset
    pub ttl_secs: Option<u64>,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            preload_metadata: true,
            ttl_secs: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}
