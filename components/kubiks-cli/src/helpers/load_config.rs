// Local crates
use crate::helpers::errors::KubiksError;

// External crates
use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::instrument;

/// Collector the exporter talks to when no endpoint is configured
pub const DEFAULT_ENDPOINT: &str = "https://otel-grpc.kubiks.ai:443";
/// Service name reported when neither the flag nor the config file set one
pub const DEFAULT_SERVICE_NAME: &str = "kubiks-subprocess";
/// Prefix for environment overrides, e.g. `KUBIKS_AUTH_TOKEN`, `KUBIKS_EXPORTER__ENDPOINT`
pub const ENV_PREFIX: &str = "KUBIKS";

/// Persisted user configuration
#[derive(Debug, Default, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Sent as the `x-kubiks-key` header
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Overridden by `--service-name`
    #[serde(default)]
    pub service_name: Option<String>,
    /// `[exporter]` table
    #[serde(default)]
    pub exporter: ExporterConfig,
}

/// Transport and batching knobs for the telemetry emitter
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ExporterConfig {
    /// Collector URL; `https` enables TLS
    pub endpoint: String,
    /// Connect timeout, milliseconds
    pub connection_timeout_ms: u64,
    /// Per export call timeout, milliseconds
    pub export_timeout_ms: u64,
    /// Output records that may wait for export
    pub max_queue_size: usize,
    /// Records per export call
    pub max_export_batch_size: usize,
    /// Flush interval for partial batches, milliseconds
    pub scheduled_delay_ms: u64,
    /// Flush deadline at the end of an invocation, milliseconds
    pub shutdown_timeout_ms: u64,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            connection_timeout_ms: 10_000,
            export_timeout_ms: 30_000,
            max_queue_size: 2048,
            // One record per export: output shows up in the collector as it is produced.
            max_export_batch_size: 1,
            scheduled_delay_ms: 1_000,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl ExporterConfig {
    /// [`ExporterConfig::connection_timeout_ms`] as a `Duration`
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// [`ExporterConfig::export_timeout_ms`] as a `Duration`
    pub fn export_timeout(&self) -> Duration {
        Duration::from_millis(self.export_timeout_ms)
    }

    /// [`ExporterConfig::scheduled_delay_ms`] as a `Duration`
    pub fn scheduled_delay(&self) -> Duration {
        Duration::from_millis(self.scheduled_delay_ms)
    }

    /// [`ExporterConfig::shutdown_timeout_ms`] as a `Duration`
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Reject settings the batch processor cannot run with
    pub fn validate(&self) -> Result<(), KubiksError> {
        if self.endpoint.trim().is_empty() {
            return Err(KubiksError::configuration("exporter.endpoint must not be empty"));
        }
        if self.max_export_batch_size == 0 {
            return Err(KubiksError::configuration(
                "exporter.max_export_batch_size must be at least 1",
            ));
        }
        if self.max_queue_size < self.max_export_batch_size {
            return Err(KubiksError::configuration(
                "exporter.max_queue_size must be at least exporter.max_export_batch_size",
            ));
        }
        if self.scheduled_delay_ms == 0 {
            return Err(KubiksError::configuration(
                "exporter.scheduled_delay_ms must be greater than 0",
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Default location of the config file, `$HOME/.config/kubiks/config.toml`
    pub fn default_path() -> Result<PathBuf, KubiksError> {
        dirs::home_dir()
            .map(|home| home.join(".config").join("kubiks").join("config.toml"))
            .ok_or_else(|| KubiksError::configuration("failed to determine home directory"))
    }

    /// Load the configuration file, layering `KUBIKS_*` environment variables on top.
    ///
    /// A missing file is not an error: the caller gets defaults and will fail later,
    /// at emitter construction, if no token was found anywhere.
    #[instrument(
        name = "kubiks_config::load",
        target = "helpers::load_config",
        level = "trace",
        skip_all
    )]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, KubiksError> {
        Self::load_with_env(path, Self::environment())
    }

    /// `KUBIKS_*` environment source, `__` separating nested keys
    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
    }

    fn load_with_env<P: AsRef<Path>>(path: P, env: Environment) -> Result<Self, KubiksError> {
        let path_ref = path.as_ref();

        tracing::trace!(
            configuration_file_path = %path_ref.display(),
            "Loading kubiks configuration file"
        );

        let settings = config::Config::builder()
            .add_source(File::from(path_ref).format(FileFormat::Toml).required(false))
            .add_source(env)
            .build()
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to read configuration sources");
                KubiksError::configuration_with(
                    format!("failed to read config file {}", path_ref.display()),
                    e,
                )
            })?;

        let cfg: Config = settings.try_deserialize().map_err(|e| {
            tracing::error!(error = %e, "Failed to deserialize configuration");
            KubiksError::configuration_with(
                format!("invalid configuration in {}", path_ref.display()),
                e,
            )
        })?;

        tracing::trace!(
            configuration_file_path = %path_ref.display(),
            token_present = cfg.auth_token.is_some(),
            "kubiks configuration loaded successfully"
        );
        Ok(cfg)
    }

    /// Service name to report: explicit flag first, then the config file, then the default.
    pub fn resolve_service_name(&self, flag: Option<&str>) -> String {
        flag.or(self.service_name.as_deref())
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(DEFAULT_SERVICE_NAME)
            .to_string()
    }

    /// Token with everything but the last four characters hidden, for display
    pub fn masked_token(&self) -> Option<String> {
        self.auth_token.as_deref().map(|token| {
            let chars: Vec<char> = token.chars().collect();
            let visible = chars.len().saturating_sub(4);
            chars
                .iter()
                .enumerate()
                .map(|(i, c)| if i < visible { '*' } else { *c })
                .collect()
        })
    }
}

/// Store `token` as `auth_token` in the config file at `path`, creating the file and its
/// directory if needed. Other keys already in the file are kept as they are.
#[instrument(
    name = "kubiks_config::save_auth_token",
    target = "helpers::load_config",
    level = "trace",
    skip_all
)]
pub fn save_auth_token(path: &Path, token: &str) -> Result<(), KubiksError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(KubiksError::configuration("authentication token must not be empty"));
    }

    let mut table = if path.exists() {
        let existing = fs::read_to_string(path).map_err(|e| {
            KubiksError::configuration_with(format!("failed to read {}", path.display()), e)
        })?;
        existing.parse::<toml::Table>().map_err(|e| {
            KubiksError::configuration_with(format!("failed to parse {}", path.display()), e)
        })?
    } else {
        toml::Table::new()
    };

    table.insert("auth_token".into(), toml::Value::String(token.to_string()));

    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| {
            KubiksError::configuration_with(
                format!("failed to create config directory {}", dir.display()),
                e,
            )
        })?;
    }

    let rendered = toml::to_string_pretty(&table)
        .map_err(|e| KubiksError::configuration_with("failed to serialize configuration", e))?;
    fs::write(path, rendered).map_err(|e| {
        KubiksError::configuration_with(format!("failed to write config file {}", path.display()), e)
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| {
            KubiksError::configuration_with(
                format!("failed to restrict permissions on {}", path.display()),
                e,
            )
        })?;
    }

    tracing::debug!(configuration_file_path = %path.display(), "Authentication token saved");
    Ok(())
}
