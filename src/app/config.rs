//! Configuration loaded from `config.toml`.
//!
//! # Format
//!
//! ```toml
//! [login]
//! region = "us-east-1"
//! start_url = "https://d-1234567890.awsapps.com/start"
//! allowed_role_names = ["AdministratorAccess", "PowerUserAccess"]
//! include_accounts = []            # empty = all accounts
//! profile_naming = "account-name-role"
//! write_config_file = true
//! output = "json"
//!
//! [oidc]
//! provider_url = "https://vstoken.dev.azure.com/<tenant id>"
//! audience = "api://AzureADTokenExchange"
//! thumbprint = "<certificate thumbprint>"
//! # policy_document = '{"Version": "2012-10-17", "Statement": [...]}'
//! ```
//!
//! The file is looked up at `--config`, then `$AWSLOGIN_CONFIG`, then the
//! platform config directory (`~/.config/awslogin/config.toml` on Linux).

use crate::app::profile_merge::ProfileNaming;
use crate::app::sso_discovery::DiscoveryFilters;
use crate::app::trust_provisioning::TrustConfig;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub const CONFIG_ENV_VAR: &str = "AWSLOGIN_CONFIG";
pub const CREDENTIALS_FILE_ENV_VAR: &str = "AWS_SHARED_CREDENTIALS_FILE";
pub const CONFIG_FILE_ENV_VAR: &str = "AWS_CONFIG_FILE";
pub const DEFAULT_PIPELINE_USER: &str = "azPipelinesUser";
pub const DEFAULT_AUDIENCE: &str = "api://AzureADTokenExchange";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no configuration file found; create {} or pass --config", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("missing [{0}] section in configuration")]
    MissingSection(&'static str),

    #[error("invalid value for `{key}`: {message}")]
    Invalid { key: &'static str, message: String },

    #[error("could not determine the home directory")]
    NoHomeDirectory,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    pub login: Option<LoginSettings>,
    pub oidc: Option<OidcSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginSettings {
    /// Region hosting IAM Identity Center.
    pub region: String,
    pub start_url: String,
    #[serde(default)]
    pub allowed_role_names: Vec<String>,
    #[serde(default)]
    pub include_accounts: Vec<String>,
    #[serde(default)]
    pub profile_naming: ProfileNaming,
    #[serde(default = "default_write_config_file")]
    pub write_config_file: bool,
    #[serde(default = "default_output")]
    pub output: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OidcSettings {
    pub provider_url: String,
    #[serde(default = "default_audience")]
    pub audience: String,
    #[serde(default)]
    pub thumbprint: String,
    /// Inline JSON permission policy for the pipeline role.
    pub policy_document: Option<String>,
}

fn default_write_config_file() -> bool {
    true
}

fn default_output() -> String {
    "json".to_string()
}

fn default_audience() -> String {
    DEFAULT_AUDIENCE.to_string()
}

impl AppConfig {
    pub fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        let config = Self::parse(&text, path)?;
        debug!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Resolve the config path: explicit, then env var, then platform default.
    pub fn resolve_path(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            if !path.is_empty() {
                return Some(PathBuf::from(path));
            }
        }
        directories::ProjectDirs::from("com", "", "awslogin")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn login(&self) -> Result<&LoginSettings, ConfigError> {
        let login = self.login.as_ref().ok_or(ConfigError::MissingSection("login"))?;
        login.validate()?;
        Ok(login)
    }

    pub fn oidc(&self) -> Result<&OidcSettings, ConfigError> {
        let oidc = self.oidc.as_ref().ok_or(ConfigError::MissingSection("oidc"))?;
        if oidc.provider_url.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "oidc.provider_url",
                message: "must not be empty".to_string(),
            });
        }
        Ok(oidc)
    }
}

impl LoginSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.region.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "login.region",
                message: "must not be empty".to_string(),
            });
        }
        if self.start_url.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "login.start_url",
                message: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Accepts a full portal URL or a bare directory id (`d-1234567890`).
    pub fn normalized_start_url(&self) -> String {
        normalize_start_url(&self.start_url)
    }

    pub fn discovery_filters(&self) -> DiscoveryFilters {
        DiscoveryFilters {
            include_accounts: self.include_accounts.clone(),
            allowed_role_names: self.allowed_role_names.clone(),
        }
    }
}

pub fn normalize_start_url(raw: &str) -> String {
    let raw = raw.trim();
    if raw.starts_with("https://") || raw.starts_with("http://") {
        if raw.contains("/start") {
            raw.to_string()
        } else {
            format!("{}/start", raw.trim_end_matches('/'))
        }
    } else {
        let prefix = raw.split('.').next().unwrap_or(raw);
        format!("https://{}.awsapps.com/start", prefix)
    }
}

pub fn role_name_for(pipeline_user: &str) -> String {
    format!("{}-OIDCRole", pipeline_user)
}

pub fn policy_name_for(pipeline_user: &str) -> String {
    format!("{}-OIDCPolicy", pipeline_user)
}

/// Least-privilege starting point; `sts:AssumeRole` is required by the
/// service connection.
pub fn default_policy_document() -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Effect": "Allow",
                "Action": ["s3:ListBucket", "sts:AssumeRole"],
                "Resource": "*"
            }
        ]
    })
}

impl OidcSettings {
    pub fn policy_document(&self) -> Result<Value, ConfigError> {
        match &self.policy_document {
            Some(text) => serde_json::from_str(text).map_err(|e| ConfigError::Invalid {
                key: "oidc.policy_document",
                message: e.to_string(),
            }),
            None => Ok(default_policy_document()),
        }
    }

    pub fn trust_config(
        &self,
        organization: &str,
        project: &str,
        pipeline: Option<&str>,
        pipeline_user: &str,
    ) -> Result<TrustConfig, ConfigError> {
        Ok(TrustConfig {
            oidc_provider_url: self.provider_url.trim().to_string(),
            audience: self.audience.clone(),
            thumbprint: self.thumbprint.clone(),
            role_name: role_name_for(pipeline_user),
            policy_name: policy_name_for(pipeline_user),
            organization: organization.to_string(),
            project: project.to_string(),
            pipeline: pipeline.filter(|p| !p.is_empty()).map(str::to_string),
            policy_document: self.policy_document()?,
        })
    }
}

/// Locations of the shared AWS files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    pub credentials: PathBuf,
    pub config: PathBuf,
}

impl StorePaths {
    pub fn from_env() -> Result<Self, ConfigError> {
        let aws_dir = || {
            dirs::home_dir()
                .map(|home| home.join(".aws"))
                .ok_or(ConfigError::NoHomeDirectory)
        };
        let credentials = match std::env::var_os(CREDENTIALS_FILE_ENV_VAR) {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => aws_dir()?.join("credentials"),
        };
        let config = match std::env::var_os(CONFIG_FILE_ENV_VAR) {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => aws_dir()?.join("config"),
        };
        Ok(Self {
            credentials,
            config,
        })
    }
}
