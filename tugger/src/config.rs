//! Command line and environment configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use crate::error::PolicyError;
use crate::notify::NotifierConfig;
use crate::pipeline::Settings;
use crate::policy::{ImagePolicy, LegacyPolicy, Policy};
use crate::registry::Credentials;

/// Admission webhook that keeps pod images on trusted registries
#[derive(Parser, Debug, Clone)]
#[command(name = "tugger", version, about, long_about = None)]
pub struct Config {
    /// Only rewrite an image when the rewritten image exists
    #[arg(long, env = "IF_EXISTS")]
    pub if_exists: bool,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// YAML rule list; without it the registry whitelist is used
    #[arg(long, env = "POLICY_FILE", value_name = "PATH")]
    pub policy_file: Option<PathBuf>,

    #[arg(
        long,
        env = "TLS_CERT",
        value_name = "PATH",
        default_value = "/etc/admission-controller/tls/tls.crt"
    )]
    pub tls_cert: PathBuf,

    #[arg(
        long,
        env = "TLS_KEY",
        value_name = "PATH",
        default_value = "/etc/admission-controller/tls/tls.key"
    )]
    pub tls_key: PathBuf,

    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:443")]
    pub listen_addr: SocketAddr,

    /// Tag prefixed to every notification
    #[arg(long, env = "ENV")]
    pub env: Option<String>,

    /// Registry untrusted images are moved to when no policy file is given
    #[arg(long, env = "DOCKER_REGISTRY_URL", value_name = "HOST")]
    pub docker_registry_url: Option<String>,

    /// Pull secret added to rewritten pods
    #[arg(long, env = "REGISTRY_SECRET_NAME")]
    pub registry_secret_name: Option<String>,

    /// Comma separated registries trusted without a policy file
    #[arg(long, env = "WHITELIST_REGISTRIES", default_value = "")]
    pub whitelist_registries: String,

    /// Comma separated namespaces exempt from the policy
    #[arg(long, env = "WHITELIST_NAMESPACES", default_value = "")]
    pub whitelist_namespaces: String,

    /// Incoming webhook notifications are posted to
    #[arg(long, env = "WEBHOOK_URL", value_name = "URL")]
    pub webhook_url: Option<String>,

    /// Window in which identical notifications are sent once, 0 disables
    #[arg(long, env = "NOTIFICATION_WINDOW_SECS", default_value_t = 60)]
    pub notification_window_secs: u64,

    #[arg(long, env = "NOTIFICATION_TIMEOUT_SECS", default_value_t = 10)]
    pub notification_timeout_secs: u64,

    #[arg(long, env = "REGISTRY_TIMEOUT_SECS", default_value_t = 10)]
    pub registry_timeout_secs: u64,

    #[arg(long, env = "REGISTRY_USERNAME", requires = "registry_password")]
    pub registry_username: Option<String>,

    #[arg(
        long,
        env = "REGISTRY_PASSWORD",
        hide_env_values = true,
        requires = "registry_username"
    )]
    pub registry_password: Option<String>,
}

/// Splits a comma separated list, dropping blank entries
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(String::from)
        .collect()
}

impl Config {
    pub fn pipeline_settings(&self) -> Settings {
        Settings {
            whitelist_namespaces: split_list(&self.whitelist_namespaces),
            registry_secret: self.registry_secret_name.clone(),
            if_exists: self.if_exists,
        }
    }

    pub fn notifier_config(&self) -> NotifierConfig {
        NotifierConfig {
            webhook_url: self.webhook_url.clone(),
            environment: self.env.clone(),
            dedup_window: (self.notification_window_secs > 0)
                .then(|| Duration::from_secs(self.notification_window_secs)),
            timeout: Duration::from_secs(self.notification_timeout_secs),
        }
    }

    pub fn registry_timeout(&self) -> Duration {
        Duration::from_secs(self.registry_timeout_secs)
    }

    pub fn registry_credentials(&self) -> Option<Credentials> {
        match (&self.registry_username, &self.registry_password) {
            (Some(username), Some(password)) => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }

    /// Loads the policy file, or falls back to the registry whitelist
    pub fn image_policy(&self) -> Result<ImagePolicy, PolicyError> {
        if let Some(path) = &self.policy_file {
            info!(path = %path.display(), "loading policy file");
            return Policy::from_file(path).map(ImagePolicy::from);
        }

        let trusted = split_list(&self.whitelist_registries);
        info!(
            trusted = ?trusted,
            target = ?self.docker_registry_url,
            "no policy file, using registry whitelist"
        );
        Ok(LegacyPolicy::new(trusted, self.docker_registry_url.clone()).into())
    }
}
