use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use utils::{config::CliEnvExt, serde::deserialize_vec_string};

/// This struct is used for both args and environment variables.
/// Every env var can be overridden by a cli arg, and these override the
/// config file. Env vars follow the pattern RUNNERHUB_{UPPERCASE_ARG_NAME}.
#[derive(Debug, Parser, Serialize, Deserialize, Default)]
#[command(version, about, long_about = None)]
#[serde(default)]
pub struct CliArgs {
    /// The home directory of the application, where the runnerhub.toml
    /// configuration file is stored. If not provided, a series of default
    /// directories will be tried
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub home: Option<PathBuf>,

    /// The path to an optional dotenv file to try and load.
    /// If not set, will be the current working directory's .env
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dotenv: Option<PathBuf>,

    /// The port to bind the server to
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u32>,

    /// The host to bind the server to
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Log level directives
    #[arg(long)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    #[serde(deserialize_with = "deserialize_vec_string")]
    pub log_level: Vec<String>,

    /// The directory to store all internal data files
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<PathBuf>,

    /// Worker threads of the shared tokio runtime
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_threads: Option<usize>,

    /// The allowed cors origins
    #[arg(long)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    #[serde(deserialize_with = "deserialize_vec_string")]
    pub cors_allowed_origins: Vec<String>,

    /// Optional bearer token to protect mutating HTTP endpoints
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,

    /// Webhook shared secret (usually leave unset and provide via env)
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<String>,

    /// Upstream API token (usually leave unset and provide via env)
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_token: Option<String>,

    /// Jaeger collector to send trace data
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jaeger: Option<String>,

    /// OTLP collector to send metrics data
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prometheus: Option<String>,
}

impl CliEnvExt for CliArgs {
    const ENV_VAR_PREFIX: &'static str = "RUNNERHUB";
    const TOML_IDENTIFIER: &'static str = "runnerhub";

    fn home_dir(&self) -> Option<PathBuf> {
        self.home.clone()
    }

    fn dotenv_path(&self) -> Option<PathBuf> {
        self.dotenv.clone()
    }
}
