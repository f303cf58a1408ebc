use anyhow::{bail, Context, Result};
use figment::{providers::Format, Figment};
use serde::{de::DeserializeOwned, Serialize};
use std::path::PathBuf;

/// Implemented by each binary's CLI-args struct. The same struct is used for
/// args and environment variables: every env var can be overridden by a cli
/// arg, and both override the config file.
pub trait CliEnvExt: clap::Parser + Serialize + DeserializeOwned + Default {
    /// Env vars follow `{ENV_VAR_PREFIX}_{UPPERCASE_ARG_NAME}`
    const ENV_VAR_PREFIX: &'static str;
    /// Config file is `{TOML_IDENTIFIER}.toml`
    const TOML_IDENTIFIER: &'static str;

    fn home_dir(&self) -> Option<PathBuf>;
    fn dotenv_path(&self) -> Option<PathBuf>;
}

/// Implemented by each binary's Config struct so shared setup (log filters)
/// works across binaries.
pub trait ConfigExt {
    fn log_levels(&self) -> &[String];

    fn tracing_env_filter(&self) -> Result<tracing_subscriber::EnvFilter> {
        let mut filter = tracing_subscriber::EnvFilter::from_default_env();
        for directive in self.log_levels() {
            match directive.parse() {
                Ok(directive) => filter = filter.add_directive(directive),
                Err(err) => bail!("{}: {}", err, directive),
            }
        }

        Ok(filter)
    }
}

/// Builds the final config by merging, in order of preference:
///
/// 1. cli args
/// 2. environment variables
/// 3. config file
/// 4. defaults
#[derive(Debug)]
pub struct ConfigBuilder<A: CliEnvExt> {
    pub cli_args: A,
}

impl<A: CliEnvExt> ConfigBuilder<A> {
    pub fn new(cli_args: A) -> Self {
        Self { cli_args }
    }

    /// Merges cli and env vars, which both have optional values, parsing
    /// complex types from strings where needed.
    pub fn merge_cli_env_args(&self) -> Result<A> {
        let cli_args: A = Figment::new()
            .merge(figment::providers::Env::prefixed(&format!(
                "{}_",
                A::ENV_VAR_PREFIX
            )))
            .merge(figment::providers::Serialized::defaults(&self.cli_args))
            .extract()?;

        Ok(cli_args)
    }

    pub fn build<C>(self) -> Result<C>
    where
        C: Default + Serialize + DeserializeOwned,
    {
        // try to load dotenv first, since it may affect env vars for filepaths
        let dotenv_path = self
            .cli_args
            .dotenv_path()
            .unwrap_or(std::env::current_dir()?.join(".env"));

        if dotenv_path.exists() {
            if let Err(e) = dotenvy::from_path(dotenv_path) {
                bail!("Error loading dotenv file: {}", e);
            }
        }

        let cli_env_args = self.merge_cli_env_args()?;

        // the final config can use more complex types with TOML-friendly
        // syntax; required holes are filled from defaults at the end
        let config: C = Figment::new()
            .merge(figment::providers::Toml::file(Self::filepath(
                &cli_env_args,
            )?))
            .merge(figment::providers::Serialized::defaults(cli_env_args))
            .join(figment::providers::Serialized::defaults(C::default()))
            .extract()?;

        Ok(config)
    }

    /// Finds the config filepath through a series of fallbacks.
    pub fn filepath(cli_env_args: &A) -> Result<PathBuf> {
        let filepaths_to_try = Self::filepaths_to_try(cli_env_args);

        filepaths_to_try
            .iter()
            .find(|filename| filename.exists())
            .with_context(|| {
                format!(
                    "No config file found, try creating one of these: {:?}",
                    filepaths_to_try
                )
            })
            .cloned()
    }

    /// The list of filepaths to try for the config file, in order.
    pub fn filepaths_to_try(cli_env_args: &A) -> Vec<PathBuf> {
        let mut dirs = Vec::new();

        // explicit --home (or env override): used as the direct home
        // directory, no subdirectory appended
        if let Some(dir) = cli_env_args.home_dir() {
            dirs.push(dir);
        }

        // the current working directory, wherever the command is run from
        if let Ok(dir) = std::env::current_dir() {
            dirs.push(dir);
        }

        // the user's home directory, in a hidden subdirectory to avoid
        // pollution: ~/.{name}/{name}.toml
        if let Some(dir) =
            dirs::home_dir().map(|dir| dir.join(format!(".{}", A::TOML_IDENTIFIER)))
        {
            dirs.push(dir);
        }

        // the platform config directory, e.g. ~/.config/{name}/{name}.toml
        // on Linux
        if let Some(dir) = dirs::config_dir().map(|dir| dir.join(A::TOML_IDENTIFIER)) {
            dirs.push(dir);
        }

        // XDG may differ from config_dir on macOS/Windows and unix-likes
        if let Some(dir) = std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .map(|dir| dir.join(A::TOML_IDENTIFIER))
        {
            dirs.push(dir);
        }

        // lastly, /etc/{name}/{name}.toml
        dirs.push(PathBuf::from("/etc").join(A::TOML_IDENTIFIER));

        dirs.into_iter()
            .map(|dir| dir.join(format!("{}.toml", A::TOML_IDENTIFIER)))
            .collect()
    }
}

/// Expand `~` in a path coming from config or cli.
pub fn expand_tilde(path: &std::path::Path) -> PathBuf {
    shellexpand::tilde(&path.to_string_lossy()).to_string().into()
}
