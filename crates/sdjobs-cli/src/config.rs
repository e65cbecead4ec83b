//! Configuration file management for sdjobs.
//!
//! Provides a TOML-based config file at `~/.config/sdjobs/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use sdjobs_core::{QuiescencePolicy, SupervisorConfig};

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub paths: PathsSection,
    pub server: ServerSection,
    pub supervisor: SupervisorSection,
    pub jobs: JobsSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    /// Installation root holding `bin/sd-cli` or `sd-cli`.
    pub root: Option<PathBuf>,
    /// Model directory (defaults to `<root>/models`).
    pub models: Option<PathBuf>,
    /// Image output directory (defaults to `<root>/output`).
    pub output: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 3030,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    /// Kill a process this long after its last stderr line. 0 disables.
    pub idle_timeout_ms: u64,
    pub include_stdout: bool,
    pub drain_timeout_ms: u64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 500,
            include_stdout: false,
            drain_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsSection {
    /// Finished jobs older than this are dropped.
    pub max_age_hours: u64,
    pub reap_interval_secs: u64,
}

impl Default for JobsSection {
    fn default() -> Self {
        Self {
            max_age_hours: 24,
            reap_interval_secs: 3600,
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the sdjobs config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/sdjobs` or `~/.config/sdjobs`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("sdjobs");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("sdjobs")
}

/// Return the path to the sdjobs config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Values given on the command line, if any.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub root: Option<PathBuf>,
    pub models_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub bind: Option<String>,
    pub port: Option<u16>,
}

/// Fully resolved configuration, ready for use.
#[derive(Debug, Clone)]
pub struct SdConfig {
    pub root: PathBuf,
    pub models_dir: PathBuf,
    pub output_dir: PathBuf,
    pub bind: String,
    pub port: u16,
    pub supervisor: SupervisorConfig,
    pub max_age: Duration,
    pub reap_interval: Duration,
}

impl SdConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// - root: `--root` > `SDJOBS_ROOT` > `paths.root` > current directory
    /// - models: `--models-dir` > `SDJOBS_MODELS_DIR` > `paths.models` > `<root>/models`
    /// - output: `--output-dir` > `SDJOBS_OUTPUT_DIR` > `paths.output` > `<root>/output`
    /// - bind/port: flag > `SDJOBS_BIND` / `SDJOBS_PORT` > `[server]` > 127.0.0.1:3030
    pub fn resolve(cli: &Overrides) -> Result<Self> {
        let file = if config_path().exists() {
            load_config()?
        } else {
            ConfigFile::default()
        };
        Self::resolve_with(cli, file)
    }

    fn resolve_with(cli: &Overrides, file: ConfigFile) -> Result<Self> {
        let root = match pick_path(cli.root.as_deref(), "SDJOBS_ROOT", file.paths.root) {
            Some(root) => root,
            None => std::env::current_dir().context("failed to determine current directory")?,
        };
        let models_dir = pick_path(cli.models_dir.as_deref(), "SDJOBS_MODELS_DIR", file.paths.models)
            .unwrap_or_else(|| root.join("models"));
        let output_dir = pick_path(cli.output_dir.as_deref(), "SDJOBS_OUTPUT_DIR", file.paths.output)
            .unwrap_or_else(|| root.join("output"));

        let bind = if let Some(bind) = &cli.bind {
            bind.clone()
        } else if let Ok(bind) = std::env::var("SDJOBS_BIND") {
            bind
        } else {
            file.server.bind
        };

        let port = if let Some(port) = cli.port {
            port
        } else if let Ok(port) = std::env::var("SDJOBS_PORT") {
            port.parse()
                .with_context(|| format!("SDJOBS_PORT is not a valid port: {port:?}"))?
        } else {
            file.server.port
        };

        let idle_timeout = match file.supervisor.idle_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        Ok(Self {
            root,
            models_dir,
            output_dir,
            bind,
            port,
            supervisor: SupervisorConfig {
                quiescence: QuiescencePolicy {
                    idle_timeout,
                    include_stdout: file.supervisor.include_stdout,
                },
                drain_timeout: Duration::from_millis(file.supervisor.drain_timeout_ms),
            },
            max_age: Duration::from_secs(file.jobs.max_age_hours.saturating_mul(3600)),
            reap_interval: Duration::from_secs(file.jobs.reap_interval_secs.max(1)),
        })
    }
}

fn pick_path(cli: Option<&Path>, env: &str, file: Option<PathBuf>) -> Option<PathBuf> {
    cli.map(Path::to_path_buf)
        .or_else(|| std::env::var_os(env).map(PathBuf::from))
        .or(file)
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
