//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The file path
//! defaults to `config.yaml` and can be set with `-f` or the `TPSCTL_CONFIG` environment
//! variable.
//!
//! ## Loading Priority
//!
//! Sources are merged in this order, later ones overriding earlier ones:
//!
//! 1. **YAML config file** (default: `config.yaml`)
//! 2. **Environment variables** prefixed with `TPSCTL_`; nested keys use `__`, so
//!    `TPSCTL_ENGINE__SOLVER_TIMEOUT=2s` sets `engine.solver_timeout`
//! 3. **DATABASE_URL**, which overrides `database.url` if set
//!
//! ## Example
//!
//! ```yaml
//! log_format: json
//! capacity:
//!   backend: file
//!   path: carriers.yaml
//!   refresh_interval: 1h
//! engine:
//!   solver_timeout: 5s
//! audit:
//!   sink: tracing
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::errors::Error;
use crate::solver::simplex::DEFAULT_MAX_ITERATIONS;

/// Command line arguments.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "TPSCTL_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without processing any requests.
    #[arg(long)]
    pub validate: bool,

    /// Read allocation requests (one JSON object per line) from this file instead of stdin.
    #[arg(long)]
    pub requests: Option<PathBuf>,
}

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub log_format: LogFormat,
    pub capacity: CapacityConfig,
    pub engine: EngineConfig,
    pub audit: AuditConfig,
    pub database: DatabaseConfig,
    /// Set from the `DATABASE_URL` environment variable; folded into `database.url` on load.
    #[serde(skip_serializing)]
    pub database_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CapacityBackend {
    /// Carrier records live in process memory, loaded from `capacity.path`
    #[default]
    File,
    /// Carrier records live in the `carrier_capacity` table
    Postgres,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CapacityConfig {
    pub backend: CapacityBackend,
    /// Carrier profile file (YAML, or JSON by extension). Required for the file backend;
    /// optional for postgres, where it seeds the table on each refresh.
    pub path: Option<PathBuf>,
    /// How often carrier records are rebuilt. Zero disables periodic refresh.
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            backend: CapacityBackend::File,
            path: None,
            refresh_interval: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Wall-clock budget for one solve; exceeding it rejects the request.
    #[serde(with = "humantime_serde")]
    pub solver_timeout: Duration,
    /// Pivot budget for one solve.
    pub max_solver_iterations: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            solver_timeout: Duration::from_secs(5),
            max_solver_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuditSinkKind {
    #[default]
    Tracing,
    Postgres,
    None,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AuditConfig {
    pub sink: AuditSinkKind,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let mut config: Self = Self::figment(args).extract()?;

        if let Some(url) = config.database_url.take() {
            config.database.url = Some(url);
        }

        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("TPSCTL_").split("__").ignore(&["CONFIG"]))
            .merge(Env::raw().only(&["DATABASE_URL"]))
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        let needs_database =
            self.capacity.backend == CapacityBackend::Postgres || self.audit.sink == AuditSinkKind::Postgres;

        if self.capacity.backend == CapacityBackend::File && self.capacity.path.is_none() {
            return Err(Error::config(
                "capacity.path is required for the file backend. Set it in the config file or via TPSCTL_CAPACITY__PATH.",
            ));
        }

        if needs_database {
            if !cfg!(feature = "postgres") {
                return Err(Error::config(
                    "a postgres backend or audit sink is configured but tpsctl was built without the `postgres` feature",
                ));
            }
            if self.database.url.as_deref().is_none_or(str::is_empty) {
                return Err(Error::config(
                    "database.url is required when using postgres. Set DATABASE_URL or database.url.",
                ));
            }
            if self.database.max_connections == 0 {
                return Err(Error::config("database.max_connections must be at least 1"));
            }
        }

        if self.engine.solver_timeout.is_zero() {
            return Err(Error::config("engine.solver_timeout must be greater than zero"));
        }
        if self.engine.max_solver_iterations == 0 {
            return Err(Error::config("engine.max_solver_iterations must be greater than zero"));
        }

        Ok(())
    }
}
