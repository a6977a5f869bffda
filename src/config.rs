//! Configuration management for the CDC follower
//!
//! Configuration is read from environment variables, optionally seeded from
//! a `key=value` `.env` file found under `$XDG_CONFIG_HOME/pgcdc/` (or
//! `$HOME/.config/pgcdc/`). Real environment variables always win over the
//! file; unknown keys in the file are ignored.

use crate::errors::{CdcError, CdcResult};
use crate::lsn::Lsn;
use crate::types::StreamOutputPlugin;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use tracing::debug;

/// pgcopydb-compatible connection variables
pub const SOURCE_PGURI_VAR: &str = "PGCOPYDB_SOURCE_PGURI";
pub const TARGET_PGURI_VAR: &str = "PGCOPYDB_TARGET_PGURI";

/// Keys a `.env` file may provide; anything else in the file is ignored
const KNOWN_ENV_KEYS: &[&str] = &[
    SOURCE_PGURI_VAR,
    TARGET_PGURI_VAR,
    "PGCDC_SLOT_NAME",
    "PGCDC_ORIGIN",
    "PGCDC_PLUGIN",
    "PGCDC_DIR",
];

/// Configuration for the CDC follower with validation
#[derive(Debug, Clone)]
pub struct CdcConfig {
    pub source_pguri: String,
    pub target_pguri: String,
    pub slot_name: String,
    /// Replication origin name on the target
    pub origin: String,
    pub plugin: StreamOutputPlugin,
    /// Directory holding JSON files, SQL files, sidecar files and the queue socket
    pub dir: PathBuf,
    /// Stop position, when set from the command line
    pub endpos: Option<Lsn>,
}

impl CdcConfig {
    /// Load configuration from the environment (after `.env` seeding).
    pub fn from_env() -> CdcResult<Self> {
        load_env_file();
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Build a configuration from any variable lookup, validating it.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> CdcResult<Self> {
        let source_pguri = lookup(SOURCE_PGURI_VAR).ok_or_else(|| {
            CdcError::config(format!(
                "Missing required {} environment variable",
                SOURCE_PGURI_VAR
            ))
        })?;
        let target_pguri = lookup(TARGET_PGURI_VAR).ok_or_else(|| {
            CdcError::config(format!(
                "Missing required {} environment variable",
                TARGET_PGURI_VAR
            ))
        })?;

        let slot_name = lookup("PGCDC_SLOT_NAME").unwrap_or_else(|| "pgcopydb".to_string());
        let origin = lookup("PGCDC_ORIGIN").unwrap_or_else(|| "pgcopydb".to_string());
        let plugin = match lookup("PGCDC_PLUGIN") {
            Some(name) => StreamOutputPlugin::from_name(&name)?,
            None => StreamOutputPlugin::default(),
        };
        let dir = lookup("PGCDC_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/tmp/pgcdc/cdc"));

        Self::validate_and_create(source_pguri, target_pguri, slot_name, origin, plugin, dir)
    }

    fn validate_and_create(
        source_pguri: String,
        target_pguri: String,
        slot_name: String,
        origin: String,
        plugin: StreamOutputPlugin,
        dir: PathBuf,
    ) -> CdcResult<Self> {
        if source_pguri.trim().is_empty() {
            return Err(CdcError::config("Source connection string cannot be empty"));
        }

        if target_pguri.trim().is_empty() {
            return Err(CdcError::config("Target connection string cannot be empty"));
        }

        validate_identifier("Slot name", &slot_name)?;
        validate_identifier("Origin name", &origin)?;

        Ok(Self {
            source_pguri,
            target_pguri,
            slot_name,
            origin,
            plugin,
            dir,
            endpos: None,
        })
    }

    /// Path of a file inside the CDC directory
    pub fn dir_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

/// Validate a replication slot/origin name against PostgreSQL naming rules
fn validate_identifier(what: &str, name: &str) -> CdcResult<()> {
    if name.trim().is_empty() {
        return Err(CdcError::config(format!("{} cannot be empty", what)));
    }

    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(CdcError::config(format!(
            "{} can only contain alphanumeric characters and underscores",
            what
        )));
    }

    if name.len() > 63 {
        // PostgreSQL identifier length limit
        return Err(CdcError::config(format!(
            "{} cannot be longer than 63 characters",
            what
        )));
    }

    Ok(())
}

/// Seed missing environment variables from the `.env` file, when one exists.
fn load_env_file() {
    let Some(path) = env_file_path() else {
        return;
    };
    let Ok(content) = std::fs::read_to_string(&path) else {
        return;
    };

    debug!("Loading environment defaults from {}", path.display());

    for (key, value) in parse_env_file(&content) {
        if env::var(&key).is_err() {
            // Safety: called from main before any worker thread starts
            unsafe { env::set_var(&key, &value) };
        }
    }
}

fn env_file_path() -> Option<PathBuf> {
    let config_home = env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .ok()
        .or_else(|| {
            env::var("HOME")
                .ok()
                .map(|home| PathBuf::from(home).join(".config"))
        })?;
    Some(config_home.join("pgcdc").join(".env"))
}

/// Parse `key=value` lines, keeping only known keys. `#` starts a comment.
fn parse_env_file(content: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if KNOWN_ENV_KEYS.contains(&key) {
            vars.insert(key.to_string(), value.trim().to_string());
        }
    }
    vars
}
