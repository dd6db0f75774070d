//! Runtime directory resolution and private file persistence.
//!
//! The gate runs in containers, on bare VMs and on developer laptops, so the
//! state and workspace directories are resolved through a fallback chain
//! instead of being hardcoded: operator override, then the data volume, then
//! the home directory, then the system temp dir, then a process-unique temp
//! dir. A candidate is only accepted after a write probe succeeds.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::Config;

/// Persisted gateway configuration. Its presence is what "configured" means.
pub const CONFIG_FILE: &str = "gateway.json";
/// Persisted gateway admin token, written 0600.
pub const TOKEN_FILE: &str = "gateway.token";
/// Directory of pending pairing requests written by the gateway.
pub const PAIRING_DIR: &str = "pairing";

/// Resolved directory pair, shared behind a lock so a permission failure at
/// spawn time can swap in a re-resolved pair without restarting the gate.
pub type SharedDirs = Arc<RwLock<StateDirectories>>;

/// Where the gateway keeps its persistent state and its working files.
#[derive(Debug, Clone)]
pub struct StateDirectories {
    /// Configuration, token and pairing records live here.
    pub state_dir: PathBuf,
    /// The gateway's working directory.
    pub workspace_dir: PathBuf,
}

impl StateDirectories {
    /// Resolve both directories through the fallback chain. Never fails: if
    /// every candidate flunks the probe the process-unique temp dir is kept
    /// anyway so startup can proceed and report the problem over HTTP.
    pub fn resolve(config: &Config) -> Self {
        // One suffix per resolution so both dirs land under the same
        // process-unique parent when the chain bottoms out.
        let unique = Uuid::new_v4().to_string();
        let state_dir = pick_usable(candidates(config, "state", &unique), "state");
        let workspace_dir = pick_usable(candidates(config, "workspace", &unique), "workspace");

        info!(
            state_dir = %state_dir.display(),
            workspace_dir = %workspace_dir.display(),
            "Resolved runtime directories"
        );

        Self {
            state_dir,
            workspace_dir,
        }
    }

    /// Wrap in the shared handle used across the gate.
    pub fn into_shared(self) -> SharedDirs {
        Arc::new(RwLock::new(self))
    }

    pub fn config_file(&self) -> PathBuf {
        self.state_dir.join(CONFIG_FILE)
    }

    pub fn token_file(&self) -> PathBuf {
        self.state_dir.join(TOKEN_FILE)
    }

    pub fn pairing_dir(&self) -> PathBuf {
        self.state_dir.join(PAIRING_DIR)
    }

    /// True once the gateway has a persisted configuration file.
    pub fn is_configured(&self) -> bool {
        self.config_file().is_file()
    }
}

/// Re-run resolution and swap the shared pair. Used when a previously
/// accepted directory starts failing with permission errors.
pub fn re_resolve(shared: &SharedDirs, config: &Config) -> StateDirectories {
    let fresh = StateDirectories::resolve(config);
    *shared.write() = fresh.clone();
    fresh
}

/// Candidate chain for one directory role, most preferred first.
fn candidates(config: &Config, role: &str, unique: &str) -> Vec<PathBuf> {
    let mut out = Vec::new();

    let operator_override = match role {
        "state" => config.state_dir.as_ref(),
        _ => config.workspace_dir.as_ref(),
    };
    if let Some(dir) = operator_override {
        out.push(PathBuf::from(dir));
    }

    out.push(Path::new(&config.data_volume).join(role));

    if let Some(home) = dirs_next::home_dir() {
        out.push(home.join(".gateward").join(role));
    }

    out.push(std::env::temp_dir().join("gateward").join(role));
    out.push(
        std::env::temp_dir()
            .join(format!("gateward-{}", unique))
            .join(role),
    );

    out
}

fn pick_usable(candidates: Vec<PathBuf>, role: &str) -> PathBuf {
    for candidate in &candidates {
        if probe_dir(candidate) {
            return candidate.clone();
        }
        debug!(dir = %candidate.display(), role, "Directory candidate failed probe");
    }

    // Nothing probed writable. Keep the last candidate so startup completes.
    let last = candidates
        .last()
        .cloned()
        .unwrap_or_else(std::env::temp_dir);
    error!(dir = %last.display(), role, "No writable directory candidate found");
    last
}

/// Write probe: the candidate must accept a file and a subdirectory, not
/// just exist. Read-only bind mounts pass a bare `create_dir_all` check.
pub fn probe_dir(path: &Path) -> bool {
    if std::fs::create_dir_all(path).is_err() {
        return false;
    }

    let marker = path.join(format!(".gateward-probe-{}", std::process::id()));
    if std::fs::write(&marker, b"probe").is_err() {
        return false;
    }
    let _ = std::fs::remove_file(&marker);

    let subdir = path.join(format!(".gateward-probe-{}.d", std::process::id()));
    if std::fs::create_dir(&subdir).is_err() {
        return false;
    }
    let _ = std::fs::remove_dir(&subdir);

    true
}

/// Write a file atomically (temp then rename) with owner-only permissions.
pub fn write_private(path: &Path, content: &str) -> Result<()> {
    // Create parent directory if needed
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    // Write atomically
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, content)
        .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed to rename into {}", path.display()))?;

    // Set restrictive permissions on Unix
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_mode(0o600);
        std::fs::set_permissions(path, perms)?;
    }

    Ok(())
}

/// Load the gateway admin token, minting and persisting a fresh one when
/// neither the environment nor the token file provides it.
pub fn load_or_mint_token(state_dir: &Path, configured: Option<&str>) -> Result<String> {
    if let Some(token) = configured {
        return Ok(token.to_string());
    }

    let path = state_dir.join(TOKEN_FILE);
    if let Ok(existing) = std::fs::read_to_string(&path) {
        let existing = existing.trim();
        if !existing.is_empty() {
            return Ok(existing.to_string());
        }
    }

    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    let token = hex::encode(bytes);

    write_private(&path, &token).context("Failed to persist gateway token")?;
    info!(path = %path.display(), "Minted new gateway token");

    Ok(token)
}
