// Copyright 2025 Kestrun Authors
//
// Licensed under the MIT License. See LICENSE in the repository root.

//! # Kestrun CLI
//!
//! Command-line front end for the Kestrun script host.
//!
//! ## Key Commands
//!
//! - `kestrun serve <manifest>`: build the host described by a JSON manifest
//!   and serve it until Ctrl-C
//! - `kestrun check <manifest>`: compile every script in a manifest and
//!   report diagnostics without starting anything
//!
//! The library half holds the manifest handling both commands share, so it
//! can be tested without spawning the binary.

use anyhow::{Context, Result};
use kestrun_common::{Diagnostic, KestrunError};
use kestrun_server::config::HostSettings;
use kestrun_server::{HostManifest, KestrunHost};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Command-line values that take precedence over the manifest's `host`
/// section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub bind: Option<SocketAddr>,
    pub min_runspaces: Option<usize>,
    pub max_runspaces: Option<usize>,
    pub execution_timeout_ms: Option<u64>,
    pub acquire_timeout_ms: Option<u64>,
}

impl Overrides {
    pub fn apply(&self, settings: &mut HostSettings) {
        if let Some(bind) = self.bind {
            settings.bind = bind;
        }
        if let Some(min) = self.min_runspaces {
            settings.min_runspaces = min;
        }
        if let Some(max) = self.max_runspaces {
            settings.max_runspaces = max;
        }
        if let Some(timeout) = self.execution_timeout_ms {
            settings.execution_timeout_ms = timeout;
        }
        if self.acquire_timeout_ms.is_some() {
            settings.acquire_timeout_ms = self.acquire_timeout_ms;
        }
    }
}

/// Directory that relative script paths in a manifest resolve against.
pub fn manifest_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Loads a manifest and applies `overrides` to its host settings.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_manifest(path: &Path, overrides: &Overrides) -> Result<HostManifest> {
    let mut manifest = HostManifest::load(path)
        .with_context(|| format!("Failed to load manifest {}", path.display()))?;
    overrides.apply(&mut manifest.host);
    Ok(manifest)
}

/// Builds (but does not start) the host a manifest describes.
///
/// # Errors
///
/// Returns an error if the manifest is invalid or a script fails to compile.
pub fn build_host(path: &Path, overrides: &Overrides) -> Result<KestrunHost> {
    let manifest = load_manifest(path, overrides)?;
    let host = manifest
        .into_host(&manifest_dir(path))
        .with_context(|| format!("Invalid manifest {}", path.display()))?;
    Ok(host)
}

/// Outcome of `kestrun check`.
#[derive(Debug, Default)]
pub struct CheckReport {
    pub routes: usize,
    pub error: Option<String>,
    pub diagnostics: Vec<Diagnostic>,
}

impl CheckReport {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn to_json(&self) -> Value {
        let diagnostics: Vec<Value> = self
            .diagnostics
            .iter()
            .map(|d| {
                json!({
                    "severity": d.severity.to_string(),
                    "message": d.message,
                    "line": d.line,
                    "column": d.column,
                })
            })
            .collect();

        json!({
            "ok": self.is_ok(),
            "routes": self.routes,
            "error": self.error,
            "diagnostics": diagnostics,
        })
    }
}

/// Compiles everything in a manifest.
///
/// Script and configuration problems end up in the report; only an
/// unreadable or malformed manifest is an `Err`.
///
/// # Errors
///
/// Returns an error if the manifest cannot be loaded.
pub fn check(path: &Path) -> Result<CheckReport> {
    let manifest = load_manifest(path, &Overrides::default())?;
    let routes = manifest.routes.len();

    Ok(match manifest.into_host(&manifest_dir(path)) {
        Ok(host) => CheckReport {
            routes: host.routes().len(),
            ..CheckReport::default()
        },
        Err(e) => {
            let diagnostics = match &e {
                KestrunError::ScriptCompilation { diagnostics, .. } => diagnostics.clone(),
                _ => Vec::new(),
            };
            CheckReport {
                routes,
                error: Some(e.to_string()),
                diagnostics,
            }
        }
    })
}

#[cfg(test)]
mod tests;
