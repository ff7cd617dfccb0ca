//! Host configuration
//!
//! [`HostConfig`] is the typed configuration a [`KestrunHost`] is built
//! from. [`HostManifest`] is its JSON form plus everything registered on the
//! host: authentication, claim policies, initial shared state, middleware
//! and routes.
//!
//! ```json
//! {
//!   "host": { "bind": "127.0.0.1:5000", "max_runspaces": 4 },
//!   "authentication": { "api_key": "secret", "principal": "ops",
//!                       "claims": [{ "Type": "role", "Value": "admin" }] },
//!   "policies": [{ "name": "Admins",
//!                  "rules": [{ "claim_type": "role", "allowed_values": ["admin"] }] }],
//!   "shared_state": { "Visits": { "Count": 0 } },
//!   "routes": [
//!     { "pattern": "/visit", "methods": ["GET"], "language": "JavaScript",
//!       "code": "Response.writeText(String(SharedState.increment('Visits', 'Count', 1)));" },
//!     { "pattern": "/admin", "language": "rhai", "file": "admin.rhai", "policy": "Admins" }
//!   ]
//! }
//! ```

use kestrun_common::auth::{ApiKeyAuthenticator, Claim, ClaimPolicy};
use kestrun_common::{KestrunError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::host::{KestrunHost, RouteOptions};
use crate::languages::{CompileOptions, HandlerSource, ScriptLanguage};
use crate::resource_limits::ResourceLimits;
use crate::runtime::PoolConfig;
use crate::shared_state::DefinePolicy;

pub const DEFAULT_BIND: &str = "127.0.0.1:5000";
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_HEADER_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP server options, one field per supported setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    /// Largest request body accepted, larger bodies get 413
    pub max_body_bytes: usize,
    /// Time allowed for a client to send the request head
    pub header_read_timeout: Duration,
    /// HTTP/1.1 keep-alive
    pub keep_alive: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            header_read_timeout: DEFAULT_HEADER_READ_TIMEOUT,
            keep_alive: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HostConfig {
    pub bind: SocketAddr,
    pub pool: PoolConfig,
    pub limits: ResourceLimits,
    pub server: ServerOptions,
    pub shared_state_policy: DefinePolicy,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 5000)),
            pool: PoolConfig::default(),
            limits: ResourceLimits::default(),
            server: ServerOptions::default(),
            shared_state_policy: DefinePolicy::default(),
        }
    }
}

impl HostConfig {
    /// # Errors
    ///
    /// `Config` describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        self.limits.validate().map_err(KestrunError::Config)?;
        if self.server.max_body_bytes == 0 {
            return Err(KestrunError::Config("max_body_bytes must be at least 1".into()));
        }
        if self.server.header_read_timeout.is_zero() {
            return Err(KestrunError::Config("header_read_timeout must be greater than zero".into()));
        }
        Ok(())
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5000))
}

fn default_min_runspaces() -> usize {
    PoolConfig::default().min_runspaces
}

fn default_max_runspaces() -> usize {
    PoolConfig::default().max_runspaces
}

fn default_execution_timeout_ms() -> u64 {
    ResourceLimits::default().execution_timeout_ms()
}

fn default_max_loop_iterations() -> Option<u64> {
    ResourceLimits::default().max_loop_iterations
}

fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

fn default_header_read_timeout_ms() -> u64 {
    DEFAULT_HEADER_READ_TIMEOUT.as_secs() * 1000
}

fn default_keep_alive() -> bool {
    true
}

fn default_methods() -> Vec<String> {
    vec!["GET".to_string()]
}

/// The `host` section of a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostSettings {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    #[serde(default = "default_min_runspaces")]
    pub min_runspaces: usize,
    #[serde(default = "default_max_runspaces")]
    pub max_runspaces: usize,
    #[serde(default)]
    pub acquire_timeout_ms: Option<u64>,
    #[serde(default = "default_execution_timeout_ms")]
    pub execution_timeout_ms: u64,
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: Option<u64>,
    #[serde(default)]
    pub max_operations: Option<u64>,
    #[serde(default)]
    pub max_call_depth: Option<usize>,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_header_read_timeout_ms")]
    pub header_read_timeout_ms: u64,
    #[serde(default = "default_keep_alive")]
    pub keep_alive: bool,
    #[serde(default)]
    pub shared_state_policy: DefinePolicy,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            min_runspaces: default_min_runspaces(),
            max_runspaces: default_max_runspaces(),
            acquire_timeout_ms: None,
            execution_timeout_ms: default_execution_timeout_ms(),
            max_loop_iterations: default_max_loop_iterations(),
            max_operations: None,
            max_call_depth: None,
            max_body_bytes: default_max_body_bytes(),
            header_read_timeout_ms: default_header_read_timeout_ms(),
            keep_alive: default_keep_alive(),
            shared_state_policy: DefinePolicy::default(),
        }
    }
}

impl HostSettings {
    pub fn to_config(&self) -> HostConfig {
        let mut pool = PoolConfig::new(self.min_runspaces, self.max_runspaces);
        pool.acquire_timeout = self.acquire_timeout_ms.map(Duration::from_millis);

        HostConfig {
            bind: self.bind,
            pool,
            limits: ResourceLimits {
                execution_timeout: Duration::from_millis(self.execution_timeout_ms),
                max_loop_iterations: self.max_loop_iterations,
                max_operations: self.max_operations,
                max_call_depth: self.max_call_depth,
            },
            server: ServerOptions {
                max_body_bytes: self.max_body_bytes,
                header_read_timeout: Duration::from_millis(self.header_read_timeout_ms),
                keep_alive: self.keep_alive,
            },
            shared_state_policy: self.shared_state_policy,
        }
    }
}

/// API-key authentication settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiKeySettings {
    pub api_key: String,
    pub principal: String,
    #[serde(default)]
    pub claims: Vec<Claim>,
}

/// A handler given as inline code or a script file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerSpec {
    pub language: ScriptLanguage,
    #[serde(default)]
    pub code: Option<String>,
    /// Script path, relative to the manifest's directory
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub imports: Vec<String>,
    /// Module name to inline source
    #[serde(default)]
    pub references: BTreeMap<String, String>,
}

impl HandlerSpec {
    /// # Errors
    ///
    /// `Config` unless exactly one of `code` and `file` is set, `Io` if the
    /// file cannot be read.
    pub fn to_source(&self, base_dir: &Path) -> Result<HandlerSource> {
        let code = match (&self.code, &self.file) {
            (Some(code), None) => code.clone(),
            (None, Some(file)) => std::fs::read_to_string(base_dir.join(file)).map_err(|e| {
                KestrunError::Config(format!("Failed to read script '{}': {}", file.display(), e))
            })?,
            _ => {
                return Err(KestrunError::Config(
                    "A handler needs exactly one of 'code' or 'file'".into(),
                ))
            }
        };

        let options = CompileOptions {
            imports: self.imports.clone(),
            references: self.references.clone(),
        };
        HandlerSource::from_source(self.language, code, options)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSpec {
    pub pattern: String,
    #[serde(default = "default_methods")]
    pub methods: Vec<String>,
    #[serde(default)]
    pub policy: Option<String>,
    #[serde(flatten)]
    pub handler: HandlerSpec,
}

/// A complete host description loaded from JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostManifest {
    #[serde(default)]
    pub host: HostSettings,
    #[serde(default)]
    pub authentication: Option<ApiKeySettings>,
    #[serde(default)]
    pub policies: Vec<ClaimPolicy>,
    /// Initial shared state; every value must be an object, array or string
    #[serde(default)]
    pub shared_state: Map<String, Value>,
    #[serde(default)]
    pub middleware: Vec<HandlerSpec>,
    #[serde(default)]
    pub routes: Vec<RouteSpec>,
}

impl HostManifest {
    /// # Errors
    ///
    /// `Json` if the text is not a valid manifest.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// # Errors
    ///
    /// `Config` if the file cannot be read, `Json` if it is not a valid
    /// manifest.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| KestrunError::Config(format!("Failed to read manifest '{}': {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    /// Builds a host and registers everything the manifest describes.
    ///
    /// Scripts are compiled here, so a manifest with a broken script fails
    /// before the host starts.
    ///
    /// # Errors
    ///
    /// The first configuration, validation or compilation error.
    pub fn into_host(self, base_dir: &Path) -> Result<KestrunHost> {
        let mut host = KestrunHost::new(self.host.to_config())?;

        if let Some(auth) = &self.authentication {
            let authenticator = auth
                .claims
                .iter()
                .cloned()
                .fold(ApiKeyAuthenticator::new(&auth.api_key, &auth.principal), ApiKeyAuthenticator::with_claim);
            host.set_authenticator(Arc::new(authenticator));
        }

        for policy in self.policies {
            host.add_policy(policy);
        }

        for (name, value) in self.shared_state {
            host.shared_state().set_json(&name, value)?;
        }

        for spec in &self.middleware {
            host.use_middleware(spec.to_source(base_dir)?)?;
        }

        for spec in &self.routes {
            let mut route = RouteOptions::new(&spec.pattern, spec.handler.to_source(base_dir)?)
                .methods(spec.methods.iter().map(String::as_str));
            if let Some(policy) = &spec.policy {
                route = route.policy(policy);
            }
            host.map_route(route)
                .inspect_err(|e| tracing::error!(pattern = %spec.pattern, "Route registration failed: {}", e))?;
        }

        Ok(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        assert!(HostConfig::default().validate().is_ok());
        assert_eq!(HostConfig::default().bind.to_string(), DEFAULT_BIND);
    }

    #[test]
    fn test_invalid_config() {
        let mut config = HostConfig::default();
        config.server.max_body_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = HostConfig::default();
        config.pool = PoolConfig::new(4, 2);
        assert!(matches!(config.validate(), Err(KestrunError::Config(_))));

        let mut config = HostConfig::default();
        config.limits.execution_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_settings_defaults_and_conversion() {
        let manifest = HostManifest::from_json(
            r#"{ "host": { "bind": "0.0.0.0:8080", "max_runspaces": 3, "acquire_timeout_ms": 250,
                           "execution_timeout_ms": 1500, "shared_state_policy": "reject_duplicates" } }"#,
        )
        .unwrap();

        let config = manifest.host.to_config();
        assert_eq!(config.bind.port(), 8080);
        assert_eq!(config.pool.max_runspaces, 3);
        assert_eq!(config.pool.acquire_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.limits.execution_timeout, Duration::from_millis(1500));
        assert_eq!(config.limits.max_loop_iterations, ResourceLimits::default().max_loop_iterations);
        assert!(config.limits.max_loop_iterations.is_some());
        assert_eq!(config.server.max_body_bytes, DEFAULT_MAX_BODY_BYTES);
        assert_eq!(config.shared_state_policy, DefinePolicy::RejectDuplicates);
    }

    #[test]
    fn test_loop_limit_can_be_lifted() {
        let manifest = HostManifest::from_json(r#"{ "host": { "max_loop_iterations": null } }"#).unwrap();
        assert_eq!(manifest.host.to_config().limits.max_loop_iterations, None);
    }

    #[test]
    fn test_unknown_host_setting_is_rejected() {
        assert!(HostManifest::from_json(r#"{ "host": { "max_runspace": 3 } }"#).is_err());
    }

    #[test]
    fn test_route_spec_defaults_to_get() {
        let manifest = HostManifest::from_json(
            r#"{ "routes": [ { "pattern": "/x", "language": "js", "code": "1" } ] }"#,
        )
        .unwrap();
        assert_eq!(manifest.routes[0].methods, vec!["GET"]);
        assert_eq!(manifest.routes[0].handler.language, ScriptLanguage::JavaScript);
    }

    #[test]
    fn test_handler_needs_code_or_file() {
        let spec = HandlerSpec {
            language: ScriptLanguage::Rhai,
            code: None,
            file: None,
            imports: Vec::new(),
            references: BTreeMap::new(),
        };
        assert!(matches!(spec.to_source(Path::new(".")), Err(KestrunError::Config(_))));
    }

    #[test]
    fn test_handler_file_is_relative_to_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("hello.rhai")).unwrap();
        writeln!(file, "Response.write_text(\"hi\");").unwrap();

        let spec = HandlerSpec {
            language: ScriptLanguage::Rhai,
            code: None,
            file: Some(PathBuf::from("hello.rhai")),
            imports: Vec::new(),
            references: BTreeMap::new(),
        };
        match spec.to_source(dir.path()).unwrap() {
            HandlerSource::Compiled { code, .. } => assert!(code.contains("write_text")),
            other => panic!("expected compiled source, got {:?}", other),
        }
    }

    #[test]
    fn test_manifest_builds_host() {
        let manifest = HostManifest::from_json(
            r#"{
                "host": { "min_runspaces": 0, "max_runspaces": 1 },
                "authentication": { "api_key": "k", "principal": "ops" },
                "policies": [ { "name": "Admins", "rules": [ { "claim_type": "role", "allowed_values": ["admin"] } ] } ],
                "shared_state": { "Visits": { "Count": 0 } },
                "routes": [
                    { "pattern": "/a", "language": "JavaScript", "code": "Response.writeText('a');" },
                    { "pattern": "/b", "language": "rhai", "code": "Response.write_text(\"b\");", "policy": "Admins" }
                ]
            }"#,
        )
        .unwrap();

        let host = manifest.into_host(Path::new(".")).unwrap();
        assert_eq!(host.routes().len(), 2);
        assert!(host.shared_state().contains("visits"));
    }

    #[test]
    fn test_manifest_with_broken_script_fails() {
        let manifest = HostManifest::from_json(
            r#"{ "routes": [ { "pattern": "/bad", "language": "rhai", "code": "let = 1;" } ] }"#,
        )
        .unwrap();
        let err = manifest.into_host(Path::new(".")).err().unwrap();
        assert!(matches!(err, KestrunError::ScriptCompilation { .. }));
    }

    #[test]
    fn test_manifest_rejects_primitive_shared_state() {
        let manifest = HostManifest::from_json(r#"{ "shared_state": { "Count": 1 } }"#).unwrap();
        let err = manifest.into_host(Path::new(".")).err().unwrap();
        assert!(matches!(err, KestrunError::Validation(_)));
    }
}
