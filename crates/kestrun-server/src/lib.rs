//! Kestrun Server
//!
//! Runs caller-supplied request handlers behind an HTTP/1.1 front end.
//! Handlers are JavaScript snippets interpreted by the Boa engine inside a
//! pooled runspace, Rhai scripts compiled at registration, or native Rust
//! closures. All of them see the same request/response model and the same
//! process-wide shared state.
//!
//! # Components
//!
//! - **[`RunspacePool`]**: bounded pool of JavaScript runspaces, one OS
//!   thread each
//! - **[`ScriptExecutionMiddleware`]**: acquires a runspace per stage and
//!   chains stages through [`Next`]
//! - **[`languages`]**: the delegate builders for each language
//! - **[`SharedStateStore`]**: named values visible to every handler
//! - **[`KestrunHost`]**: routes, authentication, policies and dispatch
//! - **[`HttpServer`]**: the hyper server loop
//!
//! # Example
//!
//! ```no_run
//! use kestrun_server::{HandlerSource, HostConfig, HttpServer, KestrunHost, RouteOptions};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> kestrun_common::Result<()> {
//! let mut host = KestrunHost::new(HostConfig::default())?;
//! host.shared_state().set_json("Visits", serde_json::json!({ "Count": 0 }))?;
//! host.map_route(RouteOptions::new(
//!     "/visit",
//!     HandlerSource::rhai(r#"Response.write_text(`${shared_increment("Visits", "Count", 1)}`);"#),
//! ))?;
//! host.start().await?;
//!
//! HttpServer::new(Arc::new(host))
//!     .run("127.0.0.1:5000".parse().unwrap(), CancellationToken::new())
//!     .await
//! # }
//! ```

pub mod config;
pub mod context;
pub mod host;
pub mod http_server;
pub mod languages;
pub mod middleware;
pub mod resource_limits;
pub mod router;
pub mod runtime;
pub mod shared_state;

pub use config::{HostConfig, HostManifest, ServerOptions};
pub use context::KestrunContext;
pub use host::{KestrunHost, RouteOptions};
pub use http_server::HttpServer;
pub use languages::{CompileOptions, Delegate, HandlerSource, ScriptLanguage};
pub use middleware::{Next, ScriptExecutionMiddleware};
pub use resource_limits::ResourceLimits;
pub use router::{Route, RoutePattern, RouteTable};
pub use runtime::{PoolConfig, RunspaceLease, RunspacePool};
pub use shared_state::{DefinePolicy, SharedStateStore, SharedValue};
