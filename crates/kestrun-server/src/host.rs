//! Kestrun host
//!
//! [`KestrunHost`] owns everything a request needs: configuration, the
//! runspace pool, shared state, routes, global middleware, authentication
//! and claim policies. Routes and middleware are registered before
//! [`KestrunHost::start`]; scripts are compiled at registration so broken
//! handlers never reach the request path.
//!
//! # Example
//!
//! ```no_run
//! use kestrun_server::{HandlerSource, HostConfig, KestrunHost, RouteOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> kestrun_common::Result<()> {
//! let mut host = KestrunHost::new(HostConfig::default())?;
//! host.map_route(RouteOptions::new(
//!     "/hello/{name}",
//!     HandlerSource::javascript("Response.writeJson({ Body: 'Hello ' + Request.RouteValues.name });"),
//! ))?;
//! host.start().await?;
//!
//! let response = host
//!     .handle(kestrun_common::RequestModel::new("GET", "/hello/World"), CancellationToken::new())
//!     .await;
//! assert_eq!(response.status(), 200);
//! host.shutdown();
//! # Ok(())
//! # }
//! ```

use hyper::StatusCode;
use kestrun_common::auth::{Authenticator, ClaimPolicy};
use kestrun_common::{KestrunError, RequestModel, ResponseModel, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::HostConfig;
use crate::context::{next_trace_id, KestrunContext};
use crate::languages::{build_delegate, Delegate, HandlerSource};
use crate::middleware::ScriptExecutionMiddleware;
use crate::router::{Route, RouteMatch, RoutePattern, RouteTable};
use crate::runtime::RunspacePool;
use crate::shared_state::SharedStateStore;

/// Registration options for a single route.
#[derive(Debug, Clone)]
pub struct RouteOptions {
    pattern: String,
    methods: Vec<String>,
    source: HandlerSource,
    policy: Option<String>,
}

impl RouteOptions {
    /// A `GET` route.
    pub fn new(pattern: impl Into<String>, source: HandlerSource) -> Self {
        Self {
            pattern: pattern.into(),
            methods: vec!["GET".to_string()],
            source,
            policy: None,
        }
    }

    /// Replaces the verb list. An empty list accepts any verb.
    pub fn methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.methods = methods.into_iter().map(Into::into).collect();
        self
    }

    /// Requires the named claim policy.
    pub fn policy(mut self, name: impl Into<String>) -> Self {
        self.policy = Some(name.into());
        self
    }
}

pub struct KestrunHost {
    config: HostConfig,
    shared_state: Arc<SharedStateStore>,
    routes: RouteTable,
    middleware: Vec<Arc<dyn Delegate>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    policies: HashMap<String, ClaimPolicy>,
    executor: Option<ScriptExecutionMiddleware>,
}

impl KestrunHost {
    /// # Errors
    ///
    /// `Config` if the configuration does not validate.
    pub fn new(config: HostConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared_state: Arc::new(SharedStateStore::with_policy(config.shared_state_policy)),
            config,
            routes: RouteTable::new(),
            middleware: Vec::new(),
            authenticator: None,
            policies: HashMap::new(),
            executor: None,
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn shared_state(&self) -> &Arc<SharedStateStore> {
        &self.shared_state
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// The pool, once the host has started.
    pub fn pool(&self) -> Option<&RunspacePool> {
        self.executor.as_ref().map(ScriptExecutionMiddleware::pool)
    }

    pub fn is_started(&self) -> bool {
        self.executor.is_some()
    }

    pub fn set_authenticator(&mut self, authenticator: Arc<dyn Authenticator>) {
        self.authenticator = Some(authenticator);
    }

    /// Registers a claim policy. Names are case-insensitive; a later
    /// policy with the same name replaces the earlier one.
    pub fn add_policy(&mut self, policy: ClaimPolicy) {
        tracing::debug!(policy = %policy.name, rules = policy.rules.len(), "Claim policy registered");
        self.policies.insert(policy.name.to_ascii_lowercase(), policy);
    }

    /// Appends a stage that runs before every route handler.
    ///
    /// # Errors
    ///
    /// `ScriptCompilation` or `Config` if the handler cannot be built.
    pub fn use_middleware(&mut self, source: HandlerSource) -> Result<()> {
        let delegate = build_delegate(source, &self.config.limits, &self.shared_state)?;
        tracing::debug!(language = %delegate.language(), stage = self.middleware.len(), "Middleware registered");
        self.middleware.push(delegate);
        Ok(())
    }

    /// Compiles the handler and adds the route.
    ///
    /// # Errors
    ///
    /// - `Config` for an invalid pattern, an unknown policy or a route that
    ///   conflicts with an existing one
    /// - `ScriptCompilation` if the script does not compile
    pub fn map_route(&mut self, options: RouteOptions) -> Result<()> {
        if let Some(policy) = &options.policy {
            if !self.policies.contains_key(&policy.to_ascii_lowercase()) {
                return Err(KestrunError::Config(format!(
                    "Route '{}' requires unknown policy '{}'",
                    options.pattern, policy
                )));
            }
        }

        let pattern = RoutePattern::parse(&options.pattern)?;
        let delegate = build_delegate(options.source, &self.config.limits, &self.shared_state)?;
        let mut route = Route::new(pattern, options.methods, delegate);
        if let Some(policy) = options.policy {
            route = route.with_policy(policy);
        }
        self.routes.add(route)
    }

    /// Creates the runspace pool, pre-warming `min_runspaces`.
    ///
    /// # Errors
    ///
    /// `Config` if already started, `RunspaceCreation` if pre-warming fails.
    pub async fn start(&mut self) -> Result<()> {
        if self.executor.is_some() {
            return Err(KestrunError::Config("Host is already started".into()));
        }

        let pool = RunspacePool::new(
            self.config.pool.clone(),
            self.config.limits.clone(),
            Arc::clone(&self.shared_state),
        )
        .await?;
        self.executor = Some(ScriptExecutionMiddleware::new(pool));

        tracing::info!(
            routes = self.routes.len(),
            middleware = self.middleware.len(),
            shared = self.shared_state.len(),
            "Kestrun host started"
        );
        Ok(())
    }

    /// Disposes the pool. Requests in flight finish; new ones get 503.
    pub fn shutdown(&self) {
        if let Some(executor) = &self.executor {
            executor.pool().dispose();
            tracing::info!("Kestrun host stopped");
        }
    }

    /// Runs one request through routing, authentication and the pipeline.
    ///
    /// Never fails: errors become a response with the matching status and
    /// a generic message, and the detail is logged.
    pub async fn handle(&self, request: RequestModel, cancellation: CancellationToken) -> ResponseModel {
        let trace_id = next_trace_id();
        let span = tracing::info_span!(
            "request",
            trace_id = %trace_id,
            method = %request.method(),
            path = %request.path()
        );

        async move {
            tracing::debug!("Request started");
            let started = Instant::now();

            let response = match self.dispatch(request, trace_id, cancellation).await {
                Ok(response) => response,
                Err(e) => error_response(&e),
            };

            tracing::info!(
                status = response.effective_status(),
                elapsed_ms = started.elapsed().as_millis(),
                "Request finished"
            );
            response
        }
        .instrument(span)
        .await
    }

    async fn dispatch(
        &self,
        request: RequestModel,
        trace_id: String,
        cancellation: CancellationToken,
    ) -> Result<ResponseModel> {
        let executor = self.executor.as_ref().ok_or(KestrunError::PoolDisposed)?;

        let (route, values) = match self.routes.find(request.method(), request.path()) {
            RouteMatch::Found { route, values } => (route, values),
            RouteMatch::MethodNotAllowed { allowed } => {
                let mut response = error_response(&KestrunError::MethodNotAllowed {
                    method: request.method().to_string(),
                    path: request.path().to_string(),
                });
                response.set_header("Allow", allowed.into_iter().collect::<Vec<_>>().join(", "));
                return Ok(response);
            }
            RouteMatch::NotFound => return Err(KestrunError::NotFound(request.path().to_string())),
        };

        let request = request.with_route_values(values);
        let principal = self
            .authenticator
            .as_ref()
            .and_then(|authenticator| authenticator.authenticate(&request));
        self.authorize(route, principal.as_ref())?;

        let mut ctx = KestrunContext::new(request, Arc::clone(&self.shared_state))
            .with_trace_id(trace_id)
            .with_principal(principal)
            .with_cancellation(cancellation);

        let stages: Arc<[Arc<dyn Delegate>]> = self
            .middleware
            .iter()
            .chain(std::iter::once(route.delegate()))
            .cloned()
            .collect();

        executor.run(&mut ctx, stages).await?;
        Ok(ctx.response)
    }

    fn authorize(&self, route: &Route, principal: Option<&kestrun_common::auth::Principal>) -> Result<()> {
        let Some(name) = route.policy() else {
            return Ok(());
        };
        let policy = self
            .policies
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| KestrunError::Config(format!("Unknown policy '{}'", name)))?;

        match principal {
            None => Err(KestrunError::Unauthorized),
            Some(principal) if policy.is_satisfied_by(principal) => Ok(()),
            Some(_) => Err(KestrunError::Forbidden(policy.name.clone())),
        }
    }
}

impl Drop for KestrunHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for KestrunHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KestrunHost")
            .field("bind", &self.config.bind)
            .field("routes", &self.routes.len())
            .field("middleware", &self.middleware.len())
            .field("policies", &self.policies.len())
            .field("started", &self.is_started())
            .finish()
    }
}

/// Generic response for a failed request. Detail stays in the log.
fn error_response(error: &KestrunError) -> ResponseModel {
    let status = error.status_code();
    if status.is_server_error() {
        tracing::error!(status = status.as_u16(), "Request failed: {}", error);
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        tracing::warn!(status = status.as_u16(), "Request rejected: {}", error);
    } else {
        tracing::debug!(status = status.as_u16(), "Request rejected: {}", error);
    }

    ResponseModel::with_status_text(status.as_u16(), status.canonical_reason().unwrap_or("Error"))
}
