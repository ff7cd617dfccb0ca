//! Request-scoped context
//!
//! One [`KestrunContext`] exists per request. It carries the read-only
//! request, the response being accumulated, the authenticated principal and
//! an `items` scratch map that pipeline stages use to pass data along.

use kestrun_common::auth::Principal;
use kestrun_common::{RequestModel, ResponseModel};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::shared_state::SharedStateStore;

static NEXT_TRACE_ID: AtomicU64 = AtomicU64::new(1);

/// Generates a process-unique trace identifier such as `0000002a:00000001`.
pub fn next_trace_id() -> String {
    let sequence = NEXT_TRACE_ID.fetch_add(1, Ordering::Relaxed);
    format!("{:08x}:{:08x}", std::process::id(), sequence)
}

pub struct KestrunContext {
    pub trace_id: String,
    pub request: Arc<RequestModel>,
    pub response: ResponseModel,
    pub principal: Option<Principal>,
    pub items: Map<String, Value>,
    pub cancellation: CancellationToken,
    pub shared_state: Arc<SharedStateStore>,
}

impl KestrunContext {
    pub fn new(request: RequestModel, shared_state: Arc<SharedStateStore>) -> Self {
        Self {
            trace_id: next_trace_id(),
            request: Arc::new(request),
            response: ResponseModel::new(),
            principal: None,
            items: Map::new(),
            cancellation: CancellationToken::new(),
            shared_state,
        }
    }

    pub fn with_principal(mut self, principal: Option<Principal>) -> Self {
        self.principal = principal;
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.principal.is_some()
    }

    /// The `User` object scripts see.
    pub fn user_value(&self) -> Value {
        match &self.principal {
            Some(principal) => json!({
                "Name": principal.name(),
                "IsAuthenticated": true,
                "Claims": principal.claims(),
            }),
            None => json!({
                "Name": Value::Null,
                "IsAuthenticated": false,
                "Claims": [],
            }),
        }
    }

    /// The `Context` object scripts see, minus its methods.
    pub fn to_script_value(&self) -> Value {
        json!({
            "TraceIdentifier": self.trace_id,
            "User": self.user_value(),
            "Items": Value::Object(self.items.clone()),
        })
    }
}

impl std::fmt::Debug for KestrunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KestrunContext")
            .field("trace_id", &self.trace_id)
            .field("method", &self.request.method())
            .field("path", &self.request.path())
            .field("principal", &self.principal.as_ref().map(Principal::name))
            .field("items", &self.items.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrun_common::auth::Claim;

    fn context() -> KestrunContext {
        KestrunContext::new(RequestModel::new("GET", "/"), Arc::new(SharedStateStore::new()))
    }

    #[test]
    fn test_trace_ids_are_unique() {
        let a = context();
        let b = context();
        assert_ne!(a.trace_id, b.trace_id);
    }

    #[test]
    fn test_anonymous_script_view() {
        let ctx = context();
        let view = ctx.to_script_value();
        assert_eq!(view["User"]["IsAuthenticated"], json!(false));
        assert_eq!(view["User"]["Name"], Value::Null);
        assert_eq!(view["TraceIdentifier"], json!(ctx.trace_id));
    }

    #[test]
    fn test_authenticated_script_view() {
        let principal = Principal::new("alice").with_claim(Claim::new("role", "admin"));
        let mut ctx = context().with_principal(Some(principal));
        ctx.items.insert("step".into(), json!(1));

        let view = ctx.to_script_value();
        assert_eq!(view["User"]["Name"], json!("alice"));
        assert_eq!(view["User"]["Claims"][0]["Type"], json!("role"));
        assert_eq!(view["User"]["Claims"][0]["Value"], json!("admin"));
        assert_eq!(view["Items"]["step"], json!(1));
        assert!(ctx.is_authenticated());
    }
}
