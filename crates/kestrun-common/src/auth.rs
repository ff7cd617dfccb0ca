//! Authentication and claim policies
//!
//! The host never validates credentials inside its script pipeline. An
//! [`Authenticator`] runs first and yields an optional [`Principal`]; routes
//! that name a [`ClaimPolicy`] are then gated on the principal's claims.
//!
//! # Built-in authenticator
//!
//! [`ApiKeyAuthenticator`] reads the `X-API-Key` header and compares it in
//! constant time against the configured key. A match produces a principal
//! carrying the configured claims.
//!
//! # Example
//!
//! ```
//! use kestrun_common::auth::{ApiKeyAuthenticator, Authenticator, Claim, ClaimPolicy};
//! use kestrun_common::model::{HeaderMap, RequestModel};
//! use bytes::Bytes;
//!
//! let auth = ApiKeyAuthenticator::new("secret", "service")
//!     .with_claim(Claim::new("role", "admin"));
//!
//! let headers: HeaderMap = [("X-API-Key", "secret")].into_iter().collect();
//! let request = RequestModel::from_parts("GET", "/", None, headers, Bytes::new());
//! let principal = auth.authenticate(&request).unwrap();
//!
//! let admins = ClaimPolicy::new("Admins").require("role", ["admin"]);
//! assert!(admins.is_satisfied_by(&principal));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::RequestModel;

/// Header carrying the shared API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Claim type the API-key authenticator uses for the principal name.
pub const NAME_CLAIM: &str = "name";

/// A single claim attached to a principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    #[serde(rename = "Type")]
    pub claim_type: String,
    #[serde(rename = "Value")]
    pub value: String,
}

impl Claim {
    pub fn new(claim_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            claim_type: claim_type.into(),
            value: value.into(),
        }
    }
}

/// An authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    name: String,
    claims: Vec<Claim>,
}

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            claims: Vec::new(),
        }
    }

    pub fn with_claim(mut self, claim: Claim) -> Self {
        self.claims.push(claim);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn claims(&self) -> &[Claim] {
        &self.claims
    }

    /// Values of every claim of the given type. Claim types compare
    /// case-insensitively.
    pub fn claim_values<'a>(&'a self, claim_type: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.claims
            .iter()
            .filter(move |c| c.claim_type.eq_ignore_ascii_case(claim_type))
            .map(|c| c.value.as_str())
    }
}

/// One rule of a policy: the principal must carry `claim_type` with one of
/// `allowed_values`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRule {
    pub claim_type: String,
    pub allowed_values: Vec<String>,
}

impl ClaimRule {
    pub fn is_satisfied_by(&self, principal: &Principal) -> bool {
        principal
            .claim_values(&self.claim_type)
            .any(|value| self.allowed_values.iter().any(|allowed| allowed == value))
    }
}

/// Named set of claim rules. All rules must hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimPolicy {
    pub name: String,
    #[serde(default)]
    pub rules: Vec<ClaimRule>,
}

impl ClaimPolicy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rules: Vec::new(),
        }
    }

    /// Adds a rule requiring `claim_type` with any of `allowed_values`.
    pub fn require<I, S>(mut self, claim_type: impl Into<String>, allowed_values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rules.push(ClaimRule {
            claim_type: claim_type.into(),
            allowed_values: allowed_values.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn is_satisfied_by(&self, principal: &Principal) -> bool {
        self.rules.iter().all(|rule| rule.is_satisfied_by(principal))
    }
}

/// Supplies the principal for a request before the script pipeline runs.
///
/// Returning `None` means anonymous; it is up to the route's policy whether
/// that is acceptable.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, request: &RequestModel) -> Option<Principal>;
}

/// API-key authentication via the `X-API-Key` header.
#[derive(Clone)]
pub struct ApiKeyAuthenticator {
    api_key: String,
    principal_name: String,
    claims: Vec<Claim>,
}

impl ApiKeyAuthenticator {
    pub fn new(api_key: impl Into<String>, principal_name: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            principal_name: principal_name.into(),
            claims: Vec::new(),
        }
    }

    /// Adds a claim granted to every caller presenting the key.
    pub fn with_claim(mut self, claim: Claim) -> Self {
        self.claims.push(claim);
        self
    }

    /// Validates an API key against the configured key in constant time.
    pub fn validate_api_key(&self, provided_key: &str) -> bool {
        constant_time_eq(&self.api_key, provided_key)
    }
}

impl Authenticator for ApiKeyAuthenticator {
    fn authenticate(&self, request: &RequestModel) -> Option<Principal> {
        let provided = request.header(API_KEY_HEADER)?;
        if !self.validate_api_key(provided) {
            tracing::debug!("Rejected API key for {} {}", request.method(), request.path());
            return None;
        }

        let principal = Principal::new(&self.principal_name)
            .with_claim(Claim::new(NAME_CLAIM, &self.principal_name));
        Some(self.claims.iter().cloned().fold(principal, Principal::with_claim))
    }
}

impl fmt::Debug for ApiKeyAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeyAuthenticator")
            .field("api_key", &"*****")
            .field("principal_name", &self.principal_name)
            .field("claims", &self.claims)
            .finish()
    }
}

/// Performs constant-time string comparison to prevent timing attacks.
///
/// Always walks the whole input regardless of where the first difference
/// occurs. Only the length is leaked.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (byte_a, byte_b) in a.bytes().zip(b.bytes()) {
        result |= byte_a ^ byte_b;
    }

    result == 0
}
