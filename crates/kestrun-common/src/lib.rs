//! Kestrun Common Types and Transport
//!
//! This crate provides the request/response model, the error taxonomy and
//! the HTTP transport conversions shared by the Kestrun host and CLI.
//!
//! # Overview
//!
//! Kestrun is an embeddable HTTP host that runs caller-supplied script
//! snippets (JavaScript, Rhai) and native Rust handlers against one shared
//! request/response contract. This crate holds the pieces every other crate
//! depends on:
//!
//! - **Model**: [`RequestModel`] captured once per request, [`ResponseModel`]
//!   mutated by the handler and rendered once
//! - **Errors**: [`KestrunError`] and its HTTP status mapping
//! - **Auth**: principals, claim policies and the [`auth::Authenticator`] seam
//! - **Transport**: hyper request/response conversions
//!
//! # Example
//!
//! ```
//! use kestrun_common::{RequestModel, ResponseModel};
//! use serde_json::json;
//!
//! let request = RequestModel::new("GET", "/hello");
//! let mut response = ResponseModel::new();
//! response.write_json(&json!({"Body": format!("Hello from {}", request.path())}));
//! assert_eq!(response.content_type(), Some("application/json"));
//! ```

pub mod auth;
pub mod error;
pub mod model;
pub mod transport;

pub use error::{Diagnostic, KestrunError, Result, Severity};
pub use model::{RequestModel, ResponseModel};
