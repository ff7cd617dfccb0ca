//! Kestrun Transport Layer
//!
//! The host speaks HTTP/1.1 through hyper. This module holds the
//! transport-facing conversions only; the accept loop lives in the server
//! crate.
//!
//! # Components
//!
//! - **[`HttpTransport`]**: hyper request → [`crate::model::RequestModel`],
//!   [`crate::model::ResponseModel`] → hyper response
//! - **[`HyperRequest`]** / **[`HyperResponse`]**: aliases shared with the server

pub mod http;

pub use http::{HttpTransport, HyperRequest, HyperResponse, ResponseBodyType};
