//! Language-agnostic request/response model.
//!
//! [`RequestModel`] is captured once per request before any handler runs;
//! [`ResponseModel`] is the scratch object handlers write into and the
//! transport renders at the end of the pipeline.

pub mod mime;
pub mod request;
pub mod response;

#[cfg(test)]
mod tests;

pub use request::{HeaderMap, RequestModel};
pub use response::{
    BodyStream, ContentDisposition, DispositionType, Redirect, ResponseBody, ResponseModel,
    ScriptBody, ScriptResponseState,
};
