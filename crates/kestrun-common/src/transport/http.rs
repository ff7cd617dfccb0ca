//! HTTP Transport Utilities
//!
//! Conversions between hyper requests/responses and the host's
//! [`RequestModel`] / [`ResponseModel`].
//!
//! # Components
//!
//! - **[`HttpTransport`]**: reads a hyper request into a [`RequestModel`] and
//!   renders a [`ResponseModel`] into a hyper response
//! - **[`HyperRequest`]** / **[`HyperResponse`]**: type aliases for the server
//!
//! # Example
//!
//! ```
//! use kestrun_common::model::ResponseModel;
//! use kestrun_common::transport::HttpTransport;
//!
//! let mut model = ResponseModel::new();
//! model.write_text("hello", None);
//! let response = HttpTransport::to_http_response(model);
//! assert_eq!(response.status(), 200);
//! ```

use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited, StreamBody};
use hyper::body::{Body, Frame, Incoming};
use hyper::header::{HeaderName, HeaderValue, CONTENT_DISPOSITION, CONTENT_TYPE, LOCATION};
use hyper::{Request, Response, StatusCode};
use std::net::SocketAddr;

use crate::error::{KestrunError, Result};
use crate::model::request::parse_multipart_form;
use crate::model::{mime, HeaderMap, RequestModel, ResponseBody, ResponseModel};

/// Type alias for Hyper incoming requests
pub type HyperRequest = Request<Incoming>;

/// Body type of every response the host sends.
pub type ResponseBodyType = UnsyncBoxBody<Bytes, std::io::Error>;

/// Type alias for Hyper responses produced by the host
pub type HyperResponse = Response<ResponseBodyType>;

/// HTTP transport utility functions
pub struct HttpTransport;

impl HttpTransport {
    /// Reads a transport request into a [`RequestModel`].
    ///
    /// The body is buffered completely (scripts need random access to it)
    /// and capped at `max_body_bytes`.
    ///
    /// # Errors
    ///
    /// - `PayloadTooLarge` if the body exceeds `max_body_bytes`
    /// - `Transport` if the body cannot be read or is malformed multipart
    pub async fn read_request<B>(
        req: Request<B>,
        remote_addr: Option<SocketAddr>,
        max_body_bytes: usize,
    ) -> Result<RequestModel>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = req.into_parts();

        let mut headers = HeaderMap::new();
        for (name, value) in parts.headers.iter() {
            headers.append(name.as_str(), &String::from_utf8_lossy(value.as_bytes()));
        }

        let body = Limited::new(body, max_body_bytes)
            .collect()
            .await
            .map_err(|e| {
                if e.downcast_ref::<LengthLimitError>().is_some() {
                    KestrunError::PayloadTooLarge(max_body_bytes)
                } else {
                    KestrunError::Transport(format!("Failed to read request body: {}", e))
                }
            })?
            .to_bytes();

        let multipart = headers
            .get("content-type")
            .filter(|content_type| mime::is_multipart_form(content_type))
            .map(str::to_string);

        let mut model = RequestModel::from_parts(
            parts.method.as_str(),
            parts.uri.path(),
            parts.uri.query(),
            headers,
            body.clone(),
        );
        if let Some(content_type) = multipart {
            model = model.with_form(parse_multipart_form(&content_type, body).await?);
        }

        Ok(match remote_addr {
            Some(addr) => model.with_remote_addr(addr),
            None => model,
        })
    }

    /// Renders a [`ResponseModel`] into a hyper response.
    ///
    /// Consumes the model, so a response can only be applied once. Text
    /// bodies with a text-based content type get `charset=utf-8` appended;
    /// redirects set `Location`; a non-`None` content disposition sets
    /// `Content-Disposition`. Header values that are not valid HTTP are
    /// dropped with a warning.
    pub fn to_http_response(mut model: ResponseModel) -> HyperResponse {
        let status = StatusCode::from_u16(model.effective_status()).unwrap_or_else(|_| {
            tracing::warn!("Invalid status code {}, sending 500", model.effective_status());
            StatusCode::INTERNAL_SERVER_ERROR
        });

        let body = model.take_body();
        let mut response = Response::new(Self::empty());
        *response.status_mut() = status;

        {
            let headers = response.headers_mut();
            for (name, value) in model.headers().iter() {
                match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                    (Ok(name), Ok(value)) => {
                        headers.insert(name, value);
                    }
                    _ => tracing::warn!("Dropping invalid response header '{}'", name),
                }
            }

            if let Some(content_type) = model.content_type() {
                let content_type = match body {
                    ResponseBody::Text(_) => mime::with_utf8_charset(content_type),
                    _ => content_type.to_string(),
                };
                if let Ok(value) = HeaderValue::from_str(&content_type) {
                    headers.insert(CONTENT_TYPE, value);
                }
            }

            if let Some(redirect) = model.redirect() {
                match HeaderValue::from_str(&redirect.url) {
                    Ok(value) => {
                        headers.insert(LOCATION, value);
                    }
                    Err(_) => tracing::warn!("Dropping invalid redirect URL '{}'", redirect.url),
                }
            }

            if let Some(disposition) = model.content_disposition().header_value() {
                if let Ok(value) = HeaderValue::from_str(&disposition) {
                    headers.insert(CONTENT_DISPOSITION, value);
                }
            }
        }

        *response.body_mut() = match body {
            ResponseBody::Absent => Self::empty(),
            ResponseBody::Text(text) => Self::full(Bytes::from(text)),
            ResponseBody::Binary(bytes) => Self::full(bytes),
            ResponseBody::Stream(stream) => {
                StreamBody::new(stream.map_ok(Frame::data)).boxed_unsync()
            }
        };

        response
    }

    /// Plain-text error response with a generic message.
    pub fn error_response(status: StatusCode) -> HyperResponse {
        let message = status.canonical_reason().unwrap_or("Error");
        let model = ResponseModel::with_status_text(status.as_u16(), message);
        Self::to_http_response(model)
    }

    fn full(bytes: Bytes) -> ResponseBodyType {
        Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
    }

    fn empty() -> ResponseBodyType {
        Self::full(Bytes::new())
    }
}
