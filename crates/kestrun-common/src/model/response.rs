use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::model::mime;
use crate::model::request::HeaderMap;

/// Streamed response body.
pub type BodyStream = BoxStream<'static, std::io::Result<Bytes>>;

/// The response body. Exactly one representation is held at a time.
#[derive(Default)]
pub enum ResponseBody {
    #[default]
    Absent,
    Text(String),
    Binary(Bytes),
    Stream(BodyStream),
}

impl ResponseBody {
    pub fn kind(&self) -> &'static str {
        match self {
            ResponseBody::Absent => "absent",
            ResponseBody::Text(_) => "text",
            ResponseBody::Binary(_) => "binary",
            ResponseBody::Stream(_) => "stream",
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, ResponseBody::Absent)
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Absent => write!(f, "Absent"),
            ResponseBody::Text(text) => f.debug_tuple("Text").field(text).finish(),
            ResponseBody::Binary(bytes) => write!(f, "Binary({} bytes)", bytes.len()),
            ResponseBody::Stream(_) => write!(f, "Stream(..)"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispositionType {
    #[default]
    None,
    Inline,
    Attachment,
}

impl DispositionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispositionType::None => "none",
            DispositionType::Inline => "inline",
            DispositionType::Attachment => "attachment",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentDisposition {
    #[serde(default)]
    pub kind: DispositionType,
    #[serde(default)]
    pub file_name: Option<String>,
}

impl ContentDisposition {
    pub fn new(kind: DispositionType, file_name: Option<String>) -> Self {
        Self { kind, file_name }
    }

    /// Renders the `Content-Disposition` header value, or `None` for
    /// [`DispositionType::None`]. File names are percent-encoded.
    pub fn header_value(&self) -> Option<String> {
        if self.kind == DispositionType::None {
            return None;
        }

        Some(match self.file_name.as_deref() {
            Some(name) if !name.is_empty() => {
                format!("{}; filename=\"{}\"", self.kind.as_str(), urlencoding::encode(name))
            }
            _ => self.kind.as_str().to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redirect {
    pub url: String,
    #[serde(default = "Redirect::default_status")]
    pub status: u16,
}

impl Redirect {
    fn default_status() -> u16 {
        302
    }
}

/// Mutable response accumulated by whichever handler runs.
///
/// Rendered to the transport exactly once, at the end of the pipeline.
#[derive(Debug)]
pub struct ResponseModel {
    status: u16,
    content_type: Option<String>,
    body: ResponseBody,
    headers: HeaderMap,
    redirect: Option<Redirect>,
    content_disposition: ContentDisposition,
}

impl Default for ResponseModel {
    fn default() -> Self {
        Self {
            status: 200,
            content_type: None,
            body: ResponseBody::Absent,
            headers: HeaderMap::new(),
            redirect: None,
            content_disposition: ContentDisposition::default(),
        }
    }
}

impl ResponseModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for a plain-text response with the given status.
    pub fn with_status_text(status: u16, text: impl Into<String>) -> Self {
        let mut response = Self::new();
        response.write_text(text, None);
        response.set_status(status);
        response
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.content_type = Some(content_type.into());
    }

    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    pub fn redirect(&self) -> Option<&Redirect> {
        self.redirect.as_ref()
    }

    pub fn content_disposition(&self) -> &ContentDisposition {
        &self.content_disposition
    }

    pub fn set_content_disposition(&mut self, disposition: ContentDisposition) {
        self.content_disposition = disposition;
    }

    pub fn write_text(&mut self, text: impl Into<String>, content_type: Option<&str>) {
        self.body = ResponseBody::Text(text.into());
        self.content_type = Some(content_type.unwrap_or(mime::TEXT_PLAIN).to_string());
    }

    pub fn write_json(&mut self, value: &serde_json::Value) {
        self.body = ResponseBody::Text(value.to_string());
        self.content_type = Some(mime::APPLICATION_JSON.to_string());
    }

    pub fn write_binary(&mut self, bytes: impl Into<Bytes>, content_type: Option<&str>) {
        self.body = ResponseBody::Binary(bytes.into());
        self.content_type = Some(content_type.unwrap_or(mime::APPLICATION_OCTET_STREAM).to_string());
    }

    pub fn write_stream(&mut self, stream: BodyStream, content_type: Option<&str>) {
        self.body = ResponseBody::Stream(stream);
        self.content_type = Some(content_type.unwrap_or(mime::APPLICATION_OCTET_STREAM).to_string());
    }

    /// Marks the response as a redirect. The body may carry a message but
    /// the redirect takes effect without one.
    pub fn write_redirect(&mut self, url: impl Into<String>, status: Option<u16>, message: Option<&str>) {
        self.redirect = Some(Redirect {
            url: url.into(),
            status: status.unwrap_or(302),
        });
        match message {
            Some(message) => self.write_text(message, None),
            None => self.clear_body(),
        }
    }

    pub fn clear_body(&mut self) {
        self.body = ResponseBody::Absent;
    }

    /// Takes the body out, leaving [`ResponseBody::Absent`].
    pub fn take_body(&mut self) -> ResponseBody {
        std::mem::take(&mut self.body)
    }

    /// The status actually sent: the redirect status when redirecting.
    pub fn effective_status(&self) -> u16 {
        self.redirect.as_ref().map_or(self.status, |r| r.status)
    }

    /// Serializable state handed to a script as its `Response` object.
    pub fn to_script_state(&self) -> ScriptResponseState {
        let body = match &self.body {
            ResponseBody::Absent => None,
            ResponseBody::Text(text) => Some(ScriptBody::Text { text: text.clone() }),
            ResponseBody::Binary(bytes) => Some(ScriptBody::Binary { bytes: bytes.to_vec() }),
            ResponseBody::Stream(_) => Some(ScriptBody::Stream),
        };

        ScriptResponseState {
            status: self.status,
            content_type: self.content_type.clone(),
            headers: self.headers.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            body,
            redirect: self.redirect.clone(),
            content_disposition: Some(self.content_disposition.clone()),
        }
    }

    /// Applies the state a script left behind. A `Stream` body marker keeps
    /// the stream already held; any other body replaces it.
    pub fn apply_script_state(&mut self, state: ScriptResponseState) {
        self.status = state.status;
        self.content_type = state.content_type;
        self.headers = state.headers.iter().collect();
        self.redirect = state.redirect;
        self.content_disposition = state.content_disposition.unwrap_or_default();

        match state.body {
            None => self.body = ResponseBody::Absent,
            Some(ScriptBody::Text { text }) => self.body = ResponseBody::Text(text),
            Some(ScriptBody::Binary { bytes }) => self.body = ResponseBody::Binary(Bytes::from(bytes)),
            Some(ScriptBody::Stream) => {}
        }
    }
}

/// Body as seen by scripts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ScriptBody {
    Text { text: String },
    Binary { bytes: Vec<u8> },
    Stream,
}

/// Plain-data form of [`ResponseModel`] exchanged with script engines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptResponseState {
    #[serde(default = "ScriptResponseState::default_status")]
    pub status: u16,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<ScriptBody>,
    #[serde(default)]
    pub redirect: Option<Redirect>,
    #[serde(default)]
    pub content_disposition: Option<ContentDisposition>,
}

impl ScriptResponseState {
    fn default_status() -> u16 {
        200
    }
}

impl Default for ScriptResponseState {
    fn default() -> Self {
        ResponseModel::default().to_script_state()
    }
}
