use bytes::Bytes;
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;

use crate::error::{KestrunError, Result};
use crate::model::mime;

/// Case-insensitive header mapping with one string value per name.
///
/// Names are stored lowercased; repeated headers are joined with `", "`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct HeaderMap(BTreeMap<String, String>);

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a value, joining it onto an existing value for the same name.
    pub fn append(&mut self, name: &str, value: &str) {
        self.0
            .entry(name.to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    /// Sets a value, replacing any previous value for the same name.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.0.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(&name.to_ascii_lowercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_ascii_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: AsRef<str>, V: AsRef<str>> FromIterator<(K, V)> for HeaderMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = HeaderMap::new();
        for (name, value) in iter {
            headers.append(name.as_ref(), value.as_ref());
        }
        headers
    }
}

/// Snapshot of an inbound HTTP request.
///
/// Built once per request before any script runs and shared read-only
/// afterwards. Serializes with PascalCase field names, which is the shape
/// scripts see as their `Request` variable.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestModel {
    method: String,
    path: String,
    query: BTreeMap<String, String>,
    headers: HeaderMap,
    body: String,
    #[serde(skip)]
    raw_body: Bytes,
    form: Option<BTreeMap<String, String>>,
    route_values: BTreeMap<String, String>,
    remote_addr: Option<String>,
}

impl RequestModel {
    /// Builds the model from transport-level parts.
    ///
    /// The query string is parsed with last-value-wins semantics. The body
    /// is decoded as UTF-8 (lossily) and, when the content type is
    /// url-encoded, parsed into the form mapping. Multipart forms are
    /// attached afterwards with [`with_form`](Self::with_form).
    pub fn from_parts(
        method: impl Into<String>,
        path: impl Into<String>,
        query_string: Option<&str>,
        headers: HeaderMap,
        body: Bytes,
    ) -> Self {
        let query = query_string.map(parse_query).unwrap_or_default();
        let form = headers
            .get("content-type")
            .and_then(|content_type| parse_form(content_type, &body));
        let text = String::from_utf8_lossy(&body).into_owned();

        Self {
            method: method.into().to_ascii_uppercase(),
            path: path.into(),
            query,
            headers,
            body: text,
            raw_body: body,
            form,
            route_values: BTreeMap::new(),
            remote_addr: None,
        }
    }

    /// Convenience constructor for a bodiless request.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self::from_parts(method, path, None, HeaderMap::new(), Bytes::new())
    }

    pub fn with_route_values(mut self, values: BTreeMap<String, String>) -> Self {
        self.route_values = values;
        self
    }

    pub fn with_form(mut self, form: BTreeMap<String, String>) -> Self {
        self.form = Some(form);
        self
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr.to_string());
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &BTreeMap<String, String> {
        &self.query
    }

    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn raw_body(&self) -> &Bytes {
        &self.raw_body
    }

    pub fn form(&self) -> Option<&BTreeMap<String, String>> {
        self.form.as_ref()
    }

    pub fn route_values(&self) -> &BTreeMap<String, String> {
        &self.route_values
    }

    pub fn route_value(&self, name: &str) -> Option<&str> {
        self.route_values.get(name).map(String::as_str)
    }

    pub fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    /// JSON view handed to scripts.
    pub fn to_script_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Parses a query string; repeated keys keep the last value.
pub fn parse_query(query: &str) -> BTreeMap<String, String> {
    url::form_urlencoded::parse(query.trim_start_matches('?').as_bytes())
        .into_owned()
        .collect()
}

/// Parses an `application/x-www-form-urlencoded` body.
///
/// Repeated field values are joined with `,` in the order they appear.
/// Returns `None` for any other content type; multipart bodies go through
/// [`parse_multipart_form`].
pub fn parse_form(content_type: &str, body: &[u8]) -> Option<BTreeMap<String, String>> {
    if !mime::is_url_encoded_form(content_type) {
        return None;
    }
    Some(join_repeated(url::form_urlencoded::parse(body).into_owned().collect()))
}

/// Extracts the text fields of a buffered `multipart/form-data` body.
///
/// A part whose `Content-Disposition` carries `filename` or `filename*` is
/// an upload and is skipped, as is a part without a field name. Repeated
/// names are joined with `,`.
///
/// # Errors
///
/// Returns `Transport` if the boundary is missing or the body is not
/// well-formed multipart.
pub async fn parse_multipart_form(content_type: &str, body: Bytes) -> Result<BTreeMap<String, String>> {
    let boundary = multer::parse_boundary(content_type)
        .map_err(|e| KestrunError::Transport(format!("Invalid multipart content type: {}", e)))?;
    let mut multipart = multer::Multipart::new(
        futures_util::stream::once(async move { Ok::<_, Infallible>(body) }),
        boundary,
    );

    let mut pairs = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(malformed_multipart)? {
        let params = field
            .headers()
            .get("content-disposition")
            .and_then(|value| value.to_str().ok())
            .map(mime::parameters)
            .unwrap_or_default();

        if params.iter().any(|(key, _)| key == "filename" || key == "filename*") {
            continue;
        }
        let Some(name) = params.into_iter().find_map(|(key, value)| (key == "name").then_some(value)) else {
            continue;
        };

        let value = field.text().await.map_err(malformed_multipart)?;
        pairs.push((name, value));
    }

    Ok(join_repeated(pairs))
}

fn malformed_multipart(e: multer::Error) -> KestrunError {
    KestrunError::Transport(format!("Malformed multipart body: {}", e))
}

fn join_repeated(pairs: Vec<(String, String)>) -> BTreeMap<String, String> {
    let mut form: BTreeMap<String, String> = BTreeMap::new();
    for (key, value) in pairs {
        form.entry(key)
            .and_modify(|existing| {
                existing.push(',');
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    form
}
