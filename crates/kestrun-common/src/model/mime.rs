//! MIME type helpers.
//!
//! Text-based content types get a `charset=utf-8` parameter when the host
//! writes a text body; everything else is treated as opaque bytes.

/// Default content type for text bodies.
pub const TEXT_PLAIN: &str = "text/plain";

/// Default content type for JSON bodies.
pub const APPLICATION_JSON: &str = "application/json";

/// Default content type for binary bodies.
pub const APPLICATION_OCTET_STREAM: &str = "application/octet-stream";

const TEXT_APPLICATION_TYPES: &[&str] = &[
    "application/json",
    "application/xml",
    "application/yaml",
    "application/x-yaml",
    "application/javascript",
    "application/x-javascript",
    "application/ecmascript",
    "application/x-www-form-urlencoded",
    "application/graphql",
    "application/sql",
    "application/csv",
];

const TEXT_SUFFIXES: &[&str] = &["+json", "+xml", "+yaml"];

/// Returns the media type with parameters stripped, trimmed and lowercased.
pub fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Classifies whether a content type carries text.
///
/// `text/*`, the common structured-text application types and any
/// `+json`/`+xml`/`+yaml` suffixed type are text; everything else is binary.
pub fn is_text_based(content_type: &str) -> bool {
    let media = essence(content_type);
    if media.is_empty() {
        return false;
    }

    media.starts_with("text/")
        || TEXT_APPLICATION_TYPES.contains(&media.as_str())
        || TEXT_SUFFIXES.iter().any(|suffix| media.ends_with(suffix))
}

/// Returns true if the content type already declares a charset parameter.
pub fn has_charset(content_type: &str) -> bool {
    content_type
        .split(';')
        .skip(1)
        .any(|param| param.trim().to_ascii_lowercase().starts_with("charset="))
}

/// Appends `; charset=utf-8` to text-based types lacking a charset.
pub fn with_utf8_charset(content_type: &str) -> String {
    if is_text_based(content_type) && !has_charset(content_type) {
        format!("{}; charset=utf-8", content_type.trim_end())
    } else {
        content_type.to_string()
    }
}

/// True for `application/x-www-form-urlencoded`.
pub fn is_url_encoded_form(content_type: &str) -> bool {
    essence(content_type) == "application/x-www-form-urlencoded"
}

/// True for `multipart/form-data`.
pub fn is_multipart_form(content_type: &str) -> bool {
    essence(content_type) == "multipart/form-data"
}

/// Extracts a named parameter (e.g. `boundary`) from a header value.
pub fn parameter(header_value: &str, name: &str) -> Option<String> {
    let name = name.to_ascii_lowercase();
    parameters(header_value)
        .into_iter()
        .find_map(|(key, value)| (key == name).then_some(value))
}

/// Splits the `; key=value` parameters that follow the first token of a
/// header such as `Content-Type` or `Content-Disposition`.
///
/// Keys are lowercased. Quoted values may contain `;` and backslash
/// escapes. A key without `=` gets an empty value.
pub fn parameters(header_value: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let Some((_, mut rest)) = header_value.split_once(';') else {
        return params;
    };

    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }

        let key_end = rest.find(['=', ';']).unwrap_or(rest.len());
        let key = rest[..key_end].trim().to_ascii_lowercase();
        rest = &rest[key_end..];

        let mut value = String::new();
        if let Some(after_eq) = rest.strip_prefix('=') {
            let after_eq = after_eq.trim_start();
            if let Some(quoted) = after_eq.strip_prefix('"') {
                let mut consumed = quoted.len();
                let mut chars = quoted.char_indices();
                while let Some((i, c)) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some((_, escaped)) = chars.next() {
                                value.push(escaped);
                            }
                        }
                        '"' => {
                            consumed = i + 1;
                            break;
                        }
                        _ => value.push(c),
                    }
                }
                let tail = &quoted[consumed..];
                rest = tail.split_once(';').map_or("", |(_, next)| next);
            } else {
                let end = after_eq.find(';').unwrap_or(after_eq.len());
                value = after_eq[..end].trim_end().to_string();
                rest = after_eq.get(end + 1..).unwrap_or("");
            }
        } else {
            rest = rest.strip_prefix(';').unwrap_or(rest);
        }

        if !key.is_empty() {
            params.push((key, value));
        }
    }

    params
}
