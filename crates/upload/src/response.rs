//! Interpretation of the service's response body.

use serde::Deserialize;

use crate::error::UploadError;

/// Error bodies longer than this are cut before being reported.
pub const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Deserialize)]
struct JsonDescriptor {
    url: String,
}

/// Extracts the retrieval URL from a successful response.
///
/// The reference service answers with the URL as plain text. A JSON
/// object with a `url` field is also accepted, and a redirect with an
/// empty body falls back to its `Location`.
pub fn parse_descriptor(body: &str, location: Option<&str>) -> Result<String, UploadError> {
    let text = body.trim();

    let candidate = if text.starts_with('{') {
        serde_json::from_str::<JsonDescriptor>(text)
            .map_err(|e| UploadError::InvalidResponse(format!("bad JSON descriptor: {e}")))?
            .url
    } else if !text.is_empty() {
        text.lines().next().unwrap_or(text).trim().to_string()
    } else if let Some(location) = location.map(str::trim).filter(|l| !l.is_empty()) {
        location.to_string()
    } else {
        return Err(UploadError::InvalidResponse("empty response body".into()));
    };

    reqwest::Url::parse(&candidate)
        .map_err(|e| UploadError::InvalidResponse(format!("{candidate:?} is not a URL: {e}")))?;
    Ok(candidate)
}

/// Shortens an error body for diagnostics.
pub fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.trim().to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", body[..end].trim_end())
}
