//! File name handling for the `Content-Disposition` header.

use std::borrow::Cow;
use std::path::Path;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

use crate::StagingError;

/// Characters escaped when a name needs encoding: everything except
/// the URI-component unreserved set.
const NAME_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Returns the leaf name of `path` as UTF-8 (lossy).
pub fn leaf_name(path: &Path) -> Result<String, StagingError> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| StagingError::InvalidPath(path.display().to_string()))
}

/// Encodes a leaf name for use inside `filename="..."`.
///
/// Names made only of printable ASCII pass through untouched. Anything
/// else (non-ASCII, control characters, or the `"`, `\` and `%` that
/// would break the quoted string or a later decode) causes the whole
/// name to be percent-encoded.
pub fn encode_file_name(name: &str) -> Cow<'_, str> {
    if name.bytes().all(is_safe_byte) {
        Cow::Borrowed(name)
    } else {
        Cow::Owned(utf8_percent_encode(name, NAME_ENCODE_SET).to_string())
    }
}

fn is_safe_byte(b: u8) -> bool {
    (0x20..=0x7e).contains(&b) && !matches!(b, b'"' | b'\\' | b'%')
}
