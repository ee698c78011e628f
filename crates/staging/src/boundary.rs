//! Multipart boundary generation.

use rand::Rng;

/// Random bytes per boundary (produces 32 hex characters).
const BOUNDARY_BYTES: usize = 16;

/// Dashes prefixed to the random part, as browsers do.
const BOUNDARY_PREFIX: &str = "------------------------";

/// Generates a boundary token unique to one request body.
///
/// The token is ASCII only and never appears inside the part headers we
/// write, so a parser finds it solely on the delimiter lines.
pub fn generate_boundary() -> String {
    let mut bytes = [0u8; BOUNDARY_BYTES];
    rand::thread_rng().fill(&mut bytes);
    format!("{BOUNDARY_PREFIX}{}", hex::encode(bytes))
}
