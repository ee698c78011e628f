//! Multipart request bodies staged on disk.
//!
//! A [`StagedBody`] is a temporary file holding the exact bytes of a
//! `multipart/form-data` request: preamble, the verbatim source file,
//! and the closing boundary. The source is copied in bounded chunks so
//! the payload is never held in memory, and the staged file is streamed
//! back as the HTTP request body.

mod body;
mod boundary;
mod filename;

pub use body::{StagedBody, StagingOptions, stage_multipart};
pub use boundary::generate_boundary;
pub use filename::{encode_file_name, leaf_name};

/// Default copy chunk size: 64 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Form field name the file part is sent under.
pub const FILE_FIELD_NAME: &str = "fname";

/// Content type declared for the file part.
pub const FILE_CONTENT_TYPE: &str = "application/octet-stream";

/// Errors produced while staging a request body.
#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid source path: {0}")]
    InvalidPath(String),

    #[error("staged size mismatch: wrote {written} bytes, found {found}")]
    SizeMismatch { written: u64, found: u64 },

    #[error("cancelled")]
    Cancelled,
}
