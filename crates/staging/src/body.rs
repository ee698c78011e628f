use std::fs::File;
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::boundary::generate_boundary;
use crate::filename::{encode_file_name, leaf_name};
use crate::{DEFAULT_CHUNK_SIZE, FILE_CONTENT_TYPE, FILE_FIELD_NAME, StagingError};

/// Longest slice of the source name reused in the staging file name.
const MAX_PREFIX_CHARS: usize = 32;

/// Where and how a body is staged.
#[derive(Debug, Clone)]
pub struct StagingOptions {
    /// Directory for staging files (`None` = system temp dir).
    pub dir: Option<PathBuf>,
    /// Copy buffer size. 0 means [`DEFAULT_CHUNK_SIZE`].
    pub chunk_size: usize,
}

impl Default for StagingOptions {
    fn default() -> Self {
        Self {
            dir: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

// ---------------------------------------------------------------------------
// StagedBody
// ---------------------------------------------------------------------------

/// A fully written multipart body backed by a temporary file.
///
/// The file belongs to this value alone. [`close`](Self::close) removes
/// it; dropping the value removes it too, so an unwinding task never
/// leaves it behind.
#[derive(Debug)]
pub struct StagedBody {
    temp: NamedTempFile,
    boundary: String,
    len: u64,
}

impl StagedBody {
    /// Boundary token delimiting the parts of this body.
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Value for the request's `Content-Type` header.
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// Exact body length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Always false: a staged body carries at least its delimiters.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Location of the staging file.
    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    /// Opens a fresh read handle positioned at the start of the body.
    pub fn open_reader(&self) -> Result<File, StagingError> {
        Ok(self.temp.reopen()?)
    }

    /// Deletes the staging file.
    pub fn close(self) -> Result<(), StagingError> {
        let path = self.temp.path().to_path_buf();
        self.temp.close()?;
        debug!(path = %path.display(), "staging file removed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Staging
// ---------------------------------------------------------------------------

/// Builds the multipart body for `source` in a new staging file.
///
/// Blocking: run it on a blocking thread. `cancel` is checked before
/// every chunk; a cancelled or failed staging deletes its partial file
/// before returning.
pub fn stage_multipart(
    source: &Path,
    options: &StagingOptions,
    cancel: &CancellationToken,
) -> Result<StagedBody, StagingError> {
    if cancel.is_cancelled() {
        return Err(StagingError::Cancelled);
    }

    let name = leaf_name(source)?;
    let boundary = generate_boundary();
    let mut temp = create_staging_file(&name, options.dir.as_deref())?;

    let written = match write_body(
        temp.as_file_mut(),
        source,
        &name,
        &boundary,
        options.chunk_size,
        cancel,
    ) {
        Ok(n) => n,
        Err(e) => {
            discard(temp);
            return Err(e);
        }
    };

    // Size the body through a new handle, not the one we wrote with.
    let found = match temp.reopen().and_then(|f| f.metadata()) {
        Ok(meta) => meta.len(),
        Err(e) => {
            discard(temp);
            return Err(e.into());
        }
    };
    if found != written {
        discard(temp);
        return Err(StagingError::SizeMismatch { written, found });
    }

    debug!(
        source = %source.display(),
        staged = %temp.path().display(),
        bytes = written,
        "multipart body staged"
    );

    Ok(StagedBody {
        temp,
        boundary,
        len: written,
    })
}

/// Header block preceding the file bytes.
pub(crate) fn part_preamble(boundary: &str, file_name: &str) -> String {
    format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"{FILE_FIELD_NAME}\"; filename=\"{}\"\r\n\
         Content-Type: {FILE_CONTENT_TYPE}\r\n\
         \r\n",
        encode_file_name(file_name)
    )
}

/// Closing delimiter following the file bytes.
pub(crate) fn closing_delimiter(boundary: &str) -> String {
    format!("\r\n--{boundary}--\r\n")
}

fn write_body(
    out: &mut File,
    source: &Path,
    name: &str,
    boundary: &str,
    chunk_size: usize,
    cancel: &CancellationToken,
) -> Result<u64, StagingError> {
    let mut src = File::open(source)?;
    let chunk_size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    };
    let mut buf = vec![0u8; chunk_size];
    let mut writer = BufWriter::with_capacity(chunk_size, out);

    let preamble = part_preamble(boundary, name);
    writer.write_all(preamble.as_bytes())?;
    let mut written = preamble.len() as u64;

    loop {
        if cancel.is_cancelled() {
            return Err(StagingError::Cancelled);
        }
        let n = match src.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        writer.write_all(&buf[..n])?;
        written += n as u64;
    }

    let closing = closing_delimiter(boundary);
    writer.write_all(closing.as_bytes())?;
    written += closing.len() as u64;

    writer.flush()?;
    Ok(written)
}

fn create_staging_file(name: &str, dir: Option<&Path>) -> std::io::Result<NamedTempFile> {
    let stem: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .take(MAX_PREFIX_CHARS)
        .collect();
    let prefix = format!("cloudfile-{stem}-");

    let mut builder = tempfile::Builder::new();
    builder.prefix(&prefix).suffix(".multipart");
    match dir {
        Some(dir) => builder.tempfile_in(dir),
        None => builder.tempfile(),
    }
}

fn discard(temp: NamedTempFile) {
    let path = temp.path().to_path_buf();
    if let Err(e) = temp.close() {
        warn!(path = %path.display(), error = %e, "failed to remove staging file");
    }
}
