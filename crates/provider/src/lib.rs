//! Cloud file provider surface for host applications.
//!
//! A host (typically a mail client attaching large files as links) talks
//! to a [`CloudFileProvider`]. [`TransferShProvider`] implements it on
//! top of the single-flight upload coordinator and remembers the URL of
//! every file it has uploaded.

pub mod provider;
pub mod transfer_sh;

pub use provider::{CloudFileProvider, LastError};
pub use transfer_sh::{DISPLAY_NAME, TYPE_NAME, TransferShProvider};
