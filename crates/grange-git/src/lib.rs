//! Git smart HTTP plumbing for grange
//!
//! Implements the two-phase smart HTTP exchange by driving the system `git`
//! binary: ref advertisement (`info/refs`) and pack negotiation
//! (`git-upload-pack` / `git-receive-pack`), plus pkt-line framing for the
//! service announcement.

pub mod error;
pub mod pack;
pub mod protocol;

pub use error::{Error, Result};
pub use pack::{cat_file_blob, PackProcess};
pub use protocol::Service;
