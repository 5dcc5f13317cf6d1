//! Error types for grange-git

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("git exited with status {status}: {stderr}")]
    GitExit { status: i32, stderr: String },

    #[error("git terminated by signal")]
    GitKilled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
