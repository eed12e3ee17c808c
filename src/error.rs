//! CLI Error Types

use derive_more::{Display, Error};

/// A CLI error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for CLI commands.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("could not load configuration")]
    Config,
    #[display("`{_0}` failed")]
    Command(#[error(not(source))] &'static str),
    #[display("could not read from stdin")]
    Input,
    #[display("could not write to stdout")]
    Output,
}
