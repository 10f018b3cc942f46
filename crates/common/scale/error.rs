use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScaleDecodeError {
    #[error("Not enough bytes in the input to decode the value")]
    UnexpectedEof,
    #[error("Invalid boolean byte: {0}")]
    InvalidBool(u8),
    #[error("Malformed compact integer")]
    InvalidCompact,
    #[error("Invalid enum tag: {0}")]
    InvalidTag(u8),
    #[error("Invalid UTF-8 in string payload")]
    InvalidUtf8,
    #[error("Value overflows the target integer type")]
    Overflow,
    #[error("Input has trailing bytes after the decoded value")]
    MalformedData,
    #[error("{0}")]
    Custom(String),
}
