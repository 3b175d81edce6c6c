/*!
The crate-wide error type and its constructor helpers.

`Error` covers everything that can go wrong talking SDDP: transport
failures from the underlying sockets, malformed datagrams on the wire,
and misuse of the engine/client/server APIs. `DatagramFormatError` is
nested under `Error::DatagramFormat` and carries the specifics of a
wire-format failure.
*/

use std::fmt::Display;
use std::io::Error as IOError;
use std::net::AddrParseError;
use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Public Types
// ------------------------------------------------------------------------------------------------

///
/// The common error type for this crate.
///
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    NetworkTransport(#[from] IOError),

    #[error(transparent)]
    DatagramFormat(#[from] DatagramFormatError),

    #[error("could not parse network address `{0}`")]
    AddressFormat(#[from] AddrParseError),

    #[error("no local network interfaces could be bound")]
    NoUsableInterfaces,

    #[error("the engine has already been started")]
    AlreadyStarted,

    #[error("the engine is shutting down or has already shut down")]
    ShutDown,

    #[error("a notify handler returned an error: {0}")]
    HandlerFailed(String),

    #[error("an operation you attempted returned an error status `{status}` (operation: `{operation}`)")]
    OperationFailed { operation: String, status: String },
}

#[derive(Clone, Copy, Debug)]
pub enum ValueSource {
    StatementLine,
    Header,
    Field,
}

#[derive(Debug, Error)]
pub enum DatagramFormatError {
    #[error("the statement line `{line}` did not match any recognized SDDP grammar")]
    InvalidStatementLine { line: String },

    #[error("a header line could not be parsed: `{line}`")]
    InvalidHeaderLine { line: String },

    #[error("the datagram body was not valid UTF-8 where UTF-8 was required")]
    SourceEncoding(#[from] std::str::Utf8Error),

    #[error("a required {kind} `{name}` was either missing or empty")]
    MissingRequiredValue { kind: ValueSource, name: String },

    #[error("the {kind} `{name}` value did not match the expected type (expected: `{expected}`, found: `{found}`)")]
    ValueTypeMismatch {
        kind: ValueSource,
        name: String,
        expected: String,
        found: String,
    },

    #[error("the {kind} `{name}` was incorrectly formatted (value: `{value}`)")]
    InvalidValue {
        kind: ValueSource,
        name: String,
        value: String,
    },

    #[error("failed to JSON-encode header `{name}`: {source}")]
    HeaderEncode {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

// ------------------------------------------------------------------------------------------------
// Public Functions
// ------------------------------------------------------------------------------------------------

pub fn invalid_statement_line<S>(line: S) -> DatagramFormatError
where
    S: Into<String>,
{
    DatagramFormatError::InvalidStatementLine { line: line.into() }
}

pub fn invalid_header_line<S>(line: S) -> DatagramFormatError
where
    S: Into<String>,
{
    DatagramFormatError::InvalidHeaderLine { line: line.into() }
}

pub fn missing_required_header<S>(name: S) -> DatagramFormatError
where
    S: Into<String>,
{
    DatagramFormatError::MissingRequiredValue {
        kind: ValueSource::Header,
        name: name.into(),
    }
}

pub fn header_type_mismatch<S1, S2, S3>(name: S1, expected: S2, found: S3) -> DatagramFormatError
where
    S1: Into<String>,
    S2: Into<String>,
    S3: Into<String>,
{
    DatagramFormatError::ValueTypeMismatch {
        kind: ValueSource::Header,
        name: name.into(),
        expected: expected.into(),
        found: found.into(),
    }
}

pub fn invalid_header_value<S1, S2>(name: S1, value: S2) -> DatagramFormatError
where
    S1: Into<String>,
    S2: Into<String>,
{
    DatagramFormatError::InvalidValue {
        kind: ValueSource::Header,
        name: name.into(),
        value: value.into(),
    }
}

pub fn header_encode_error(name: impl Into<String>, source: serde_json::Error) -> DatagramFormatError {
    DatagramFormatError::HeaderEncode {
        name: name.into(),
        source,
    }
}

pub fn operation_failed<S1, S2>(operation: S1, status: S2) -> Error
where
    S1: Into<String>,
    S2: Into<String>,
{
    Error::OperationFailed {
        operation: operation.into(),
        status: status.into(),
    }
}

// ------------------------------------------------------------------------------------------------
// Implementations
// ------------------------------------------------------------------------------------------------

impl Display for ValueSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ValueSource::StatementLine => "statement line",
                ValueSource::Header => "message header",
                ValueSource::Field => "message field",
            }
        )
    }
}

impl<T> From<DatagramFormatError> for Result<T, DatagramFormatError> {
    fn from(e: DatagramFormatError) -> Self {
        Err(e)
    }
}

impl<T> From<DatagramFormatError> for Result<T, Error> {
    fn from(e: DatagramFormatError) -> Self {
        Err(Error::DatagramFormat(e))
    }
}
