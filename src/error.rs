use crate::message::{Properties, ERROR_CODE, ERROR_DOMAIN};
use pki_types::InvalidDnsNameError;
use std::fmt;
use std::io;
use std::string::FromUtf8Error;
use thiserror::Error;
use tokio::time::error::Elapsed;
use url::ParseError;

/// An inbound BLIP message with `kind = Error`, raised by the protocol layer
/// instead of being returned to the caller.
#[derive(Debug, Clone)]
pub struct BlipError {
    pub number: u64,
    pub properties: Properties,
    pub body: String,
}

impl BlipError {
    pub fn error_domain(&self) -> Option<&str> {
        self.properties.get(ERROR_DOMAIN)
    }

    pub fn error_code(&self) -> Option<i64> {
        self.properties.get(ERROR_CODE)?.parse().ok()
    }
}

impl fmt::Display for BlipError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BLIP error: MSG#{}", self.number)?;
        if let Some(domain) = self.error_domain() {
            write!(f, " {}", domain)?;
        }
        if let Some(code) = self.properties.get(ERROR_CODE) {
            write!(f, " {}", code)?;
        }
        write!(f, " {}", self.body)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    // Protocol errors
    #[error("{0}")]
    Blip(BlipError),

    #[error("client error: {status} {message}")]
    Client { status: u16, message: String },

    #[error("CRC mismatch on message #{number}")]
    CrcMismatch { number: u64 },

    #[error("replication error: {0}")]
    Replication(String),

    #[error("output error: {0}")]
    Output(String),

    // Wire codec errors
    #[error("empty varint")]
    EmptyVarint,

    #[error("varint exceeds the 64-bit range")]
    VarintOverflow,

    #[error("unterminated varint")]
    UnterminatedVarint,

    #[error("frame truncated")]
    TruncatedFrame,

    #[error("malformed property block")]
    MalformedProperties,

    // Transport errors
    #[error("channel communication error")]
    CommunicationError,

    #[error("{source}")]
    Timeout {
        #[from]
        source: Elapsed,
    },

    #[error("IO Error happened: {source}")]
    IOError {
        #[from]
        source: io::Error,
    },

    #[error("{source}")]
    FromUtf8Error {
        #[from]
        source: FromUtf8Error,
    },

    // Handshake errors
    #[error("{source}")]
    URLParseError {
        #[from]
        source: ParseError,
    },

    #[error("Invalid scheme in WebSocket URL")]
    InvalidSchemeURL,

    #[error("URL has no host")]
    URLNoHost,

    #[error("{source}")]
    HttpParseError {
        #[from]
        source: httparse::Error,
    },

    #[error("Incomplete HTTP response")]
    IncompleteHTTPResponse,

    #[error("Server didn't send a valid Sec-WebSocket-Accept key")]
    InvalidAcceptKey,

    #[error("{source}")]
    DomainError {
        #[from]
        source: InvalidDnsNameError,
    },

    #[error("{source}")]
    TlsError {
        #[from]
        source: rustls::Error,
    },

    // Framing errors
    #[error("RSV not zero")]
    RSVNotZero,

    #[error("Control frames must not be fragmented")]
    ControlFramesFragmented,

    #[error("Control frame with invalid payload size, can't be greater than 125")]
    ControlFramePayloadSize,

    #[error("Max frame size reached")]
    MaxFrameSize,

    #[error("Max message size reached")]
    MaxMessageSize,

    #[error("Invalid frame while there is a fragmented message in progress")]
    InvalidFrameFragmentation,

    #[error("Incoming fragmented message but there is one already in progress")]
    FragmentedInProgress,

    #[error("Invalid continuation frame: no fragmented message to continue")]
    InvalidContinuationFrame,

    #[error("Invalid Opcode")]
    InvalidOpcode,

    // Encoding errors
    #[error("{source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("{source}")]
    CompressError {
        #[from]
        source: flate2::CompressError,
    },

    #[error("{source}")]
    DecompressError {
        #[from]
        source: flate2::DecompressError,
    },
}

impl Error {
    /// The numeric code of this failure, when one exists: the `Error-Code`
    /// property for BLIP errors, the HTTP status for client errors.
    pub fn error_code(&self) -> Option<i64> {
        match self {
            Error::Blip(err) => err.error_code(),
            Error::Client { status, .. } => Some(*status as i64),
            _ => None,
        }
    }

    pub fn error_domain(&self) -> Option<&str> {
        match self {
            Error::Blip(err) => err.error_domain(),
            _ => None,
        }
    }
}
