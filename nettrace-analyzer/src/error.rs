use thiserror::Error;

/// Errors raised while decoding a nettrace stream.
///
/// Only [`ParseError::InvalidMagic`] and
/// [`ParseError::InvalidSerializationHeader`] abort the parse. Everything
/// else is caught at the nearest block or object boundary, recorded in
/// [`ParseResult::errors`](crate::ParseResult), and decoding resumes at the
/// next outer tag.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("not a nettrace stream (missing \"Nettrace\" magic)")]
    InvalidMagic,

    #[error("unsupported serialization header {0:?}")]
    InvalidSerializationHeader(String),

    #[error("unexpected end of data")]
    UnexpectedEnd,

    #[error("type back-reference {0} does not name a registered type")]
    UnknownTypeIndex(u32),

    #[error("malformed {kind}: {reason}")]
    MalformedBlock { kind: &'static str, reason: String },

    #[error("malformed event header: {0}")]
    MalformedEvent(String),

    #[error("malformed {event} payload: {reason}")]
    MalformedPayload { event: &'static str, reason: String },
}

impl From<binrw::Error> for ParseError {
    fn from(err: binrw::Error) -> Self {
        match err {
            binrw::Error::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                ParseError::UnexpectedEnd
            }
            other => ParseError::MalformedEvent(other.to_string()),
        }
    }
}
