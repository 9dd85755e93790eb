use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error taxonomy. Each variant corresponds to one of the error
/// kinds enumerated for the pipeline: transient I/O is handled internally and
/// never constructs one of these, everything else surfaces here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no space left in nvtable (requested {requested} bytes, {available} available)")]
    OutOfSpace { requested: usize, available: usize },

    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    #[error("persisted state mismatch for {source_id}: {reason}")]
    PersistStateMismatch { source_id: String, reason: String },

    #[error("pattern database load failed ({file}:{line}): {reason}")]
    PatternDbLoad {
        file: String,
        line: usize,
        reason: String,
    },

    #[error("matcher compile failed at position {position} in `{pattern}`: {reason}")]
    MatcherCompile {
        pattern: String,
        position: usize,
        reason: String,
    },

    #[error("template compile failed at position {position} in `{template}`: {reason}")]
    TemplateCompile {
        template: String,
        position: usize,
        reason: String,
    },

    #[error("name too long: {0} bytes (max 255)")]
    NameTooLong(usize),

    #[error("handle space exhausted (max 65535 names)")]
    HandleSpaceExhausted,

    #[error(transparent)]
    Transport(#[from] io::Error),

    #[error("tls error: {0}")]
    Tls(#[from] openssl::error::ErrorStack),

    #[error("tls handshake/io error: {0}")]
    TlsSsl(#[from] openssl::ssl::Error),

    #[error("regex compile failed: {0}")]
    Regex(#[from] regex::Error),

    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),
}
