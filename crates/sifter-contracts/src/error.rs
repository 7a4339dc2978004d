use thiserror::Error;

pub type SifterResult<T> = Result<T, SifterError>;

/// Failure taxonomy shared by every pipeline entry point.
///
/// Each stage fails atomically: callers never receive a partial GIF next to
/// one of these.
#[derive(Debug, Error)]
pub enum SifterError {
    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("failed to decode GIF: {0}")]
    Decode(String),

    #[error("geometry mismatch: {0}")]
    Geometry(String),

    #[error("invalid region: {0}")]
    InvalidRegion(String),

    #[error("failed to encode GIF: {0}")]
    Encode(String),

    #[error("external collaborator failed: {0}")]
    ExternalCollaborator(String),

    #[error("fetch failed with HTTP status {status}: {message}")]
    Fetch { status: u16, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SifterError {
    /// Stable short name used in event logs and receipts.
    pub fn kind(&self) -> &'static str {
        match self {
            SifterError::MalformedInput(_) => "malformed_input",
            SifterError::Decode(_) => "decode",
            SifterError::Geometry(_) => "geometry",
            SifterError::InvalidRegion(_) => "invalid_region",
            SifterError::Encode(_) => "encode",
            SifterError::ExternalCollaborator(_) => "external_collaborator",
            SifterError::Fetch { .. } => "fetch",
            SifterError::Io(_) => "io",
        }
    }
}
