use serde::Serialize;
use thiserror::Error;

/// Coarse classification of a per-file failure.
///
/// Callers (and the CLI's JSON report) use this to tell a bad API key apart
/// from a flaky network, a chatty model, or a file the codecs can't handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Bad or missing API key, unknown provider. Detected before any network call.
    Configuration,
    /// Network or service failure that outlived the retry budget.
    Transient,
    /// The model answered, but not with a usable JSON object.
    MalformedOutput,
    /// The file extension is not handled by the writer or stripper.
    UnsupportedFormat,
    /// Decoding, encoding, or container parsing failed.
    Codec,
    /// Local filesystem or archive failure.
    Io,
}

/// Why a single file could not be processed.
///
/// Every component returns this instead of logging and swallowing, so the
/// orchestration layer can record the failure next to the file name and keep
/// going with the rest of the batch.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("model request failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("malformed model response: {0}")]
    MalformedResponse(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("RAW decoding is not available: {0}")]
    RawUnsupported(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("failed to encode image for upload: {0}")]
    Encoding(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl ProcessError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Config(_) => FailureKind::Configuration,
            Self::RetriesExhausted { .. } => FailureKind::Transient,
            Self::MalformedResponse(_) => FailureKind::MalformedOutput,
            Self::UnsupportedFormat(_) | Self::RawUnsupported(_) => FailureKind::UnsupportedFormat,
            Self::Codec(_) | Self::Encoding(_) => FailureKind::Codec,
            Self::Archive(_) | Self::Io { .. } => FailureKind::Io,
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<image::ImageError> for ProcessError {
    fn from(e: image::ImageError) -> Self {
        Self::Codec(e.to_string())
    }
}

impl From<zip::result::ZipError> for ProcessError {
    fn from(e: zip::result::ZipError) -> Self {
        Self::Archive(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(ProcessError::Config("x".into()).kind(), FailureKind::Configuration);
        assert_eq!(
            ProcessError::RetriesExhausted { attempts: 6, last: "503".into() }.kind(),
            FailureKind::Transient
        );
        assert_eq!(
            ProcessError::MalformedResponse("x".into()).kind(),
            FailureKind::MalformedOutput
        );
        assert_eq!(
            ProcessError::RawUnsupported("x".into()).kind(),
            FailureKind::UnsupportedFormat
        );
        assert_eq!(ProcessError::Encoding("x".into()).kind(), FailureKind::Codec);
        let io = ProcessError::io("reading", std::io::Error::other("boom"));
        assert_eq!(io.kind(), FailureKind::Io);
        assert_eq!(io.to_string(), "reading: boom");
    }

    #[test]
    fn failure_kind_serializes_snake_case() {
        let json = serde_json::to_string(&FailureKind::MalformedOutput).unwrap();
        assert_eq!(json, "\"malformed_output\"");
    }
}
