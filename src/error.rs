use std::io;

use thiserror::Error;

pub type Result<T, E = StreamError> = std::result::Result<T, E>;

/// Coarse failure classes, used to decide whether an error stops streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Listener could not be bound; fatal to the start attempt.
    Bind,
    /// Camera missing, busy or not permitted; streaming stops.
    CameraAccess,
    /// Hardware encoder could not be created or died; recoverable.
    Encoder,
    /// Socket failure local to one client.
    ClientIo,
    /// One frame could not be processed; it is dropped.
    FrameProcessing,
    /// Configuration or capability problems.
    Other,
}

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("camera not found: {0}")]
    CameraNotFound(String),

    #[error("permission denied for camera {0}")]
    PermissionDenied(String),

    #[error("camera {camera} unavailable: {reason}")]
    CameraAccess { camera: String, reason: String },

    #[error("encoder initialization failed: {0}")]
    EncoderInit(String),

    #[error("encoder error: {0}")]
    Encoder(String),

    #[error("frame processing failed: {0}")]
    FrameProcessing(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StreamError {
    pub fn camera_access(camera: impl Into<String>, reason: impl ToString) -> Self {
        Self::CameraAccess {
            camera: camera.into(),
            reason: reason.to_string(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Bind { .. } => ErrorCategory::Bind,
            Self::CameraNotFound(_) | Self::PermissionDenied(_) | Self::CameraAccess { .. } => {
                ErrorCategory::CameraAccess
            }
            Self::EncoderInit(_) | Self::Encoder(_) => ErrorCategory::Encoder,
            Self::Io(_) => ErrorCategory::ClientIo,
            Self::FrameProcessing(_) => ErrorCategory::FrameProcessing,
            Self::Unsupported(_) | Self::Config(_) => ErrorCategory::Other,
        }
    }

    /// Whether this error must leave the session stopped.
    pub fn stops_stream(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Bind | ErrorCategory::CameraAccess
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_and_bind_failures_stop_the_stream() {
        let bind = StreamError::Bind {
            addr: "127.0.0.1:4747".into(),
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };
        assert!(bind.stops_stream());
        assert!(StreamError::PermissionDenied("0".into()).stops_stream());
        assert!(StreamError::camera_access("1", "busy").stops_stream());
    }

    #[test]
    fn recoverable_failures_keep_streaming() {
        assert!(!StreamError::EncoderInit("no codec".into()).stops_stream());
        assert!(!StreamError::FrameProcessing("odd plane".into()).stops_stream());
        assert!(!StreamError::Io(io::Error::from(io::ErrorKind::BrokenPipe)).stops_stream());
    }
}
