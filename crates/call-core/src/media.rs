//! Local media capability.
//!
//! Capture devices are an external collaborator. The core only needs to
//! acquire a stream, flip its audio/video tracks and release it.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Why local media could not be acquired.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("camera or microphone permission denied")]
    PermissionDenied,

    #[error("no camera or microphone found")]
    DeviceNotFound,

    #[error("camera or microphone is in use")]
    DeviceBusy,

    #[error("camera does not satisfy the requested constraints")]
    Overconstrained,

    #[error("media error: {0}")]
    Other(String),
}

impl MediaError {
    /// Classify a platform error name (`NotAllowedError`, ...).
    #[must_use]
    pub fn from_device_error(name: &str, detail: &str) -> Self {
        match name {
            "NotAllowedError" | "SecurityError" => MediaError::PermissionDenied,
            "NotFoundError" => MediaError::DeviceNotFound,
            "NotReadableError" | "AbortError" => MediaError::DeviceBusy,
            "OverconstrainedError" => MediaError::Overconstrained,
            _ => MediaError::Other(format!("{name}: {detail}")),
        }
    }

    /// Message suitable for showing to the user next to a retry action.
    #[must_use]
    pub fn user_message(&self) -> &'static str {
        match self {
            MediaError::PermissionDenied => {
                "Please allow camera and microphone access in your browser settings."
            }
            MediaError::DeviceNotFound => {
                "No camera or microphone was detected. Check that a device is connected."
            }
            MediaError::DeviceBusy => {
                "The camera or microphone is unavailable. Check that no other app is using it."
            }
            MediaError::Overconstrained => "The camera could not be initialised.",
            MediaError::Other(_) => {
                "Something went wrong while starting the camera. Please try again."
            }
        }
    }
}

/// Requested tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// An acquired local stream.
pub trait MediaStream: Send + Sync {
    fn id(&self) -> String;
    fn audio_enabled(&self) -> bool;
    fn set_audio_enabled(&self, enabled: bool);
    fn video_enabled(&self) -> bool;
    fn set_video_enabled(&self, enabled: bool);
    /// Stop every track. The stream is unusable afterwards.
    fn stop(&self);
}

/// Source of local streams.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Arc<dyn MediaStream>, MediaError>;
}

/// The session's local stream.
pub struct LocalMedia {
    devices: Arc<dyn MediaDevices>,
    stream: Option<Arc<dyn MediaStream>>,
}

impl LocalMedia {
    #[must_use]
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            stream: None,
        }
    }

    /// Acquire a stream, reusing the current one if already held.
    ///
    /// # Errors
    ///
    /// Returns the classified device error; nothing is held on failure.
    pub async fn acquire(&mut self) -> Result<Arc<dyn MediaStream>, MediaError> {
        if let Some(stream) = &self.stream {
            return Ok(Arc::clone(stream));
        }
        match self.devices.acquire(MediaConstraints::default()).await {
            Ok(stream) => {
                debug!(target: "call.session", stream_id = %stream.id(), "Local media acquired");
                self.stream = Some(Arc::clone(&stream));
                Ok(stream)
            }
            Err(e) => {
                warn!(target: "call.session", error = %e, "Local media acquisition failed");
                Err(e)
            }
        }
    }

    #[must_use]
    pub fn stream(&self) -> Option<Arc<dyn MediaStream>> {
        self.stream.clone()
    }

    /// Flip audio. Returns the new state; `false` without a stream.
    pub fn toggle_audio(&self) -> bool {
        let Some(stream) = &self.stream else {
            return false;
        };
        let enabled = !stream.audio_enabled();
        stream.set_audio_enabled(enabled);
        enabled
    }

    /// Flip video. Returns the new state; `false` without a stream.
    pub fn toggle_video(&self) -> bool {
        let Some(stream) = &self.stream else {
            return false;
        };
        let enabled = !stream.video_enabled();
        stream.set_video_enabled(enabled);
        enabled
    }

    /// Stop all tracks and drop the stream.
    pub fn release(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.stop();
        }
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.release();
    }
}
