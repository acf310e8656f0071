//! Mock media devices.

use async_trait::async_trait;
use call_core::media::{MediaConstraints, MediaDevices, MediaError, MediaStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Stream whose tracks are plain flags.
#[derive(Debug)]
pub struct MockMediaStream {
    id: String,
    audio: AtomicBool,
    video: AtomicBool,
    stopped: AtomicBool,
}

impl MockMediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            audio: AtomicBool::new(true),
            video: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl MediaStream for MockMediaStream {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn audio_enabled(&self) -> bool {
        self.audio.load(Ordering::SeqCst)
    }

    fn set_audio_enabled(&self, enabled: bool) {
        self.audio.store(enabled, Ordering::SeqCst);
    }

    fn video_enabled(&self) -> bool {
        self.video.load(Ordering::SeqCst)
    }

    fn set_video_enabled(&self, enabled: bool) {
        self.video.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Devices that hand out [`MockMediaStream`]s, or fail with a set error.
#[derive(Debug, Default)]
pub struct MockMediaDevices {
    failure: Mutex<Option<MediaError>>,
    acquired: AtomicU32,
    streams: Mutex<Vec<Arc<MockMediaStream>>>,
}

impl MockMediaDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Devices whose next acquisitions fail with `error`.
    pub fn failing(error: MediaError) -> Arc<Self> {
        let devices = Self::default();
        *devices.failure.lock().unwrap() = Some(error);
        Arc::new(devices)
    }

    /// Change (or clear) the failure returned by later acquisitions.
    pub fn set_failure(&self, error: Option<MediaError>) {
        *self.failure.lock().unwrap() = error;
    }

    /// Number of successful acquisitions.
    pub fn acquire_count(&self) -> u32 {
        self.acquired.load(Ordering::SeqCst)
    }

    /// The most recently acquired stream.
    pub fn last_stream(&self) -> Option<Arc<MockMediaStream>> {
        self.streams.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl MediaDevices for MockMediaDevices {
    async fn acquire(
        &self,
        _constraints: MediaConstraints,
    ) -> Result<Arc<dyn MediaStream>, MediaError> {
        if let Some(error) = self.failure.lock().unwrap().clone() {
            return Err(error);
        }
        let n = self.acquired.fetch_add(1, Ordering::SeqCst) + 1;
        let stream = Arc::new(MockMediaStream::new(format!("local-stream-{n}")));
        self.streams.lock().unwrap().push(Arc::clone(&stream));
        Ok(stream)
    }
}
