//! Local media streams and the acquisition seam
//!
//! A [`MediaStream`] is a shared handle over an ordered list of
//! [`MediaStreamTrack`]s, the way a platform capture session hands them out.
//! Cloning the handle does not duplicate capture; [`MediaStream::clone_stream`]
//! does, producing independent tracks on the same device.
//!
//! Acquisition itself is platform-specific and sits behind the
//! [`MediaAcquisition`] trait.

use crate::types::{MediaKind, StreamId, TrackId, TrackReadyState};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Device id that selects listen-only mode instead of a capture device
pub const LISTEN_ONLY_DEVICE_ID: &str = "listen-only";

/// Media acquisition errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The user or platform denied access
    #[error("Media access denied: {0}")]
    Denied(String),

    /// The platform cannot satisfy the requested constraints
    #[error("Constraints cannot be satisfied: {0}")]
    ConstraintsUnsatisfied(String),

    /// The requested device no longer exists
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Any other platform failure
    #[error("Platform media error: {0}")]
    Platform(String),
}

/// Audio processing flags applied when capturing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioProcessing {
    /// Cancel echo from local playback
    pub echo_cancellation: bool,
    /// Suppress background noise
    pub noise_suppression: bool,
    /// Normalize input gain
    pub auto_gain_control: bool,
}

/// Declarative constraint set for one acquisition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaConstraints {
    /// Kind of media requested
    pub kind: MediaKind,
    /// Exact device (or capture source) to open, `None` for the platform default
    pub device_id: Option<String>,
    /// Processing flags, ignored for video
    pub processing: AudioProcessing,
}

impl MediaConstraints {
    /// Audio capture constraints
    pub fn audio(device_id: Option<String>, processing: AudioProcessing) -> Self {
        Self {
            kind: MediaKind::Audio,
            device_id,
            processing,
        }
    }

    /// Display capture constraints for a screen or window source
    pub fn display(source_id: Option<String>) -> Self {
        Self {
            kind: MediaKind::Video,
            device_id: source_id,
            processing: AudioProcessing {
                echo_cancellation: false,
                noise_suppression: false,
                auto_gain_control: false,
            },
        }
    }
}

/// Input selection for a device switch
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InputDevice {
    /// Publish nothing but keep receiving
    ListenOnly,
    /// Capture from this device
    Device(String),
}

impl InputDevice {
    /// Device id, `None` for listen-only
    #[must_use]
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Self::ListenOnly => None,
            Self::Device(id) => Some(id),
        }
    }
}

impl From<&str> for InputDevice {
    fn from(id: &str) -> Self {
        if id == LISTEN_ONLY_DEVICE_ID {
            Self::ListenOnly
        } else {
            Self::Device(id.to_string())
        }
    }
}

impl From<String> for InputDevice {
    fn from(id: String) -> Self {
        if id == LISTEN_ONLY_DEVICE_ID {
            Self::ListenOnly
        } else {
            Self::Device(id)
        }
    }
}

impl std::fmt::Display for InputDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ListenOnly => write!(f, "{LISTEN_ONLY_DEVICE_ID}"),
            Self::Device(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Debug)]
struct TrackInner {
    id: TrackId,
    kind: MediaKind,
    device_id: String,
    label: String,
    enabled: AtomicBool,
    muted: AtomicBool,
    ended: AtomicBool,
}

/// A single local media channel
///
/// Cheap to clone; clones refer to the same underlying track.
#[derive(Debug, Clone)]
pub struct MediaStreamTrack {
    inner: Arc<TrackInner>,
}

impl MediaStreamTrack {
    /// Create a live, enabled track capturing from `device_id`
    pub fn new(kind: MediaKind, device_id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: TrackId::new(),
                kind,
                device_id: device_id.into(),
                label: label.into(),
                enabled: AtomicBool::new(true),
                muted: AtomicBool::new(false),
                ended: AtomicBool::new(false),
            }),
        }
    }

    /// Track identifier
    #[must_use]
    pub fn id(&self) -> TrackId {
        self.inner.id
    }

    /// Media kind
    #[must_use]
    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    /// Device the track captures from
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    /// Human readable label
    #[must_use]
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Current ready state
    #[must_use]
    pub fn ready_state(&self) -> TrackReadyState {
        if self.inner.ended.load(Ordering::Acquire) {
            TrackReadyState::Ended
        } else {
            TrackReadyState::Live
        }
    }

    /// Whether the track is still live
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.ready_state() == TrackReadyState::Live
    }

    /// Whether data is sent for this track
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    /// Set the enabled flag
    ///
    /// Ended tracks are never re-enabled; returns `false` when the request
    /// was refused for that reason.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        if !self.is_live() {
            return false;
        }
        self.inner.enabled.store(enabled, Ordering::Release);
        true
    }

    /// Whether the platform reports the source as muted
    #[must_use]
    pub fn muted(&self) -> bool {
        self.inner.muted.load(Ordering::Acquire)
    }

    /// Record a mute signal from the platform
    ///
    /// Only platform adapters call this; bridges never change it.
    pub fn signal_muted(&self, muted: bool) {
        self.inner.muted.store(muted, Ordering::Release);
    }

    /// Stop capture permanently
    pub fn stop(&self) {
        if !self.inner.ended.swap(true, Ordering::AcqRel) {
            tracing::trace!(track_id = %self.inner.id, device_id = %self.inner.device_id, "Track stopped");
        }
    }

    /// Create an independent track on the same source
    ///
    /// Cloning an ended track yields an ended track.
    #[must_use]
    pub fn clone_track(&self) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: TrackId::new(),
                kind: self.inner.kind,
                device_id: self.inner.device_id.clone(),
                label: self.inner.label.clone(),
                enabled: AtomicBool::new(self.enabled()),
                muted: AtomicBool::new(self.muted()),
                ended: AtomicBool::new(!self.is_live()),
            }),
        }
    }

    /// Whether two handles refer to the same track
    #[must_use]
    pub fn same_track(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// An ordered collection of tracks from one capture session
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: StreamId,
    tracks: Arc<Mutex<Vec<MediaStreamTrack>>>,
}

impl MediaStream {
    /// Create a stream from tracks
    pub fn new(tracks: Vec<MediaStreamTrack>) -> Self {
        Self {
            id: StreamId::new(),
            tracks: Arc::new(Mutex::new(tracks)),
        }
    }

    /// Stream identifier
    #[must_use]
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Snapshot of all tracks
    #[must_use]
    pub fn tracks(&self) -> Vec<MediaStreamTrack> {
        self.tracks.lock().clone()
    }

    /// Snapshot of audio tracks
    #[must_use]
    pub fn audio_tracks(&self) -> Vec<MediaStreamTrack> {
        self.tracks
            .lock()
            .iter()
            .filter(|t| t.kind() == MediaKind::Audio)
            .cloned()
            .collect()
    }

    /// Whether at least one track is live
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.tracks.lock().iter().any(MediaStreamTrack::is_live)
    }

    /// Device of the first track, if any
    #[must_use]
    pub fn device_id(&self) -> Option<String> {
        self.tracks
            .lock()
            .first()
            .map(|t| t.device_id().to_string())
    }

    /// Enable every live track, returning how many were touched
    pub fn enable_live_tracks(&self) -> usize {
        self.tracks
            .lock()
            .iter()
            .filter(|t| t.is_live())
            .filter(|t| t.set_enabled(true))
            .count()
    }

    /// Stop every track
    pub fn stop_all(&self) {
        for track in self.tracks.lock().iter() {
            track.stop();
        }
    }

    /// Detach a track from the stream
    ///
    /// # Errors
    ///
    /// Returns error if the track is not part of this stream
    pub fn remove_track(&self, track_id: TrackId) -> Result<MediaStreamTrack, DeviceError> {
        let mut tracks = self.tracks.lock();
        let pos = tracks
            .iter()
            .position(|t| t.id() == track_id)
            .ok_or_else(|| DeviceError::Platform(format!("track {track_id} not in stream")))?;
        Ok(tracks.remove(pos))
    }

    /// Stop and detach every track
    ///
    /// A track that was already removed by someone else is not an error.
    pub fn stop_and_detach_all(&self) {
        for track in self.tracks() {
            track.stop();
            if let Err(e) = self.remove_track(track.id()) {
                tracing::debug!(track_id = %track.id(), error = %e, "Track already detached");
            }
        }
    }

    /// Duplicate the capture session into an independent stream
    #[must_use]
    pub fn clone_stream(&self) -> Self {
        Self::new(self.tracks.lock().iter().map(MediaStreamTrack::clone_track).collect())
    }
}

impl PartialEq for MediaStream {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// Platform capability to open local media
///
/// A successful call activates a physical capture device.
#[async_trait]
pub trait MediaAcquisition: Send + Sync {
    /// Acquire a stream satisfying the constraints
    ///
    /// # Errors
    ///
    /// [`DeviceError::DeviceNotFound`] when the device no longer exists,
    /// other variants when the platform denies or cannot satisfy the request.
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaStream, DeviceError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn mic(device: &str) -> MediaStream {
        MediaStream::new(vec![MediaStreamTrack::new(MediaKind::Audio, device, "Mic")])
    }

    #[test]
    fn test_listen_only_sentinel() {
        assert_eq!(InputDevice::from("listen-only"), InputDevice::ListenOnly);
        assert_eq!(
            InputDevice::from("mic-1"),
            InputDevice::Device("mic-1".to_string())
        );
        assert_eq!(InputDevice::ListenOnly.device_id(), None);
        assert_eq!(InputDevice::ListenOnly.to_string(), LISTEN_ONLY_DEVICE_ID);
    }

    #[test]
    fn test_ended_track_is_never_reenabled() {
        let track = MediaStreamTrack::new(MediaKind::Audio, "mic-1", "Mic");
        track.set_enabled(false);
        track.stop();
        assert!(!track.set_enabled(true));
        assert!(!track.enabled());
        assert_eq!(track.ready_state(), TrackReadyState::Ended);
    }

    #[test]
    fn test_clone_stream_is_independent() {
        let original = mic("mic-1");
        let backup = original.clone_stream();
        assert_ne!(original.id(), backup.id());

        original.stop_all();
        assert!(!original.is_active());
        assert!(backup.is_active());
        assert_eq!(backup.device_id().as_deref(), Some("mic-1"));
    }

    #[test]
    fn test_clone_of_ended_track_is_ended() {
        let track = MediaStreamTrack::new(MediaKind::Audio, "mic-1", "Mic");
        track.stop();
        assert!(!track.clone_track().is_live());
    }

    #[test]
    fn test_stop_and_detach_tolerates_removed_track() {
        let stream = mic("mic-1");
        let track = stream.tracks()[0].clone();
        stream.remove_track(track.id()).unwrap();
        stream.stop_and_detach_all();
        assert!(stream.tracks().is_empty());

        let stream = mic("mic-2");
        let track = stream.tracks()[0].clone();
        stream.stop_and_detach_all();
        assert!(!track.is_live());
        assert!(stream.tracks().is_empty());
    }

    #[test]
    fn test_enable_live_tracks_skips_ended() {
        let live = MediaStreamTrack::new(MediaKind::Audio, "mic-1", "Mic");
        let ended = MediaStreamTrack::new(MediaKind::Audio, "mic-1", "Mic");
        live.set_enabled(false);
        ended.set_enabled(false);
        ended.stop();
        let stream = MediaStream::new(vec![live.clone(), ended.clone()]);
        assert_eq!(stream.enable_live_tracks(), 1);
        assert!(live.enabled());
        assert!(!ended.enabled());
    }

    #[test]
    fn test_muted_is_platform_signal() {
        let track = MediaStreamTrack::new(MediaKind::Audio, "mic-1", "Mic");
        assert!(!track.muted());
        track.signal_muted(true);
        assert!(track.muted());
        assert!(track.clone_track().muted());
    }

    #[test]
    fn test_handle_clone_shares_tracks() {
        let stream = mic("mic-1");
        let handle = stream.clone();
        handle.stop_all();
        assert!(!stream.is_active());
        assert_eq!(stream, handle);
    }
}
