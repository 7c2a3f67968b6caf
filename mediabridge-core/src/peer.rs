//! Connection abstraction consumed by the bridges
//!
//! Signaling and the peer connection itself live outside this crate. Bridges
//! only need to enumerate outbound senders, swap the outbound input in place
//! and open/close a connection with a given ICE configuration.

use crate::ice::IceServerSet;
use crate::media::{MediaStream, MediaStreamTrack};
use crate::types::{MediaKind, SessionContext};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Connection errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No connection is established
    #[error("Connection not established")]
    NotConnected,

    /// The outbound track could not be replaced
    #[error("Track replacement failed: {0}")]
    ReplaceFailed(String),

    /// The connection could not be opened or negotiated
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    /// The connection was closed
    #[error("Connection closed")]
    Closed,

    /// Signaling channel failure
    #[error("Signaling error: {0}")]
    Signaling(String),
}

/// Outbound slot on a connection
///
/// Cheap to clone; clones refer to the same slot.
#[derive(Debug, Clone)]
pub struct RtpSender {
    id: Uuid,
    kind: MediaKind,
    track: Arc<RwLock<Option<MediaStreamTrack>>>,
}

impl RtpSender {
    /// Create an empty sender slot
    #[must_use]
    pub fn new(kind: MediaKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            track: Arc::new(RwLock::new(None)),
        }
    }

    /// Sender identifier
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Kind of media this slot sends
    #[must_use]
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Track currently bound to the slot
    #[must_use]
    pub fn track(&self) -> Option<MediaStreamTrack> {
        self.track.read().clone()
    }

    /// Bind a track to the slot
    ///
    /// Called by connection implementations once a replacement is committed.
    pub fn bind(&self, track: Option<MediaStreamTrack>) {
        *self.track.write() = track;
    }
}

/// Parameters for opening a connection
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Session the connection belongs to
    pub session: SessionContext,
    /// ICE configuration to use
    pub ice_servers: IceServerSet,
    /// Input to publish, `None` for receive-only
    pub input_stream: Option<MediaStream>,
    /// Kind of media published
    pub kind: MediaKind,
}

/// An established connection
#[async_trait]
pub trait PeerConnectionHandle: Send + Sync {
    /// Current outbound senders
    fn senders(&self) -> Vec<RtpSender>;

    /// Replace the track of one sender without renegotiation
    ///
    /// # Errors
    ///
    /// Returns error if the replacement cannot be committed
    async fn replace_track(
        &self,
        sender: &RtpSender,
        track: Option<MediaStreamTrack>,
    ) -> Result<(), TransportError>;

    /// Use `stream` as the whole outbound input
    ///
    /// Resolves only once every affected sender carries the new tracks.
    ///
    /// # Errors
    ///
    /// Returns error if any replacement fails
    async fn set_input_stream(&self, stream: &MediaStream) -> Result<(), TransportError>;

    /// Send DTMF tones
    ///
    /// # Errors
    ///
    /// Returns error if the connection cannot carry DTMF
    async fn send_dtmf(&self, tones: &str) -> Result<(), TransportError>;

    /// Close the connection
    async fn close(&self);

    /// Whether the connection is still open
    fn is_connected(&self) -> bool;
}

/// Opens connections for a bridge
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Open and negotiate a connection
    ///
    /// # Errors
    ///
    /// Returns error if the connection cannot be established
    async fn connect(
        &self,
        request: ConnectRequest,
    ) -> Result<Arc<dyn PeerConnectionHandle>, TransportError>;
}

/// Replace the track of every sender of `stream`'s kinds, pairing them by order
///
/// Helper for [`PeerConnectionHandle::set_input_stream`] implementations.
///
/// # Errors
///
/// Returns the first replacement failure
pub async fn replace_senders_from_stream(
    connection: &dyn PeerConnectionHandle,
    stream: &MediaStream,
) -> Result<(), TransportError> {
    let tracks = stream.tracks();
    for kind in [MediaKind::Audio, MediaKind::Video] {
        let mut kind_tracks = tracks.iter().filter(|t| t.kind() == kind);
        for sender in connection.senders().iter().filter(|s| s.kind() == kind) {
            connection
                .replace_track(sender, kind_tracks.next().cloned())
                .await?;
        }
    }
    Ok(())
}
