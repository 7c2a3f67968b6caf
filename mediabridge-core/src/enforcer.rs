//! Sender track consistency
//!
//! Replacing a track on a live connection completes asynchronously relative
//! to the caller, and a track may be attached disabled in the meantime.
//! [`set_sender_track_enabled`] is idempotent so it can be run after every
//! replacement (and again as a safety net) without ever flipping a track away
//! from the requested value.

use crate::events::{BridgeEvent, EventBus};
use crate::peer::PeerConnectionHandle;
use crate::types::MediaKind;
use serde::{Deserialize, Serialize};

/// Result of one enforcement pass over the audio senders
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackEnableOutcome {
    /// Audio sender tracks enabled after the pass
    pub enabled_count: usize,
    /// Audio sender tracks disabled after the pass
    pub disabled_count: usize,
    /// Ended tracks found bound to a sender, left untouched
    pub ended_count: usize,
}

impl TrackEnableOutcome {
    /// Whether every live audio sender track matches `target`
    #[must_use]
    pub fn converged_to(&self, target: bool) -> bool {
        if target {
            self.disabled_count == 0
        } else {
            self.enabled_count == 0
        }
    }
}

/// Set the enabled flag of every audio sender track on `connection`
///
/// With no connection this is a no-op that publishes an
/// [`BridgeEvent::EnforcementSkipped`] diagnostic.
pub fn set_sender_track_enabled(
    connection: Option<&dyn PeerConnectionHandle>,
    should_enable: bool,
    events: &EventBus,
) -> TrackEnableOutcome {
    let Some(connection) = connection else {
        tracing::debug!(target_enabled = should_enable, "No active connection, skipping sender track enforcement");
        events.publish(BridgeEvent::EnforcementSkipped {
            reason: "no active peer connection".to_string(),
        });
        return TrackEnableOutcome::default();
    };

    let mut outcome = TrackEnableOutcome::default();
    for sender in connection.senders() {
        if sender.kind() != MediaKind::Audio {
            continue;
        }
        let Some(track) = sender.track() else {
            continue;
        };
        if !track.is_live() {
            outcome.ended_count += 1;
            continue;
        }
        track.set_enabled(should_enable);
        if track.enabled() {
            outcome.enabled_count += 1;
        } else {
            outcome.disabled_count += 1;
        }
    }

    tracing::debug!(
        target_enabled = should_enable,
        enabled = outcome.enabled_count,
        disabled = outcome.disabled_count,
        ended = outcome.ended_count,
        "Sender track enforcement pass"
    );
    events.publish(BridgeEvent::TrackEnableResult {
        target: should_enable,
        enabled_count: outcome.enabled_count,
        disabled_count: outcome.disabled_count,
        ended_count: outcome.ended_count,
    });
    outcome
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::media::{MediaStream, MediaStreamTrack};
    use crate::peer::{RtpSender, TransportError};
    use async_trait::async_trait;

    struct StaticSenders(Vec<RtpSender>);

    #[async_trait]
    impl PeerConnectionHandle for StaticSenders {
        fn senders(&self) -> Vec<RtpSender> {
            self.0.clone()
        }

        async fn replace_track(
            &self,
            sender: &RtpSender,
            track: Option<MediaStreamTrack>,
        ) -> Result<(), TransportError> {
            sender.bind(track);
            Ok(())
        }

        async fn set_input_stream(&self, _stream: &MediaStream) -> Result<(), TransportError> {
            Ok(())
        }

        async fn send_dtmf(&self, _tones: &str) -> Result<(), TransportError> {
            Ok(())
        }

        async fn close(&self) {}

        fn is_connected(&self) -> bool {
            true
        }
    }

    fn bound(kind: MediaKind, enabled: bool) -> (RtpSender, MediaStreamTrack) {
        let sender = RtpSender::new(kind);
        let track = MediaStreamTrack::new(kind, "dev", "Dev");
        track.set_enabled(enabled);
        sender.bind(Some(track.clone()));
        (sender, track)
    }

    #[test]
    fn test_enables_every_audio_sender() {
        let (a, ta) = bound(MediaKind::Audio, false);
        let (b, tb) = bound(MediaKind::Audio, true);
        let conn = StaticSenders(vec![a, b]);
        let outcome = set_sender_track_enabled(Some(&conn), true, &EventBus::default());
        assert_eq!(outcome.enabled_count, 2);
        assert_eq!(outcome.disabled_count, 0);
        assert!(ta.enabled() && tb.enabled());
        assert!(outcome.converged_to(true));
    }

    #[test]
    fn test_repeated_passes_never_flip() {
        let (a, ta) = bound(MediaKind::Audio, true);
        let conn = StaticSenders(vec![a]);
        let bus = EventBus::default();
        for _ in 0..5 {
            let outcome = set_sender_track_enabled(Some(&conn), true, &bus);
            assert!(outcome.converged_to(true));
            assert!(ta.enabled());
        }
        let outcome = set_sender_track_enabled(Some(&conn), false, &bus);
        assert_eq!(outcome.disabled_count, 1);
        assert!(!ta.enabled());
    }

    #[test]
    fn test_video_and_empty_senders_are_ignored() {
        let (v, tv) = bound(MediaKind::Video, false);
        let empty = RtpSender::new(MediaKind::Audio);
        let conn = StaticSenders(vec![v, empty]);
        let outcome = set_sender_track_enabled(Some(&conn), true, &EventBus::default());
        assert_eq!(outcome, TrackEnableOutcome::default());
        assert!(!tv.enabled());
    }

    #[test]
    fn test_ended_tracks_are_counted_not_touched() {
        let (a, ta) = bound(MediaKind::Audio, false);
        ta.stop();
        let conn = StaticSenders(vec![a]);
        let outcome = set_sender_track_enabled(Some(&conn), true, &EventBus::default());
        assert_eq!(outcome.ended_count, 1);
        assert_eq!(outcome.enabled_count, 0);
        assert!(!ta.enabled());
    }

    #[tokio::test]
    async fn test_no_connection_is_a_diagnostic_noop() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let outcome = set_sender_track_enabled(None, true, &bus);
        assert_eq!(outcome, TrackEnableOutcome::default());
        assert!(matches!(
            rx.recv().await.unwrap(),
            BridgeEvent::EnforcementSkipped { .. }
        ));
    }

    #[tokio::test]
    async fn test_publishes_counts() {
        let (a, _) = bound(MediaKind::Audio, false);
        let conn = StaticSenders(vec![a]);
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        set_sender_track_enabled(Some(&conn), true, &bus);
        assert_eq!(
            rx.recv().await.unwrap(),
            BridgeEvent::TrackEnableResult {
                target: true,
                enabled_count: 1,
                disabled_count: 0,
                ended_count: 0,
            }
        );
    }
}
