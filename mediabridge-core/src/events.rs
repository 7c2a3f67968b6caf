//! Discrete event records published by bridges
//!
//! Observers subscribe to an [`EventBus`] and react to named records instead of
//! depending on internal error types. Every record is serializable so it can be
//! forwarded to telemetry as-is.

use crate::types::{BridgeKind, CallState};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// How loudly an event should be surfaced
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Routine state information
    Info,
    /// Recovered failure
    Warning,
    /// Failure surfaced to the caller
    Error,
    /// The user may have lost audio input
    Critical,
}

/// Bridge events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum BridgeEvent {
    /// Result of one sender track enforcement pass
    TrackEnableResult {
        /// Requested enabled value
        target: bool,
        /// Audio sender tracks now enabled
        enabled_count: usize,
        /// Audio sender tracks now disabled
        disabled_count: usize,
        /// Ended tracks left untouched
        ended_count: usize,
    },
    /// Enforcement was requested with no active connection
    EnforcementSkipped {
        /// Why nothing was done
        reason: String,
    },
    /// Input device switch committed
    DeviceSwitched {
        /// Bridge that switched
        bridge: BridgeKind,
        /// New device, `None` for listen-only
        device_id: Option<String>,
    },
    /// Input device switch failed and the previous input was restored
    DeviceSwitchFailed {
        /// Bridge that attempted the switch
        bridge: BridgeKind,
        /// Requested device
        device_id: String,
        /// Triggering error
        error: String,
    },
    /// Input device switch failed and restoring the previous input failed too
    RollbackFailed {
        /// Bridge that attempted the switch
        bridge: BridgeKind,
        /// Requested device
        device_id: String,
        /// Triggering error
        error: String,
        /// Error raised while restoring the previous input
        recovery_error: String,
    },
    /// ICE servers could not be fetched; a fallback list was used
    IceFetchFailed {
        /// Fetch or parse error
        error: String,
        /// Fallback server address handed to the caller
        fallback: String,
    },
    /// A bridge changed call state
    CallStateChanged {
        /// Bridge reporting the change
        bridge: BridgeKind,
        /// New state
        state: CallState,
    },
    /// A bridge operation was invoked that the bridge does not implement
    CapabilityUnsupported {
        /// Bridge that was invoked
        bridge: BridgeKind,
        /// Operation name
        operation: String,
    },
}

impl BridgeEvent {
    /// Severity of this event
    #[must_use]
    pub fn severity(&self) -> Severity {
        match self {
            Self::TrackEnableResult { .. }
            | Self::DeviceSwitched { .. }
            | Self::EnforcementSkipped { .. } => Severity::Info,
            Self::IceFetchFailed { .. } => Severity::Warning,
            Self::DeviceSwitchFailed { .. } | Self::CapabilityUnsupported { .. } => {
                Severity::Error
            }
            Self::CallStateChanged { state, .. } => match state {
                CallState::Failed => Severity::Error,
                CallState::Reconnecting | CallState::AutoplayBlocked => Severity::Warning,
                _ => Severity::Info,
            },
            Self::RollbackFailed { .. } => Severity::Critical,
        }
    }
}

/// Broadcast channel for [`BridgeEvent`]s
///
/// Cloning the bus yields another handle to the same channel, so every
/// component of one bridge publishes to the same subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BridgeEvent>,
}

impl EventBus {
    /// Create a new event bus with the given backlog per subscriber
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to all current subscribers
    pub fn publish(&self, event: BridgeEvent) {
        match event.severity() {
            Severity::Critical => tracing::error!(?event, "Bridge event"),
            Severity::Error => tracing::warn!(?event, "Bridge event"),
            Severity::Warning | Severity::Info => tracing::debug!(?event, "Bridge event"),
        }
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }

    /// Subscribe to events published from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_rollback_failure_is_critical() {
        let event = BridgeEvent::RollbackFailed {
            bridge: BridgeKind::Audio,
            device_id: "mic-2".to_string(),
            error: "denied".to_string(),
            recovery_error: "closed".to_string(),
        };
        assert_eq!(event.severity(), Severity::Critical);
        assert!(event.severity() > Severity::Error);
    }

    #[test]
    fn test_call_state_severity() {
        let failed = BridgeEvent::CallStateChanged {
            bridge: BridgeKind::ScreenShare,
            state: CallState::Failed,
        };
        assert_eq!(failed.severity(), Severity::Error);

        let started = BridgeEvent::CallStateChanged {
            bridge: BridgeKind::Audio,
            state: CallState::Started,
        };
        assert_eq!(started.severity(), Severity::Info);
    }

    #[tokio::test]
    async fn test_event_bus_delivers_to_subscribers() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(BridgeEvent::EnforcementSkipped {
            reason: "no connection".to_string(),
        });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, BridgeEvent::EnforcementSkipped { .. }));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(0);
        bus.publish(BridgeEvent::EnforcementSkipped {
            reason: "nobody listening".to_string(),
        });
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = BridgeEvent::TrackEnableResult {
            target: true,
            enabled_count: 1,
            disabled_count: 0,
            ended_count: 0,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "trackEnableResult");
        assert_eq!(json["enabled_count"], 1);
    }
}
