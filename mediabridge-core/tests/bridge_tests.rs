//! Bridge lifecycle tests
//!
//! Join/exit, connection retries with backoff, signal tones, capability
//! reporting and call state transitions of the audio and screen share bridges.

use mediabridge_core::sim::{SimulatedConnector, SimulatedIceServerSource, SimulatedMediaDevices};
use mediabridge_core::{
    AudioBridge, BridgeError, BridgeEvent, BridgeKind, BridgeServices, BridgeSettings, CallState,
    EventBus, IceFetchError, IceServerPayload, IceServerProvider, IceServerSet, InputDevice,
    MediaBridge, MediaKind, PeerConnectionHandle, ScreenShareBridge, SessionContext,
    TransportError, TurnDescriptor,
};
use std::sync::Arc;
use std::time::Duration;

const SETTINGS: &str = r#"{
    "media": { "echoCancellation": true, "noiseSuppression": false, "autoGainControl": true },
    "ice": {
        "endpoint": "https://conference.example.org/api/ice-servers",
        "fetchTimeoutMs": 5000,
        "fallbackStunAddress": "stun:stun.example.org:3478"
    },
    "reconnect": { "baseIntervalMs": 1000, "maxIntervalMs": 10000, "growthFactor": 1.5, "maxAttempts": 4 },
    "enforcement": { "safetyNetDelayMs": 500 },
    "transparentListenOnly": true
}"#;

struct Fixture {
    settings: BridgeSettings,
    devices: Arc<SimulatedMediaDevices>,
    connector: Arc<SimulatedConnector>,
    ice_source: Arc<SimulatedIceServerSource>,
    events: EventBus,
}

impl Fixture {
    fn new() -> Self {
        let payload = IceServerPayload {
            stun_servers: vec![],
            turn_servers: vec![TurnDescriptor {
                url: "turn:turn.example.org:3478".to_string(),
                username: "4102444800:w_user1".to_string(),
                password: "secret".to_string(),
            }],
        };
        Self {
            settings: BridgeSettings::from_json_str(SETTINGS).unwrap(),
            devices: Arc::new(
                SimulatedMediaDevices::new()
                    .with_microphone("mic-1", "Built-in Microphone")
                    .with_microphone("mic-2", "USB Headset")
                    .with_display("screen:0", "Entire Screen")
                    .with_display("window:42", "Slides"),
            ),
            connector: Arc::new(SimulatedConnector::new()),
            ice_source: Arc::new(SimulatedIceServerSource::new(payload)),
            events: EventBus::default(),
        }
    }

    fn services(&self) -> BridgeServices {
        let ice = IceServerProvider::new(
            self.ice_source.clone(),
            self.settings.ice.fetch_timeout(),
            self.settings.ice.fallback_stun_address.clone(),
        )
        .with_events(self.events.clone());
        BridgeServices {
            acquisition: self.devices.clone(),
            connector: self.connector.clone(),
            ice: Arc::new(ice),
            events: self.events.clone(),
        }
    }

    fn audio(&self) -> AudioBridge {
        AudioBridge::new(&self.settings, self.services())
    }

    fn screen_share(&self) -> ScreenShareBridge {
        ScreenShareBridge::new(&self.settings, self.services())
    }
}

fn session() -> SessionContext {
    SessionContext::new("session-token", "w_user1", "Alice", "73001")
}

// ============================================================================
// Audio bridge
// ============================================================================

#[tokio::test]
async fn audio_join_publishes_default_device() {
    let fixture = Fixture::new();
    let bridge = fixture.audio();

    bridge.join_session(&session(), None).await.unwrap();

    assert_eq!(
        bridge.call_state_history(),
        vec![CallState::Started, CallState::AudioPublished]
    );
    assert_eq!(
        bridge.input_stream().unwrap().device_id().as_deref(),
        Some("mic-1")
    );
    assert_eq!(bridge.session(), Some(session()));

    let requests = fixture.connector.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].kind, MediaKind::Audio);
    assert!(requests[0].ice_servers.has_relay_credentials);

    let constraints = &fixture.devices.requests()[0];
    assert!(constraints.processing.echo_cancellation);
    assert!(!constraints.processing.noise_suppression);
}

#[tokio::test]
async fn audio_join_listen_only_publishes_nothing() {
    let fixture = Fixture::new();
    let bridge = fixture.audio();

    bridge
        .join_session(&session(), Some(InputDevice::ListenOnly))
        .await
        .unwrap();

    assert_eq!(bridge.call_state(), Some(CallState::Started));
    assert!(bridge.input_stream().is_none());
    assert!(fixture.devices.requests().is_empty());
    assert!(fixture.connector.requests()[0].input_stream.is_none());
    assert!(bridge.supports_transparent_listen_only());
}

#[tokio::test]
async fn audio_join_uses_fallback_ice_on_fetch_failure() {
    let fixture = Fixture::new();
    fixture
        .ice_source
        .set_response(Err(IceFetchError::Status(502)));
    let mut rx = fixture.events.subscribe();
    let bridge = fixture.audio();

    bridge.join_session(&session(), None).await.unwrap();

    let ice_servers = &fixture.connector.requests()[0].ice_servers;
    assert_eq!(
        *ice_servers,
        IceServerSet::fallback("stun:stun.example.org:3478")
    );
    assert!(matches!(
        rx.recv().await.unwrap(),
        BridgeEvent::IceFetchFailed { .. }
    ));
}

#[tokio::test]
async fn audio_join_acquisition_failure_fails_call() {
    let fixture = Fixture::new();
    fixture.devices.deny("mic-2");
    let bridge = fixture.audio();

    let result = bridge
        .join_session(&session(), Some(InputDevice::from("mic-2")))
        .await;

    assert!(matches!(result, Err(BridgeError::Device(_))));
    assert_eq!(bridge.call_state(), Some(CallState::Failed));
    assert_eq!(fixture.connector.attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn audio_join_retries_with_backoff() {
    let fixture = Fixture::new();
    fixture.connector.fail_next_connects(
        2,
        TransportError::ConnectFailed("ICE negotiation failed".to_string()),
    );
    let bridge = fixture.audio();

    let started = tokio::time::Instant::now();
    bridge.join_session(&session(), None).await.unwrap();

    assert_eq!(fixture.connector.attempts(), 3);
    assert!(started.elapsed() >= Duration::from_millis(1000 + 1500));
    assert_eq!(
        bridge.call_state_history(),
        vec![
            CallState::Reconnecting,
            CallState::Started,
            CallState::AudioPublished
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn audio_join_gives_up_after_max_attempts() {
    let fixture = Fixture::new();
    fixture
        .connector
        .fail_next_connects(10, TransportError::ConnectFailed("unreachable".to_string()));
    let bridge = fixture.audio();

    let result = bridge.join_session(&session(), None).await;

    assert_eq!(
        result,
        Err(BridgeError::ConnectionFailed {
            attempts: 4,
            last_error: TransportError::ConnectFailed("unreachable".to_string()),
        })
    );
    assert_eq!(fixture.connector.attempts(), 4);
    assert_eq!(bridge.call_state(), Some(CallState::Failed));
    assert_eq!(fixture.devices.live_tracks_on("mic-1"), 0);
    assert!(bridge.peer_connection().is_none());
}

#[tokio::test]
async fn audio_exit_closes_and_releases() {
    let fixture = Fixture::new();
    let bridge = fixture.audio();
    bridge.join_session(&session(), None).await.unwrap();
    let connection = fixture.connector.last_connection().unwrap();

    bridge.exit_session().await.unwrap();

    assert!(!connection.is_connected());
    assert!(bridge.input_stream().is_none());
    assert_eq!(fixture.devices.live_tracks_on("mic-1"), 0);
    assert_eq!(bridge.call_state(), Some(CallState::Ended));
    assert!(bridge.session().is_none());

    // Leaving twice is harmless
    bridge.exit_session().await.unwrap();
    assert_eq!(bridge.call_state(), Some(CallState::Ended));
}

#[tokio::test]
async fn audio_reconnect_keeps_input() {
    let fixture = Fixture::new();
    let bridge = fixture.audio();
    bridge.join_session(&session(), None).await.unwrap();
    let input = bridge.input_stream().unwrap();
    let stale = fixture.connector.last_connection().unwrap();

    bridge.reconnect().await.unwrap();

    assert!(!stale.is_connected());
    assert_eq!(fixture.connector.attempts(), 2);
    assert_eq!(bridge.input_stream(), Some(input));
    assert_eq!(
        bridge.call_state_history(),
        vec![
            CallState::Started,
            CallState::AudioPublished,
            CallState::Reconnecting,
            CallState::Started,
            CallState::AudioPublished
        ]
    );
}

#[tokio::test]
async fn audio_reconnect_requires_session() {
    let fixture = Fixture::new();
    let bridge = fixture.audio();
    assert_eq!(bridge.reconnect().await, Err(BridgeError::NotInSession));
}

#[tokio::test]
async fn change_input_device_before_join_is_remembered() {
    let fixture = Fixture::new();
    let bridge = fixture.audio();

    let result = bridge
        .change_input_device(InputDevice::from("mic-2"))
        .await
        .unwrap();
    assert!(result.is_none());
    assert!(fixture.devices.requests().is_empty());

    bridge.join_session(&session(), None).await.unwrap();
    assert_eq!(
        bridge.input_stream().unwrap().device_id().as_deref(),
        Some("mic-2")
    );
}

#[tokio::test]
async fn signal_tones_are_validated_and_sent() {
    let fixture = Fixture::new();
    let bridge = fixture.audio();

    assert_eq!(
        bridge.send_signal_tone("1").await,
        Err(BridgeError::NotInSession)
    );

    bridge.join_session(&session(), None).await.unwrap();
    bridge.send_signal_tone("12#*,").await.unwrap();
    bridge.send_signal_tone("d").await.unwrap();

    assert_eq!(
        bridge.send_signal_tone("12x").await,
        Err(BridgeError::InvalidTone("12X".to_string()))
    );
    assert!(matches!(
        bridge.send_signal_tone("").await,
        Err(BridgeError::InvalidTone(_))
    ));

    let connection = fixture.connector.last_connection().unwrap();
    assert_eq!(
        connection.sent_dtmf(),
        vec!["12#*,".to_string(), "D".to_string()]
    );
}

#[tokio::test]
async fn mute_without_session_is_a_noop() {
    let fixture = Fixture::new();
    let mut rx = fixture.events.subscribe();
    let bridge = fixture.audio();

    let outcome = bridge.set_sender_track_enabled(false);

    assert_eq!(outcome.enabled_count + outcome.disabled_count, 0);
    assert!(bridge.is_muted());
    assert!(matches!(
        rx.recv().await.unwrap(),
        BridgeEvent::EnforcementSkipped { .. }
    ));
}

#[tokio::test]
async fn muted_before_join_joins_muted() {
    let fixture = Fixture::new();
    let bridge = fixture.audio();
    bridge.set_muted(true);

    bridge.join_session(&session(), None).await.unwrap();

    let connection = fixture.connector.last_connection().unwrap();
    let track = connection.senders()[0].track().unwrap();
    assert!(!track.enabled());
}

#[tokio::test]
async fn autoplay_blocked_is_reported_once() {
    let fixture = Fixture::new();
    let bridge = fixture.audio();
    bridge.join_session(&session(), None).await.unwrap();
    let mut rx = fixture.events.subscribe();

    bridge.report_autoplay_blocked();
    bridge.report_autoplay_blocked();

    assert_eq!(
        rx.recv().await.unwrap(),
        BridgeEvent::CallStateChanged {
            bridge: BridgeKind::Audio,
            state: CallState::AutoplayBlocked,
        }
    );
    assert!(rx.try_recv().is_err());
}

// ============================================================================
// Screen share bridge
// ============================================================================

#[tokio::test]
async fn screen_share_join_and_exit() {
    let fixture = Fixture::new();
    let bridge = fixture.screen_share();

    bridge
        .join_session(&session(), Some(InputDevice::from("window:42")))
        .await
        .unwrap();

    let shared = bridge.shared_stream().unwrap();
    assert_eq!(shared.device_id().as_deref(), Some("window:42"));
    assert_eq!(fixture.connector.requests()[0].kind, MediaKind::Video);
    assert_eq!(bridge.call_state(), Some(CallState::Started));
    assert!(!bridge.supports_transparent_listen_only());

    bridge.exit_session().await.unwrap();
    assert!(!shared.is_active());
    assert_eq!(bridge.call_state(), Some(CallState::Ended));
}

#[tokio::test]
async fn screen_share_rejects_listen_only() {
    let fixture = Fixture::new();
    let bridge = fixture.screen_share();

    let result = bridge
        .join_session(&session(), Some(InputDevice::ListenOnly))
        .await;

    assert!(matches!(result, Err(BridgeError::Device(_))));
    assert_eq!(bridge.call_state(), Some(CallState::Failed));
}

#[tokio::test(start_paused = true)]
async fn screen_share_retries_negotiation() {
    let fixture = Fixture::new();
    fixture.connector.fail_next_connects(
        1,
        TransportError::ConnectFailed("negotiation failed".to_string()),
    );
    let bridge = fixture.screen_share();

    bridge.join_session(&session(), None).await.unwrap();

    assert_eq!(fixture.connector.attempts(), 2);
    assert_eq!(
        bridge.call_state_history(),
        vec![CallState::Reconnecting, CallState::Started]
    );
}

#[tokio::test]
async fn screen_share_reports_unsupported_operations() {
    let fixture = Fixture::new();
    let mut rx = fixture.events.subscribe();
    let bridge = fixture.screen_share();

    let result = bridge
        .change_input_device(InputDevice::from("mic-1"))
        .await;
    assert_eq!(
        result,
        Err(BridgeError::CapabilityUnsupported {
            bridge: BridgeKind::ScreenShare,
            operation: "change_input_device",
        })
    );
    assert_eq!(
        rx.recv().await.unwrap(),
        BridgeEvent::CapabilityUnsupported {
            bridge: BridgeKind::ScreenShare,
            operation: "change_input_device".to_string(),
        }
    );

    let result = bridge.send_signal_tone("1").await;
    assert!(matches!(
        result,
        Err(BridgeError::CapabilityUnsupported {
            operation: "send_signal_tone",
            ..
        })
    ));
}

#[tokio::test]
async fn screen_share_switches_source_live() {
    let fixture = Fixture::new();
    let bridge = fixture.screen_share();
    bridge.join_session(&session(), None).await.unwrap();
    assert_eq!(
        bridge.shared_stream().unwrap().device_id().as_deref(),
        Some("screen:0")
    );

    let stream = bridge
        .live_change_input_device(InputDevice::from("window:42"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(stream.device_id().as_deref(), Some("window:42"));
    let connection = fixture.connector.last_connection().unwrap();
    let bound = connection.senders()[0].track().unwrap();
    assert_eq!(bound.kind(), MediaKind::Video);
    assert_eq!(bound.device_id(), "window:42");
    assert_eq!(fixture.devices.live_tracks_on("screen:0"), 0);
}

// ============================================================================
// Lifecycle serialization
// ============================================================================

fn drain(rx: &mut tokio::sync::broadcast::Receiver<BridgeEvent>) -> Vec<BridgeEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test(start_paused = true)]
async fn exit_waits_for_in_flight_switch() {
    let fixture = Fixture::new();
    let bridge = fixture.audio();
    bridge.join_session(&session(), None).await.unwrap();
    fixture
        .devices
        .set_acquire_delay(Some(Duration::from_millis(200)));
    let mut rx = fixture.events.subscribe();

    let (switched, exited) = tokio::join!(
        bridge.live_change_input_device(InputDevice::from("mic-2")),
        bridge.exit_session()
    );

    let stream = switched.unwrap().unwrap();
    assert_eq!(stream.device_id().as_deref(), Some("mic-2"));
    exited.unwrap();

    let events = drain(&mut rx);
    assert!(events.iter().all(|e| !matches!(
        e,
        BridgeEvent::RollbackFailed { .. } | BridgeEvent::DeviceSwitchFailed { .. }
    )));
    assert!(bridge.switch_controller().last_failure().is_none());
    assert_eq!(fixture.devices.live_tracks_on("mic-1"), 0);
    assert_eq!(fixture.devices.live_tracks_on("mic-2"), 0);
    assert!(!fixture.connector.last_connection().unwrap().is_connected());
    assert_eq!(bridge.call_state(), Some(CallState::Ended));
}

#[tokio::test]
async fn switch_after_exit_reports_not_in_session() {
    let fixture = Fixture::new();
    let bridge = fixture.audio();
    bridge.join_session(&session(), None).await.unwrap();
    let mut rx = fixture.events.subscribe();

    let (exited, switched) = tokio::join!(
        bridge.exit_session(),
        bridge.live_change_input_device(InputDevice::from("mic-2"))
    );

    exited.unwrap();
    assert_eq!(switched, Err(BridgeError::NotInSession));
    assert_eq!(fixture.devices.requests().len(), 1);
    assert!(drain(&mut rx)
        .iter()
        .all(|e| e.severity() < mediabridge_core::Severity::Error));
}

#[tokio::test(start_paused = true)]
async fn concurrent_audio_joins_open_one_connection() {
    let fixture = Fixture::new();
    fixture
        .devices
        .set_acquire_delay(Some(Duration::from_millis(200)));
    let bridge = fixture.audio();

    let (session_a, session_b) = (session(), session());
    let (first, second) = tokio::join!(
        bridge.join_session(&session_a, None),
        bridge.join_session(&session_b, None)
    );

    first.unwrap();
    second.unwrap();
    assert_eq!(fixture.connector.attempts(), 1);
    assert_eq!(fixture.devices.requests().len(), 1);
    assert_eq!(fixture.devices.live_tracks_on("mic-1"), 1);

    bridge.exit_session().await.unwrap();
    assert!(!fixture.connector.last_connection().unwrap().is_connected());
    assert_eq!(fixture.devices.live_tracks_on("mic-1"), 0);
}

#[tokio::test(start_paused = true)]
async fn concurrent_screen_share_joins_open_one_connection() {
    let fixture = Fixture::new();
    fixture
        .devices
        .set_acquire_delay(Some(Duration::from_millis(200)));
    let bridge = fixture.screen_share();

    let (session_a, session_b) = (session(), session());
    let (first, second) = tokio::join!(
        bridge.join_session(&session_a, None),
        bridge.join_session(&session_b, None)
    );

    first.unwrap();
    second.unwrap();
    assert_eq!(fixture.connector.attempts(), 1);
    assert_eq!(fixture.devices.live_tracks_on("screen:0"), 1);
}
