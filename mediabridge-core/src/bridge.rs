//! Common capability surface of every media bridge
//!
//! Concrete bridges implement the required accessors and whichever session
//! operations their transport supports. Operations a bridge does not
//! implement fail loudly with [`BridgeError::CapabilityUnsupported`]. The
//! live device switch and sender track enforcement are provided here once
//! and shared by all bridges.

use crate::backoff::ReconnectSchedule;
use crate::config::ReconnectSettings;
use crate::enforcer::{self, TrackEnableOutcome};
use crate::events::{BridgeEvent, EventBus};
use crate::ice::IceServerProvider;
use crate::media::{DeviceError, InputDevice, MediaAcquisition, MediaStream};
use crate::peer::{ConnectRequest, PeerConnectionHandle, PeerConnector, TransportError};
use crate::switcher::DeviceSwitchController;
use crate::types::{BridgeKind, CallState, MediaKind, SessionContext};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;

/// Bridge errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// Media acquisition failed
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// The connection layer failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A device switch failed and restoring the previous input failed too
    #[error("Rollback failed after {cause}: {recovery}")]
    RollbackFailed {
        /// Error that triggered the rollback
        cause: Box<BridgeError>,
        /// Error raised while restoring the previous input
        recovery: Box<BridgeError>,
    },

    /// The bridge does not implement the operation
    #[error("{bridge} bridge does not support {operation}")]
    CapabilityUnsupported {
        /// Bridge that was invoked
        bridge: BridgeKind,
        /// Operation name
        operation: &'static str,
    },

    /// Every connection attempt failed
    #[error("Connection failed after {attempts} attempts: {last_error}")]
    ConnectionFailed {
        /// Attempts made
        attempts: u32,
        /// Error of the last attempt
        last_error: TransportError,
    },

    /// The operation needs a live session
    #[error("Bridge is not in a session")]
    NotInSession,

    /// Signal tone string contains unsupported characters
    #[error("Invalid signal tones: {0:?}")]
    InvalidTone(String),
}

impl BridgeError {
    /// Whether the user may have been left without audio input
    #[must_use]
    pub fn is_rollback_failure(&self) -> bool {
        matches!(self, Self::RollbackFailed { .. })
    }
}

/// External seams a bridge is built from
#[derive(Clone)]
pub struct BridgeServices {
    /// Local media acquisition
    pub acquisition: Arc<dyn MediaAcquisition>,
    /// Connection factory
    pub connector: Arc<dyn PeerConnector>,
    /// ICE server provider shared by all bridges of one client
    pub ice: Arc<IceServerProvider>,
    /// Event channel shared by all bridges of one client
    pub events: EventBus,
}

impl std::fmt::Debug for BridgeServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeServices")
            .field("ice", &self.ice)
            .finish_non_exhaustive()
    }
}

/// Media bridge contract
#[async_trait]
pub trait MediaBridge: Send + Sync {
    /// Transport this bridge publishes over
    fn kind(&self) -> BridgeKind;

    /// Controller owning the current input stream
    fn switch_controller(&self) -> &DeviceSwitchController;

    /// Active connection, if in a session
    fn peer_connection(&self) -> Option<Arc<dyn PeerConnectionHandle>>;

    /// Event channel of this bridge
    fn events(&self) -> &EventBus;

    /// Whether the bridge can drop to listen-only without visibly leaving the session
    fn supports_transparent_listen_only(&self) -> bool {
        false
    }

    /// Join a session, publishing from `input` (`None` = preferred or default device)
    ///
    /// # Errors
    ///
    /// Returns error if media cannot be acquired or no connection can be established
    async fn join_session(
        &self,
        _session: &SessionContext,
        _input: Option<InputDevice>,
    ) -> Result<(), BridgeError> {
        Err(capability_unsupported(self, "join_session"))
    }

    /// Leave the session, closing the connection and releasing local media
    ///
    /// # Errors
    ///
    /// Returns error if the bridge cannot leave cleanly
    async fn exit_session(&self) -> Result<(), BridgeError> {
        Err(capability_unsupported(self, "exit_session"))
    }

    /// Change the input device, switching live if in a session
    ///
    /// # Errors
    ///
    /// Returns the switch error after rollback
    async fn change_input_device(
        &self,
        _device: InputDevice,
    ) -> Result<Option<MediaStream>, BridgeError> {
        Err(capability_unsupported(self, "change_input_device"))
    }

    /// Hand a complete stream to the connection as its outbound input
    ///
    /// # Errors
    ///
    /// Returns error if the connection rejects the stream
    async fn set_input_stream(&self, _stream: &MediaStream) -> Result<(), BridgeError> {
        Err(capability_unsupported(self, "set_input_stream"))
    }

    /// Send in-band signal tones
    ///
    /// # Errors
    ///
    /// Returns error if the tones are invalid or cannot be sent
    async fn send_signal_tone(&self, _tones: &str) -> Result<(), BridgeError> {
        Err(capability_unsupported(self, "send_signal_tone"))
    }

    /// Switch the active input device without renegotiating
    ///
    /// See [`DeviceSwitchController::live_change_input_device`].
    ///
    /// # Errors
    ///
    /// Returns the triggering error after rollback
    async fn live_change_input_device(
        &self,
        device: InputDevice,
    ) -> Result<Option<MediaStream>, BridgeError> {
        self.switch_controller()
            .live_change_input_device(self, device)
            .await
    }

    /// Enable or disable every outbound audio track
    ///
    /// The value is remembered and re-applied after later device switches.
    fn set_sender_track_enabled(&self, should_enable: bool) -> TrackEnableOutcome {
        self.switch_controller().set_desired_enabled(should_enable);
        let connection = self.peer_connection();
        enforcer::set_sender_track_enabled(connection.as_deref(), should_enable, self.events())
    }
}

/// Report and build a [`BridgeError::CapabilityUnsupported`]
pub(crate) fn capability_unsupported<B: MediaBridge + ?Sized>(
    bridge: &B,
    operation: &'static str,
) -> BridgeError {
    let kind = bridge.kind();
    tracing::error!(bridge = %kind, operation, "Bridge operation is not implemented");
    bridge.events().publish(BridgeEvent::CapabilityUnsupported {
        bridge: kind,
        operation: operation.to_string(),
    });
    BridgeError::CapabilityUnsupported {
        bridge: kind,
        operation,
    }
}

/// Call state of one bridge with its transition history
#[derive(Debug)]
pub(crate) struct CallStateTracker {
    bridge: BridgeKind,
    history: RwLock<Vec<CallState>>,
    events: EventBus,
}

impl CallStateTracker {
    pub(crate) fn new(bridge: BridgeKind, events: EventBus) -> Self {
        Self {
            bridge,
            history: RwLock::new(Vec::new()),
            events,
        }
    }

    pub(crate) fn current(&self) -> Option<CallState> {
        self.history.read().last().copied()
    }

    pub(crate) fn history(&self) -> Vec<CallState> {
        self.history.read().clone()
    }

    /// Record `state`, publishing only if it differs from the current one
    pub(crate) fn transition(&self, state: CallState) {
        {
            let mut history = self.history.write();
            if history.last() == Some(&state) {
                return;
            }
            history.push(state);
        }
        tracing::info!(bridge = %self.bridge, state = ?state, "Call state changed");
        self.events.publish(BridgeEvent::CallStateChanged {
            bridge: self.bridge,
            state,
        });
    }
}

/// Open a connection, retrying with backoff until the attempt budget is spent
///
/// Each attempt asks the provider for ICE servers, which is free while the
/// cached set is valid. `Reconnecting` is reported before every retry.
pub(crate) async fn connect_with_retries(
    connector: &dyn PeerConnector,
    ice: &IceServerProvider,
    reconnect: &ReconnectSettings,
    call_state: &CallStateTracker,
    session: &SessionContext,
    input_stream: Option<MediaStream>,
    kind: MediaKind,
) -> Result<Arc<dyn PeerConnectionHandle>, BridgeError> {
    let mut schedule = ReconnectSchedule::new(reconnect.policy(), reconnect.max_attempts);
    let mut last_error = TransportError::NotConnected;

    while schedule.begin_attempt() {
        let request = ConnectRequest {
            session: session.clone(),
            ice_servers: ice.get_ice_servers(&session.session_token).await,
            input_stream: input_stream.clone(),
            kind,
        };

        match connector.connect(request).await {
            Ok(connection) => return Ok(connection),
            Err(e) => last_error = e,
        }

        let Some(delay) = schedule.next_delay() else {
            break;
        };
        tracing::warn!(
            bridge = %call_state.bridge,
            attempt = schedule.attempts(),
            max_attempts = schedule.max_attempts(),
            ?delay,
            error = %last_error,
            "Connection attempt failed, retrying"
        );
        call_state.transition(CallState::Reconnecting);
        tokio::time::sleep(delay).await;
    }

    tracing::error!(
        bridge = %call_state.bridge,
        attempts = schedule.attempts(),
        error = %last_error,
        "Connection failed, giving up"
    );
    Err(BridgeError::ConnectionFailed {
        attempts: schedule.attempts(),
        last_error,
    })
}
