//! Microphone audio bridge

use crate::bridge::{
    connect_with_retries, BridgeError, BridgeServices, CallStateTracker, MediaBridge,
};
use crate::config::{BridgeSettings, ReconnectSettings};
use crate::enforcer::set_sender_track_enabled;
use crate::events::EventBus;
use crate::ice::IceServerProvider;
use crate::media::{InputDevice, MediaStream};
use crate::peer::{PeerConnectionHandle, PeerConnector};
use crate::switcher::DeviceSwitchController;
use crate::types::{BridgeKind, CallState, MediaKind, SessionContext};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;

/// Characters accepted as DTMF signal tones
const SIGNAL_TONES: &str = "0123456789*#ABCD,";

/// Publishes microphone audio into a session, or receives only
pub struct AudioBridge {
    connector: Arc<dyn PeerConnector>,
    ice: Arc<IceServerProvider>,
    reconnect: ReconnectSettings,
    transparent_listen_only: bool,
    controller: DeviceSwitchController,
    connection: RwLock<Option<Arc<dyn PeerConnectionHandle>>>,
    session: RwLock<Option<SessionContext>>,
    preferred_input: RwLock<Option<InputDevice>>,
    call_state: CallStateTracker,
    events: EventBus,
}

impl AudioBridge {
    /// Create a bridge that is not yet in a session
    #[must_use]
    pub fn new(settings: &BridgeSettings, services: BridgeServices) -> Self {
        let controller = DeviceSwitchController::new(
            BridgeKind::Audio,
            services.acquisition,
            settings.media,
            settings.enforcement.safety_net_delay(),
            services.events.clone(),
        );
        Self {
            connector: services.connector,
            ice: services.ice,
            reconnect: settings.reconnect.clone(),
            transparent_listen_only: settings.transparent_listen_only,
            controller,
            connection: RwLock::new(None),
            session: RwLock::new(None),
            preferred_input: RwLock::new(None),
            call_state: CallStateTracker::new(BridgeKind::Audio, services.events.clone()),
            events: services.events,
        }
    }

    /// Current call state, `None` before the first join
    #[must_use]
    pub fn call_state(&self) -> Option<CallState> {
        self.call_state.current()
    }

    /// Every call state this bridge went through
    #[must_use]
    pub fn call_state_history(&self) -> Vec<CallState> {
        self.call_state.history()
    }

    /// Session currently joined
    #[must_use]
    pub fn session(&self) -> Option<SessionContext> {
        self.session.read().clone()
    }

    /// Input used by the next join
    #[must_use]
    pub fn preferred_input(&self) -> Option<InputDevice> {
        self.preferred_input.read().clone()
    }

    /// Current input stream, `None` when listening only
    #[must_use]
    pub fn input_stream(&self) -> Option<MediaStream> {
        self.controller.current_stream()
    }

    /// Whether outbound audio is muted
    #[must_use]
    pub fn is_muted(&self) -> bool {
        !self.controller.desired_enabled()
    }

    /// Mute or unmute outbound audio
    pub fn set_muted(&self, muted: bool) {
        self.set_sender_track_enabled(!muted);
    }

    /// Report that remote playback was blocked by the platform's autoplay policy
    pub fn report_autoplay_blocked(&self) {
        self.call_state.transition(CallState::AutoplayBlocked);
    }

    /// Re-establish a lost connection, keeping the current input
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotInSession`] if no session was joined, or
    /// [`BridgeError::ConnectionFailed`] once the attempt budget is spent.
    /// In the latter case the session is abandoned.
    #[tracing::instrument(skip(self))]
    pub async fn reconnect(&self) -> Result<(), BridgeError> {
        let _switch = self.controller.quiesce().await;
        let session = self.session().ok_or(BridgeError::NotInSession)?;
        let stale = self.connection.write().take();
        if let Some(stale) = stale {
            stale.close().await;
        }
        self.call_state.transition(CallState::Reconnecting);

        match self.connect(&session, self.input_stream()).await {
            Ok(connection) => {
                *self.connection.write() = Some(Arc::clone(&connection));
                set_sender_track_enabled(
                    Some(connection.as_ref()),
                    self.controller.desired_enabled(),
                    &self.events,
                );
                tracing::info!("Audio session re-established");
                self.call_state.transition(CallState::Started);
                self.publish_state_for(connection.as_ref());
                Ok(())
            }
            Err(e) => {
                self.controller.stop_current();
                *self.session.write() = None;
                self.call_state.transition(CallState::Failed);
                Err(e)
            }
        }
    }

    fn publish_state_for(&self, connection: &dyn PeerConnectionHandle) {
        let publishing = connection
            .senders()
            .iter()
            .filter(|s| s.kind() == MediaKind::Audio)
            .filter_map(|s| s.track())
            .any(|t| t.is_live());
        if publishing {
            self.call_state.transition(CallState::AudioPublished);
        }
    }

    async fn connect(
        &self,
        session: &SessionContext,
        input_stream: Option<MediaStream>,
    ) -> Result<Arc<dyn PeerConnectionHandle>, BridgeError> {
        connect_with_retries(
            self.connector.as_ref(),
            &self.ice,
            &self.reconnect,
            &self.call_state,
            session,
            input_stream,
            MediaKind::Audio,
        )
        .await
    }
}

#[async_trait]
impl MediaBridge for AudioBridge {
    fn kind(&self) -> BridgeKind {
        BridgeKind::Audio
    }

    fn switch_controller(&self) -> &DeviceSwitchController {
        &self.controller
    }

    fn peer_connection(&self) -> Option<Arc<dyn PeerConnectionHandle>> {
        self.connection.read().clone()
    }

    fn events(&self) -> &EventBus {
        &self.events
    }

    fn supports_transparent_listen_only(&self) -> bool {
        self.transparent_listen_only
    }

    #[tracing::instrument(
        skip(self, session),
        fields(user = %session.user_id, conference = %session.voice_conference_id)
    )]
    async fn join_session(
        &self,
        session: &SessionContext,
        input: Option<InputDevice>,
    ) -> Result<(), BridgeError> {
        let _switch = self.controller.quiesce().await;
        if self.peer_connection().is_some() {
            tracing::debug!("Audio bridge already in a session");
            return Ok(());
        }

        let input = input.or_else(|| self.preferred_input());
        let input_stream = match &input {
            Some(InputDevice::ListenOnly) => None,
            Some(InputDevice::Device(id)) => {
                Some(self.controller.acquire(Some(id.as_str())).await)
            }
            None => Some(self.controller.acquire(None).await),
        }
        .transpose()
        .map_err(|e| {
            self.call_state.transition(CallState::Failed);
            BridgeError::from(e)
        })?;

        let connection = match self.connect(session, input_stream.clone()).await {
            Ok(connection) => connection,
            Err(e) => {
                if let Some(stream) = &input_stream {
                    stream.stop_all();
                }
                self.call_state.transition(CallState::Failed);
                return Err(e);
            }
        };

        if let Some(stream) = input_stream {
            self.controller.adopt(stream);
        }
        *self.connection.write() = Some(Arc::clone(&connection));
        *self.session.write() = Some(session.clone());

        set_sender_track_enabled(
            Some(connection.as_ref()),
            self.controller.desired_enabled(),
            &self.events,
        );

        let listen_only = input == Some(InputDevice::ListenOnly);
        tracing::info!(listen_only, "Joined audio session");
        self.call_state.transition(CallState::Started);
        self.publish_state_for(connection.as_ref());
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn exit_session(&self) -> Result<(), BridgeError> {
        let _switch = self.controller.quiesce().await;
        let connection = self.connection.write().take();
        let Some(connection) = connection else {
            tracing::debug!("Audio bridge not in a session");
            return Ok(());
        };

        connection.close().await;
        self.controller.stop_current();
        *self.session.write() = None;

        tracing::info!("Left audio session");
        self.call_state.transition(CallState::Ended);
        Ok(())
    }

    async fn change_input_device(
        &self,
        device: InputDevice,
    ) -> Result<Option<MediaStream>, BridgeError> {
        if self.peer_connection().is_none() {
            tracing::debug!(%device, "Not in a session, storing preferred input");
            *self.preferred_input.write() = Some(device);
            return Ok(None);
        }

        let stream = self.live_change_input_device(device.clone()).await?;
        *self.preferred_input.write() = Some(device);
        Ok(stream)
    }

    async fn set_input_stream(&self, stream: &MediaStream) -> Result<(), BridgeError> {
        let connection = self.peer_connection().ok_or(BridgeError::NotInSession)?;
        connection.set_input_stream(stream).await?;
        self.controller.adopt(stream.clone());
        self.publish_state_for(connection.as_ref());
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn send_signal_tone(&self, tones: &str) -> Result<(), BridgeError> {
        let tones = tones.to_ascii_uppercase();
        if tones.is_empty() || !tones.chars().all(|c| SIGNAL_TONES.contains(c)) {
            return Err(BridgeError::InvalidTone(tones));
        }
        let connection = self.peer_connection().ok_or(BridgeError::NotInSession)?;
        connection.send_dtmf(&tones).await?;
        tracing::debug!(%tones, "Sent signal tones");
        Ok(())
    }
}

impl std::fmt::Debug for AudioBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioBridge")
            .field("call_state", &self.call_state())
            .field("in_session", &self.peer_connection().is_some())
            .field("controller", &self.controller)
            .finish_non_exhaustive()
    }
}
