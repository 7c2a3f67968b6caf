//! Screen share bridge
//!
//! Publishes one display capture. It has no microphone to switch and no
//! tone channel, so `change_input_device` and `send_signal_tone` keep their
//! unsupported defaults.

use crate::bridge::{
    connect_with_retries, BridgeError, BridgeServices, CallStateTracker, MediaBridge,
};
use crate::config::{BridgeSettings, ReconnectSettings};
use crate::events::EventBus;
use crate::ice::IceServerProvider;
use crate::media::{DeviceError, InputDevice, MediaStream};
use crate::peer::{PeerConnectionHandle, PeerConnector};
use crate::switcher::DeviceSwitchController;
use crate::types::{BridgeKind, CallState, MediaKind, SessionContext};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;

/// Shares a screen or window into a session
pub struct ScreenShareBridge {
    connector: Arc<dyn PeerConnector>,
    ice: Arc<IceServerProvider>,
    reconnect: ReconnectSettings,
    controller: DeviceSwitchController,
    connection: RwLock<Option<Arc<dyn PeerConnectionHandle>>>,
    call_state: CallStateTracker,
    events: EventBus,
}

impl ScreenShareBridge {
    /// Create a bridge that is not sharing yet
    #[must_use]
    pub fn new(settings: &BridgeSettings, services: BridgeServices) -> Self {
        let controller = DeviceSwitchController::new(
            BridgeKind::ScreenShare,
            services.acquisition,
            settings.media,
            settings.enforcement.safety_net_delay(),
            services.events.clone(),
        );
        Self {
            connector: services.connector,
            ice: services.ice,
            reconnect: settings.reconnect.clone(),
            controller,
            connection: RwLock::new(None),
            call_state: CallStateTracker::new(BridgeKind::ScreenShare, services.events.clone()),
            events: services.events,
        }
    }

    /// Current call state, `None` before the first share
    #[must_use]
    pub fn call_state(&self) -> Option<CallState> {
        self.call_state.current()
    }

    /// Every call state this bridge went through
    #[must_use]
    pub fn call_state_history(&self) -> Vec<CallState> {
        self.call_state.history()
    }

    /// Display capture being shared
    #[must_use]
    pub fn shared_stream(&self) -> Option<MediaStream> {
        self.controller.current_stream()
    }
}

#[async_trait]
impl MediaBridge for ScreenShareBridge {
    fn kind(&self) -> BridgeKind {
        BridgeKind::ScreenShare
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

    /// Start sharing `input` (`None` = platform picker default)
    #[tracing::instrument(skip(self, session), fields(user = %session.user_id))]
    async fn join_session(
        &self,
        session: &SessionContext,
        input: Option<InputDevice>,
    ) -> Result<(), BridgeError> {
        let _switch = self.controller.quiesce().await;
        if self.peer_connection().is_some() {
            tracing::debug!("Screen share already running");
            return Ok(());
        }

        let source = match &input {
            Some(InputDevice::ListenOnly) => {
                self.call_state.transition(CallState::Failed);
                return Err(DeviceError::ConstraintsUnsatisfied(
                    "screen share needs a capture source".to_string(),
                )
                .into());
            }
            Some(InputDevice::Device(id)) => Some(id.as_str()),
            None => None,
        };

        let stream = match self.controller.acquire(source).await {
            Ok(stream) => stream,
            Err(e) => {
                self.call_state.transition(CallState::Failed);
                return Err(e.into());
            }
        };

        let connection = match connect_with_retries(
            self.connector.as_ref(),
            &self.ice,
            &self.reconnect,
            &self.call_state,
            session,
            Some(stream.clone()),
            MediaKind::Video,
        )
        .await
        {
            Ok(connection) => connection,
            Err(e) => {
                stream.stop_all();
                self.call_state.transition(CallState::Failed);
                return Err(e);
            }
        };

        self.controller.adopt(stream);
        *self.connection.write() = Some(connection);
        tracing::info!("Screen share started");
        self.call_state.transition(CallState::Started);
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn exit_session(&self) -> Result<(), BridgeError> {
        let _switch = self.controller.quiesce().await;
        let connection = self.connection.write().take();
        let Some(connection) = connection else {
            tracing::debug!("Screen share not running");
            return Ok(());
        };

        connection.close().await;
        self.controller.stop_current();
        tracing::info!("Screen share stopped");
        self.call_state.transition(CallState::Ended);
        Ok(())
    }

    async fn set_input_stream(&self, stream: &MediaStream) -> Result<(), BridgeError> {
        let connection = self.peer_connection().ok_or(BridgeError::NotInSession)?;
        connection.set_input_stream(stream).await?;
        self.controller.adopt(stream.clone());
        Ok(())
    }
}

impl std::fmt::Debug for ScreenShareBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScreenShareBridge")
            .field("call_state", &self.call_state())
            .field("sharing", &self.peer_connection().is_some())
            .finish_non_exhaustive()
    }
}
