//! Live input device switching with rollback
//!
//! A switch runs `Acquiring -> Swapping -> Settling -> Committed`, or ends in
//! `RolledBack` when any step fails. Platforms serialize device ownership, so
//! the current stream is cloned into a backup and stopped before the new
//! device is opened. On failure the backup is restored as the input; if that
//! fails as well the user is left without input and a critical
//! [`BridgeEvent::RollbackFailed`] is published. The caller always receives
//! the error that triggered the rollback.
//!
//! Switches on one controller are serialized: a second request waits for the
//! first to commit or roll back and then runs against the resulting stream.
//! Joining, leaving and reconnecting take the same guard through
//! [`DeviceSwitchController::quiesce`].
//!
//! Convergence of sender track state relies on the connection resolving
//! [`crate::bridge::MediaBridge::set_input_stream`] only once the replacement
//! is committed. One enforcement pass runs right after it, and a single
//! safety-net pass runs later unless a newer switch has started by then.

use crate::bridge::{BridgeError, MediaBridge};
use crate::enforcer::set_sender_track_enabled;
use crate::events::{BridgeEvent, EventBus};
use crate::media::{
    AudioProcessing, DeviceError, InputDevice, MediaAcquisition, MediaConstraints, MediaStream,
};
use crate::peer::PeerConnectionHandle;
use crate::types::BridgeKind;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

/// Progress of the most recent switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SwitchPhase {
    /// No switch has run yet
    Idle,
    /// Opening the new device
    Acquiring,
    /// Handing the new stream to the connection
    Swapping,
    /// Enforcing sender track state and releasing the backup
    Settling,
    /// The new input (or listen-only) is current
    Committed,
    /// The switch failed; the previous input was restored if possible
    RolledBack,
}

/// Owner of a bridge's current input stream
pub struct DeviceSwitchController {
    bridge: BridgeKind,
    acquisition: Arc<dyn MediaAcquisition>,
    processing: AudioProcessing,
    current: RwLock<Option<MediaStream>>,
    phase: RwLock<SwitchPhase>,
    last_failure: RwLock<Option<BridgeError>>,
    in_flight: Mutex<()>,
    generation: Arc<AtomicU64>,
    desired_enabled: Arc<AtomicBool>,
    safety_net_delay: Duration,
    events: EventBus,
}

impl DeviceSwitchController {
    /// Create a controller with no current input
    #[must_use]
    pub fn new(
        bridge: BridgeKind,
        acquisition: Arc<dyn MediaAcquisition>,
        processing: AudioProcessing,
        safety_net_delay: Duration,
        events: EventBus,
    ) -> Self {
        Self {
            bridge,
            acquisition,
            processing,
            current: RwLock::new(None),
            phase: RwLock::new(SwitchPhase::Idle),
            last_failure: RwLock::new(None),
            in_flight: Mutex::new(()),
            generation: Arc::new(AtomicU64::new(0)),
            desired_enabled: Arc::new(AtomicBool::new(true)),
            safety_net_delay,
            events,
        }
    }

    /// Current input stream, `None` in listen-only mode
    #[must_use]
    pub fn current_stream(&self) -> Option<MediaStream> {
        self.current.read().clone()
    }

    /// Phase of the most recent switch
    #[must_use]
    pub fn phase(&self) -> SwitchPhase {
        *self.phase.read()
    }

    /// Error of the most recent failed switch
    ///
    /// A failed rollback is reported as [`BridgeError::RollbackFailed`].
    #[must_use]
    pub fn last_failure(&self) -> Option<BridgeError> {
        self.last_failure.read().clone()
    }

    /// Last requested enabled value for outbound audio
    #[must_use]
    pub fn desired_enabled(&self) -> bool {
        self.desired_enabled.load(Ordering::Acquire)
    }

    /// Remember the requested enabled value for later enforcement passes
    pub fn set_desired_enabled(&self, enabled: bool) {
        self.desired_enabled.store(enabled, Ordering::Release);
    }

    /// Constraints for opening `device_id` on this bridge
    #[must_use]
    pub fn constraints_for(&self, device_id: Option<&str>) -> MediaConstraints {
        let device_id = device_id.map(str::to_string);
        match self.bridge {
            BridgeKind::Audio => MediaConstraints::audio(device_id, self.processing),
            BridgeKind::ScreenShare => MediaConstraints::display(device_id),
        }
    }

    /// Open a device, forcing its live tracks enabled
    ///
    /// # Errors
    ///
    /// Returns the acquisition error
    pub async fn acquire(&self, device_id: Option<&str>) -> Result<MediaStream, DeviceError> {
        let stream = self.acquisition.acquire(&self.constraints_for(device_id)).await?;
        stream.enable_live_tracks();
        Ok(stream)
    }

    /// Make `stream` the current input, stopping the one it supersedes
    pub fn adopt(&self, stream: MediaStream) {
        let previous = self.current.write().replace(stream.clone());
        if let Some(previous) = previous.filter(|p| *p != stream) {
            previous.stop_all();
        }
    }

    /// Wait for an in-flight switch and hold off new ones
    ///
    /// Pending safety-net passes are cancelled. Bridges hold the returned
    /// guard while joining, leaving or reconnecting so no switch observes a
    /// half-built or torn-down connection.
    pub async fn quiesce(&self) -> MutexGuard<'_, ()> {
        let guard = self.in_flight.lock().await;
        self.generation.fetch_add(1, Ordering::AcqRel);
        guard
    }

    /// Stop and drop the current input
    ///
    /// Callers hold the [`Self::quiesce`] guard.
    pub(crate) fn stop_current(&self) {
        let previous = self.current.write().take();
        if let Some(stream) = previous {
            stream.stop_all();
        }
    }

    /// Switch the input of `bridge` to `device`
    ///
    /// Returns the new current stream, or `None` after switching to listen-only.
    ///
    /// # Errors
    ///
    /// Returns the acquisition or connection error that aborted the switch,
    /// after the previous input has been restored (or, failing that, released).
    #[tracing::instrument(skip(self, bridge, device), fields(bridge = %self.bridge, device = %device))]
    pub async fn live_change_input_device<B: MediaBridge + ?Sized>(
        &self,
        bridge: &B,
        device: InputDevice,
    ) -> Result<Option<MediaStream>, BridgeError> {
        let _guard = self.in_flight.lock().await;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        match device {
            InputDevice::ListenOnly => {
                self.enter_listen_only();
                Ok(None)
            }
            InputDevice::Device(_) if bridge.peer_connection().is_none() => {
                tracing::debug!(bridge = %self.bridge, "No session to switch input for");
                Err(BridgeError::NotInSession)
            }
            InputDevice::Device(device_id) => self
                .switch_to(bridge, &device_id, generation)
                .await
                .map(Some),
        }
    }

    fn enter_listen_only(&self) {
        let previous = self.current.write().take();
        if let Some(stream) = previous {
            stream.stop_and_detach_all();
        }
        self.set_phase(SwitchPhase::Committed);
        tracing::info!(bridge = %self.bridge, "Switched to listen-only");
        self.events.publish(BridgeEvent::DeviceSwitched {
            bridge: self.bridge,
            device_id: None,
        });
    }

    async fn switch_to<B: MediaBridge + ?Sized>(
        &self,
        bridge: &B,
        device_id: &str,
        generation: u64,
    ) -> Result<MediaStream, BridgeError> {
        self.set_phase(SwitchPhase::Acquiring);

        let backup = match self.current_stream() {
            Some(current) if current.is_active() => {
                let backup = current.clone_stream();
                current.stop_all();
                Some(backup)
            }
            _ => None,
        };

        let stream = match self.acquire(Some(device_id)).await {
            Ok(stream) => stream,
            Err(e) => {
                return Err(self
                    .roll_back(bridge, device_id, None, backup, e.into())
                    .await)
            }
        };

        self.set_phase(SwitchPhase::Swapping);
        if let Err(e) = bridge.set_input_stream(&stream).await {
            return Err(self
                .roll_back(bridge, device_id, Some(stream), backup, e)
                .await);
        }

        self.set_phase(SwitchPhase::Settling);
        stream.enable_live_tracks();
        let connection = bridge.peer_connection();
        set_sender_track_enabled(
            connection.as_deref(),
            self.desired_enabled(),
            &self.events,
        );
        self.schedule_safety_net(connection, generation);

        if let Some(backup) = backup.filter(MediaStream::is_active) {
            backup.stop_all();
        }
        self.adopt(stream.clone());
        self.set_phase(SwitchPhase::Committed);

        tracing::info!(bridge = %self.bridge, device_id, "Input device switched");
        self.events.publish(BridgeEvent::DeviceSwitched {
            bridge: self.bridge,
            device_id: Some(device_id.to_string()),
        });
        Ok(stream)
    }

    async fn roll_back<B: MediaBridge + ?Sized>(
        &self,
        bridge: &B,
        device_id: &str,
        tentative: Option<MediaStream>,
        backup: Option<MediaStream>,
        error: BridgeError,
    ) -> BridgeError {
        if let Some(tentative) = tentative {
            tentative.stop_all();
        }

        let Some(backup) = backup.filter(MediaStream::is_active) else {
            self.finish_rollback(device_id, &error);
            return error;
        };

        match bridge.set_input_stream(&backup).await {
            Ok(()) => {
                backup.enable_live_tracks();
                let connection = bridge.peer_connection();
                set_sender_track_enabled(
                    connection.as_deref(),
                    self.desired_enabled(),
                    &self.events,
                );
                self.adopt(backup);
                self.finish_rollback(device_id, &error);
            }
            Err(recovery) => {
                backup.stop_all();
                if let Some(current) = self.current.write().take() {
                    current.stop_all();
                }
                self.set_phase(SwitchPhase::RolledBack);
                tracing::error!(
                    bridge = %self.bridge,
                    device_id,
                    error = %error,
                    recovery_error = %recovery,
                    "Rollback failed, no input stream left"
                );
                self.events.publish(BridgeEvent::RollbackFailed {
                    bridge: self.bridge,
                    device_id: device_id.to_string(),
                    error: error.to_string(),
                    recovery_error: recovery.to_string(),
                });
                *self.last_failure.write() = Some(BridgeError::RollbackFailed {
                    cause: Box::new(error.clone()),
                    recovery: Box::new(recovery),
                });
            }
        }
        error
    }

    fn finish_rollback(&self, device_id: &str, error: &BridgeError) {
        self.set_phase(SwitchPhase::RolledBack);
        tracing::warn!(bridge = %self.bridge, device_id, error = %error, "Input device switch failed");
        self.events.publish(BridgeEvent::DeviceSwitchFailed {
            bridge: self.bridge,
            device_id: device_id.to_string(),
            error: error.to_string(),
        });
        *self.last_failure.write() = Some(error.clone());
    }

    fn schedule_safety_net(
        &self,
        connection: Option<Arc<dyn PeerConnectionHandle>>,
        generation: u64,
    ) {
        let Some(connection) = connection else {
            return;
        };
        let current_generation = Arc::clone(&self.generation);
        let desired_enabled = Arc::clone(&self.desired_enabled);
        let events = self.events.clone();
        let delay = self.safety_net_delay;
        let bridge = self.bridge;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if current_generation.load(Ordering::Acquire) != generation {
                tracing::debug!(%bridge, generation, "Newer switch started, skipping safety-net pass");
                return;
            }
            set_sender_track_enabled(
                Some(connection.as_ref()),
                desired_enabled.load(Ordering::Acquire),
                &events,
            );
        });
    }

    fn set_phase(&self, phase: SwitchPhase) {
        tracing::trace!(bridge = %self.bridge, ?phase, "Switch phase");
        *self.phase.write() = phase;
    }
}

impl std::fmt::Debug for DeviceSwitchController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSwitchController")
            .field("bridge", &self.bridge)
            .field("phase", &self.phase())
            .field("current", &self.current.read().as_ref().map(MediaStream::id))
            .field("desired_enabled", &self.desired_enabled())
            .finish_non_exhaustive()
    }
}
