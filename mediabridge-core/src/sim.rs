//! In-memory implementations of every external seam
//!
//! Used by the integration tests and by the `mediabridge simulate` command.
//! Each simulation records what was asked of it and accepts scripted failures,
//! so device switch, rollback and retry paths can be driven deterministically.

use crate::ice::{Clock, IceFetchError, IceServerPayload, IceServerSource};
use crate::media::{
    DeviceError, MediaAcquisition, MediaConstraints, MediaStream, MediaStreamTrack,
};
use crate::peer::{
    replace_senders_from_stream, ConnectRequest, PeerConnectionHandle, PeerConnector, RtpSender,
    TransportError,
};
use crate::types::MediaKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Media devices
// ============================================================================

/// Capture devices backed by memory
///
/// The first registered device of a kind is the platform default.
#[derive(Debug, Default)]
pub struct SimulatedMediaDevices {
    devices: RwLock<Vec<(String, MediaKind, String)>>,
    denied: RwLock<HashSet<String>>,
    failures: Mutex<VecDeque<DeviceError>>,
    issued: Mutex<Vec<MediaStreamTrack>>,
    requests: Mutex<Vec<MediaConstraints>>,
    pre_disabled: AtomicBool,
    delay: RwLock<Option<Duration>>,
}

impl SimulatedMediaDevices {
    /// Create an empty device set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a microphone
    #[must_use]
    pub fn with_microphone(self, device_id: &str, label: &str) -> Self {
        self.add_device(device_id, MediaKind::Audio, label);
        self
    }

    /// Add a screen or window capture source
    #[must_use]
    pub fn with_display(self, source_id: &str, label: &str) -> Self {
        self.add_device(source_id, MediaKind::Video, label);
        self
    }

    /// Register a device
    pub fn add_device(&self, device_id: &str, kind: MediaKind, label: &str) {
        self.devices
            .write()
            .push((device_id.to_string(), kind, label.to_string()));
    }

    /// Unplug a device
    pub fn remove_device(&self, device_id: &str) {
        self.devices.write().retain(|(id, _, _)| id != device_id);
    }

    /// Deny access to a device
    pub fn deny(&self, device_id: &str) {
        self.denied.write().insert(device_id.to_string());
    }

    /// Fail the next acquisition with `error`
    pub fn fail_next_acquire(&self, error: DeviceError) {
        self.failures.lock().push_back(error);
    }

    /// Hand out tracks already disabled
    pub fn set_pre_disabled(&self, pre_disabled: bool) {
        self.pre_disabled.store(pre_disabled, Ordering::Release);
    }

    /// Make every acquisition take `delay` before it resolves
    pub fn set_acquire_delay(&self, delay: Option<Duration>) {
        *self.delay.write() = delay;
    }

    /// Live tracks handed out for `device_id`
    #[must_use]
    pub fn live_tracks_on(&self, device_id: &str) -> usize {
        self.issued
            .lock()
            .iter()
            .filter(|t| t.device_id() == device_id && t.is_live())
            .count()
    }

    /// Successful and failed acquisitions so far
    #[must_use]
    pub fn requests(&self) -> Vec<MediaConstraints> {
        self.requests.lock().clone()
    }

    fn resolve(&self, constraints: &MediaConstraints) -> Result<(String, String), DeviceError> {
        let devices = self.devices.read();
        let found = match &constraints.device_id {
            Some(wanted) => devices
                .iter()
                .find(|(id, kind, _)| id == wanted && *kind == constraints.kind),
            None => devices.iter().find(|(_, kind, _)| *kind == constraints.kind),
        };
        found
            .map(|(id, _, label)| (id.clone(), label.clone()))
            .ok_or_else(|| {
                DeviceError::DeviceNotFound(
                    constraints
                        .device_id
                        .clone()
                        .unwrap_or_else(|| format!("default {:?} device", constraints.kind)),
                )
            })
    }
}

#[async_trait]
impl MediaAcquisition for SimulatedMediaDevices {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaStream, DeviceError> {
        self.requests.lock().push(constraints.clone());

        let delay = *self.delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }
        let (device_id, label) = self.resolve(constraints)?;
        if self.denied.read().contains(&device_id) {
            return Err(DeviceError::Denied(device_id));
        }

        let track = MediaStreamTrack::new(constraints.kind, device_id.clone(), label);
        if self.pre_disabled.load(Ordering::Acquire) {
            track.set_enabled(false);
        }
        self.issued.lock().push(track.clone());
        tracing::debug!(%device_id, kind = ?constraints.kind, "Simulated capture started");
        Ok(MediaStream::new(vec![track]))
    }
}

// ============================================================================
// Peer connection
// ============================================================================

/// Connection backed by memory
#[derive(Debug)]
pub struct SimulatedPeerConnection {
    senders: Vec<RtpSender>,
    connected: AtomicBool,
    input_failures: Mutex<VecDeque<TransportError>>,
    disable_on_attach: AtomicBool,
    input_calls: AtomicUsize,
    dtmf: Mutex<Vec<String>>,
}

impl SimulatedPeerConnection {
    /// Create an open connection with one sender of `kind`
    #[must_use]
    pub fn new(kind: MediaKind) -> Self {
        Self {
            senders: vec![RtpSender::new(kind)],
            connected: AtomicBool::new(true),
            input_failures: Mutex::new(VecDeque::new()),
            disable_on_attach: AtomicBool::new(false),
            input_calls: AtomicUsize::new(0),
            dtmf: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next input stream replacement with `error`
    pub fn fail_next_set_input_stream(&self, error: TransportError) {
        self.input_failures.lock().push_back(error);
    }

    /// Attach replacement tracks disabled, as a racing platform would
    pub fn set_disable_on_attach(&self, disable: bool) {
        self.disable_on_attach.store(disable, Ordering::Release);
    }

    /// Input stream replacements attempted so far
    #[must_use]
    pub fn set_input_stream_calls(&self) -> usize {
        self.input_calls.load(Ordering::Acquire)
    }

    /// DTMF strings sent so far
    #[must_use]
    pub fn sent_dtmf(&self) -> Vec<String> {
        self.dtmf.lock().clone()
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }
}

#[async_trait]
impl PeerConnectionHandle for SimulatedPeerConnection {
    fn senders(&self) -> Vec<RtpSender> {
        self.senders.clone()
    }

    async fn replace_track(
        &self,
        sender: &RtpSender,
        track: Option<MediaStreamTrack>,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        sender.bind(track);
        Ok(())
    }

    async fn set_input_stream(&self, stream: &MediaStream) -> Result<(), TransportError> {
        self.input_calls.fetch_add(1, Ordering::AcqRel);
        self.ensure_open()?;
        if let Some(error) = self.input_failures.lock().pop_front() {
            return Err(error);
        }

        replace_senders_from_stream(self, stream).await?;

        if self.disable_on_attach.load(Ordering::Acquire) {
            for track in self.senders.iter().filter_map(RtpSender::track) {
                track.set_enabled(false);
            }
        }
        Ok(())
    }

    async fn send_dtmf(&self, tones: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.dtmf.lock().push(tones.to_string());
        Ok(())
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::Release);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

/// Connection factory backed by memory
#[derive(Debug, Default)]
pub struct SimulatedConnector {
    failures: Mutex<VecDeque<TransportError>>,
    requests: Mutex<Vec<ConnectRequest>>,
    connections: Mutex<Vec<Arc<SimulatedPeerConnection>>>,
}

impl SimulatedConnector {
    /// Create a connector that always succeeds
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` connection attempts with `error`
    pub fn fail_next_connects(&self, count: usize, error: TransportError) {
        let mut failures = self.failures.lock();
        failures.extend(std::iter::repeat(error).take(count));
    }

    /// Connection attempts so far
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.requests.lock().len()
    }

    /// Requests of every attempt so far
    #[must_use]
    pub fn requests(&self) -> Vec<ConnectRequest> {
        self.requests.lock().clone()
    }

    /// Most recently opened connection
    #[must_use]
    pub fn last_connection(&self) -> Option<Arc<SimulatedPeerConnection>> {
        self.connections.lock().last().cloned()
    }
}

#[async_trait]
impl PeerConnector for SimulatedConnector {
    async fn connect(
        &self,
        request: ConnectRequest,
    ) -> Result<Arc<dyn PeerConnectionHandle>, TransportError> {
        self.requests.lock().push(request.clone());
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }

        let connection = Arc::new(SimulatedPeerConnection::new(request.kind));
        if let Some(stream) = &request.input_stream {
            replace_senders_from_stream(connection.as_ref(), stream).await?;
        }
        self.connections.lock().push(Arc::clone(&connection));
        tracing::debug!(
            servers = request.ice_servers.servers.len(),
            kind = ?request.kind,
            "Simulated connection established"
        );
        Ok(connection)
    }
}

// ============================================================================
// ICE
// ============================================================================

/// ICE source backed by memory
#[derive(Debug)]
pub struct SimulatedIceServerSource {
    response: RwLock<Result<IceServerPayload, IceFetchError>>,
    delay: RwLock<Option<Duration>>,
    fetches: AtomicUsize,
}

impl SimulatedIceServerSource {
    /// Source answering with `payload`
    #[must_use]
    pub fn new(payload: IceServerPayload) -> Self {
        Self {
            response: RwLock::new(Ok(payload)),
            delay: RwLock::new(None),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Source failing with `error`
    #[must_use]
    pub fn failing(error: IceFetchError) -> Self {
        let source = Self::new(IceServerPayload::default());
        source.set_response(Err(error));
        source
    }

    /// Change the scripted response
    pub fn set_response(&self, response: Result<IceServerPayload, IceFetchError>) {
        *self.response.write() = response;
    }

    /// Delay every answer
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.write() = delay;
    }

    /// Fetches started so far
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Acquire)
    }
}

#[async_trait]
impl IceServerSource for SimulatedIceServerSource {
    async fn fetch(&self, _session_token: &str) -> Result<IceServerPayload, IceFetchError> {
        self.fetches.fetch_add(1, Ordering::AcqRel);
        let delay = *self.delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.response.read().clone()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    /// Clock reading `start`
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    /// Move forward by `by`
    pub fn advance(&self, by: Duration) {
        let Ok(delta) = chrono::Duration::from_std(by) else {
            return;
        };
        let mut now = self.now.write();
        if let Some(next) = now.checked_add_signed(delta) {
            *now = next;
        }
    }

    /// Jump to `to`
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.write() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}
