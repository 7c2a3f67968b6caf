//! Mediabridge - client-side media session engine
//!
//! This library is the control layer between a conferencing client and its
//! peer connections. It features:
//!
//! - **Live Device Switching**: Swap the input device without renegotiation, with rollback
//! - **Sender Track Consistency**: Idempotent enforcement of outbound track state
//! - **ICE Server Provider**: Cached relay credentials with expiry, timeout and fallback
//! - **Reconnection Backoff**: Bounded multiplicative retry schedule
//! - **Bridges**: Audio and screen share bridges behind one [`MediaBridge`] contract
//!
//! Platform media, the peer connection and the ICE endpoint are external seams
//! ([`MediaAcquisition`], [`PeerConnector`], [`IceServerSource`]); the [`sim`]
//! module provides in-memory versions of all of them.
//!
//! # Examples
//!
//! ```rust,no_run
//! use mediabridge_core::prelude::*;
//! use mediabridge_core::sim::{SimulatedConnector, SimulatedIceServerSource, SimulatedMediaDevices};
//! use std::sync::Arc;
//!
//! # async fn example(settings: BridgeSettings) -> Result<(), BridgeError> {
//! let events = EventBus::default();
//! let ice = IceServerProvider::new(
//!     Arc::new(SimulatedIceServerSource::new(IceServerPayload::default())),
//!     settings.ice.fetch_timeout(),
//!     settings.ice.fallback_stun_address.clone(),
//! )
//! .with_events(events.clone());
//!
//! let bridge = AudioBridge::new(
//!     &settings,
//!     BridgeServices {
//!         acquisition: Arc::new(SimulatedMediaDevices::new().with_microphone("mic-1", "Built-in")),
//!         connector: Arc::new(SimulatedConnector::new()),
//!         ice: Arc::new(ice),
//!         events,
//!     },
//! );
//!
//! let session = SessionContext::new("token", "user-1", "Alice", "73001");
//! bridge.join_session(&session, None).await?;
//!
//! // Stop publishing but keep listening
//! bridge.live_change_input_device(InputDevice::ListenOnly).await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Core identifiers and session types
pub mod types;

/// Bridge event records and the event bus
pub mod events;

/// Settings snapshot
pub mod config;

/// Reconnection backoff
pub mod backoff;

/// Local media streams and acquisition
pub mod media;

/// Connection abstraction
pub mod peer;

/// Sender track consistency enforcement
pub mod enforcer;

/// ICE server acquisition and caching
pub mod ice;

/// Live input device switching
pub mod switcher;

/// Bridge contract
pub mod bridge;

/// Microphone audio bridge
pub mod audio;

/// Screen share bridge
pub mod screenshare;

/// In-memory platform, connection and ICE simulations
pub mod sim;

// Re-export main types at crate root
pub use audio::AudioBridge;
pub use backoff::{BackoffPolicy, ReconnectSchedule};
pub use bridge::{BridgeError, BridgeServices, MediaBridge};
pub use config::{
    BridgeSettings, ConfigError, EnforcementSettings, IceSettings, ReconnectSettings,
};
pub use enforcer::{set_sender_track_enabled, TrackEnableOutcome};
pub use events::{BridgeEvent, EventBus, Severity};
pub use ice::{
    Clock, HttpIceServerSource, IceFetchError, IceServer, IceServerCache, IceServerPayload,
    IceServerProvider, IceServerSet, IceServerSource, StunDescriptor, SystemClock,
    TurnDescriptor,
};
pub use media::{
    AudioProcessing, DeviceError, InputDevice, MediaAcquisition, MediaConstraints, MediaStream,
    MediaStreamTrack, LISTEN_ONLY_DEVICE_ID,
};
pub use peer::{ConnectRequest, PeerConnectionHandle, PeerConnector, RtpSender, TransportError};
pub use screenshare::ScreenShareBridge;
pub use switcher::{DeviceSwitchController, SwitchPhase};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::audio::AudioBridge;
    pub use crate::bridge::{BridgeError, BridgeServices, MediaBridge};
    pub use crate::config::BridgeSettings;
    pub use crate::events::{BridgeEvent, EventBus, Severity};
    pub use crate::ice::{IceServerPayload, IceServerProvider, IceServerSet};
    pub use crate::media::{InputDevice, MediaAcquisition, MediaStream};
    pub use crate::peer::{PeerConnectionHandle, PeerConnector};
    pub use crate::screenshare::ScreenShareBridge;
    pub use crate::types::{BridgeKind, CallState, SessionContext};
}
