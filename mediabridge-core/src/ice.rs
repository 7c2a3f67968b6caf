//! ICE server acquisition and caching
//!
//! [`IceServerProvider::get_ice_servers`] never fails: a fresh cached set is
//! returned without touching the network, otherwise descriptors are fetched
//! under a hard timeout, and on any failure a single fallback reflection
//! server is handed out instead. Failures are kept for diagnostics
//! ([`IceServerProvider::last_error`]) and published as
//! [`BridgeEvent::IceFetchFailed`].
//!
//! TURN credentials follow the REST convention `"<expiry>:<user>"`, where
//! `<expiry>` is a unix timestamp in seconds. The earliest expiry of all
//! credentials in a set gates reuse of the whole set.

use crate::events::{BridgeEvent, EventBus};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// ICE fetch errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IceFetchError {
    /// The fetch did not complete in time
    #[error("ICE server fetch timed out after {0:?}")]
    Timeout(Duration),

    /// Network failure
    #[error("ICE server fetch failed: {0}")]
    Network(String),

    /// Non-success HTTP status
    #[error("ICE server endpoint returned status {0}")]
    Status(u16),

    /// Malformed payload
    #[error("Invalid ICE server payload: {0}")]
    Parse(String),

    /// The payload contained no usable server
    #[error("ICE server payload contained no servers")]
    Empty,
}

/// Reflection server descriptor as served by the endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StunDescriptor {
    /// `stun:` URL
    pub url: String,
}

/// Relay server descriptor as served by the endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnDescriptor {
    /// `turn:`/`turns:` URL
    pub url: String,
    /// `"<expiry>:<user>"` username
    pub username: String,
    /// Credential
    pub password: String,
}

/// Raw endpoint payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServerPayload {
    /// Reflection servers
    #[serde(default)]
    pub stun_servers: Vec<StunDescriptor>,
    /// Relay servers
    #[serde(default)]
    pub turn_servers: Vec<TurnDescriptor>,
}

/// Normalized server entry handed to the connection layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    /// Server URLs
    pub urls: Vec<String>,
    /// Relay username
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Relay credential
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// A complete, immutable ICE configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServerSet {
    /// Servers in endpoint order, reflection servers first
    pub servers: Vec<IceServer>,
    /// Reuse deadline, `None` = valid indefinitely
    pub valid_until: Option<DateTime<Utc>>,
    /// Whether at least one relay server is present
    pub has_relay_credentials: bool,
}

impl IceServerSet {
    /// Single reflection server set used when fetching fails
    #[must_use]
    pub fn fallback(stun_address: &str) -> Self {
        Self {
            servers: vec![IceServer {
                urls: vec![stun_address.to_string()],
                username: None,
                credential: None,
            }],
            valid_until: None,
            has_relay_credentials: false,
        }
    }

    /// Normalize an endpoint payload
    ///
    /// # Errors
    ///
    /// Returns [`IceFetchError::Empty`] if the payload has no servers
    pub fn from_payload(payload: IceServerPayload) -> Result<Self, IceFetchError> {
        let mut valid_until: Option<DateTime<Utc>> = None;
        let has_relay_credentials = !payload.turn_servers.is_empty();

        let mut servers: Vec<IceServer> = payload
            .stun_servers
            .into_iter()
            .map(|stun| IceServer {
                urls: vec![stun.url],
                username: None,
                credential: None,
            })
            .collect();

        for turn in payload.turn_servers {
            match credential_expiry(&turn.username) {
                Some(expiry) => {
                    valid_until = Some(valid_until.map_or(expiry, |current| current.min(expiry)));
                }
                None => {
                    tracing::debug!(url = %turn.url, "TURN username carries no expiry prefix");
                }
            }
            servers.push(IceServer {
                urls: vec![turn.url],
                username: Some(turn.username),
                credential: Some(turn.password),
            });
        }

        if servers.is_empty() {
            return Err(IceFetchError::Empty);
        }

        Ok(Self {
            servers,
            valid_until,
            has_relay_credentials,
        })
    }

    /// Whether the set may still be reused at `now`
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_until.map_or(true, |until| now < until)
    }
}

/// Expiry encoded as the numeric prefix of a TURN REST username
fn credential_expiry(username: &str) -> Option<DateTime<Utc>> {
    let prefix = username.split(':').next()?;
    let seconds: i64 = prefix.trim().parse().ok()?;
    Utc.timestamp_opt(seconds, 0).single()
}

/// Wall clock used to judge cache validity
pub trait Clock: Send + Sync {
    /// Current time
    fn now(&self) -> DateTime<Utc>;
}

/// System wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Where ICE descriptors come from
#[async_trait]
pub trait IceServerSource: Send + Sync {
    /// Fetch the raw descriptors for a session
    ///
    /// # Errors
    ///
    /// Returns error on network, status or payload failure
    async fn fetch(&self, session_token: &str) -> Result<IceServerPayload, IceFetchError>;
}

/// HTTP endpoint source
#[derive(Debug, Clone)]
pub struct HttpIceServerSource {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpIceServerSource {
    /// Create a source for `endpoint`
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(endpoint: impl Into<String>) -> Result<Self, IceFetchError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| IceFetchError::Network(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    /// Endpoint URL
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl IceServerSource for HttpIceServerSource {
    async fn fetch(&self, session_token: &str) -> Result<IceServerPayload, IceFetchError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("sessionToken", session_token)])
            .send()
            .await
            .map_err(|e| IceFetchError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(IceFetchError::Status(status.as_u16()));
        }

        response
            .json::<IceServerPayload>()
            .await
            .map_err(|e| IceFetchError::Parse(e.to_string()))
    }
}

/// Injectable single-slot cache for an [`IceServerSet`]
///
/// Writes replace the whole set; readers see either the old or the new one.
#[derive(Debug, Clone, Default)]
pub struct IceServerCache {
    slot: Arc<RwLock<Option<Arc<IceServerSet>>>>,
}

impl IceServerCache {
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached set, if any
    #[must_use]
    pub fn get(&self) -> Option<Arc<IceServerSet>> {
        self.slot.read().clone()
    }

    /// Replace the cached set
    pub fn store(&self, set: Arc<IceServerSet>) {
        *self.slot.write() = Some(set);
    }

    /// Drop the cached set
    pub fn clear(&self) {
        *self.slot.write() = None;
    }
}

/// Fetches, caches and falls back ICE configurations
pub struct IceServerProvider {
    source: Arc<dyn IceServerSource>,
    clock: Arc<dyn Clock>,
    cache: IceServerCache,
    fetch_timeout: Duration,
    fallback_stun_address: String,
    last_error: RwLock<Option<IceFetchError>>,
    events: EventBus,
}

impl IceServerProvider {
    /// Create a provider with its own cache and the system clock
    #[must_use]
    pub fn new(
        source: Arc<dyn IceServerSource>,
        fetch_timeout: Duration,
        fallback_stun_address: impl Into<String>,
    ) -> Self {
        Self {
            source,
            clock: Arc::new(SystemClock),
            cache: IceServerCache::new(),
            fetch_timeout,
            fallback_stun_address: fallback_stun_address.into(),
            last_error: RwLock::new(None),
            events: EventBus::default(),
        }
    }

    /// Provider built from [`crate::config::IceSettings`] using the HTTP source
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn from_settings(settings: &crate::config::IceSettings) -> Result<Self, IceFetchError> {
        let source = HttpIceServerSource::new(settings.endpoint.clone())?;
        Ok(Self::new(
            Arc::new(source),
            settings.fetch_timeout(),
            settings.fallback_stun_address.clone(),
        ))
    }

    /// Use a different clock
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use a shared cache
    #[must_use]
    pub fn with_cache(mut self, cache: IceServerCache) -> Self {
        self.cache = cache;
        self
    }

    /// Publish diagnostics on `events`
    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Cache used by this provider
    #[must_use]
    pub fn cache(&self) -> &IceServerCache {
        &self.cache
    }

    /// Error of the most recent failed fetch, cleared by the next successful one
    #[must_use]
    pub fn last_error(&self) -> Option<IceFetchError> {
        self.last_error.read().clone()
    }

    /// Drop the cached set so the next call fetches
    pub fn invalidate(&self) {
        self.cache.clear();
    }

    /// Obtain an ICE configuration for a session
    #[tracing::instrument(skip(self, session_token))]
    pub async fn get_ice_servers(&self, session_token: &str) -> IceServerSet {
        if let Some(cached) = self.cache.get() {
            if cached.is_valid_at(self.clock.now()) {
                tracing::trace!("Using cached ICE servers");
                return (*cached).clone();
            }
            tracing::debug!(valid_until = ?cached.valid_until, "Cached ICE servers expired");
        }

        match self.fetch(session_token).await {
            Ok(set) => {
                tracing::info!(
                    servers = set.servers.len(),
                    relay = set.has_relay_credentials,
                    valid_until = ?set.valid_until,
                    "Fetched ICE servers"
                );
                self.cache.store(Arc::new(set.clone()));
                *self.last_error.write() = None;
                set
            }
            Err(e) => {
                tracing::warn!(error = %e, fallback = %self.fallback_stun_address, "ICE server fetch failed, using fallback");
                *self.last_error.write() = Some(e.clone());
                self.events.publish(BridgeEvent::IceFetchFailed {
                    error: e.to_string(),
                    fallback: self.fallback_stun_address.clone(),
                });
                IceServerSet::fallback(&self.fallback_stun_address)
            }
        }
    }

    async fn fetch(&self, session_token: &str) -> Result<IceServerSet, IceFetchError> {
        let payload = tokio::time::timeout(self.fetch_timeout, self.source.fetch(session_token))
            .await
            .map_err(|_| IceFetchError::Timeout(self.fetch_timeout))??;
        IceServerSet::from_payload(payload)
    }
}

impl std::fmt::Debug for IceServerProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IceServerProvider")
            .field("fetch_timeout", &self.fetch_timeout)
            .field("fallback_stun_address", &self.fallback_stun_address)
            .field("cached", &self.cache.get().is_some())
            .finish()
    }
}
