//! # Device Authorization Flow
//!
//! OAuth 2.0 device authorization grant (RFC 8628) against the IAM Identity
//! Center OIDC endpoints.
//!
//! ```text
//! Unregistered -> Registered -> AuthorizationPending -> Authorized
//!                                        |  ^        \-> Denied
//!                                        \--/         \-> Expired
//!                                  pending: sleep interval
//! ```
//!
//! The provider is reached through [`OidcProvider`] and the poll sleep through
//! [`Sleeper`], so the loop runs against fakes in tests. Token exchange answers
//! come back as a tagged [`TokenPoll`] and are dispatched with a `match`.
//!
//! Nothing here is persisted: the client secret, device code and access token
//! live only for the current run.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEVICE_CODE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";
pub const SSO_ACCOUNT_ACCESS_SCOPE: &str = "sso:account:access";
pub const PUBLIC_CLIENT_TYPE: &str = "public";

/// Interval used when the provider does not dictate one (RFC 8628 §3.2).
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Added to the interval on every `slow_down` answer (RFC 8628 §3.5).
pub const SLOW_DOWN_INCREMENT_SECS: u64 = 5;

/// Result of `RegisterClient`.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientRegistration {
    pub client_id: String,
    pub client_secret: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for ClientRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRegistration")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Result of `StartDeviceAuthorization`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceChallenge {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: Option<String>,
    pub expires_in_secs: u64,
    pub interval_secs: u64,
}

/// Everything needed to poll for a token. Created once per login run.
#[derive(Clone)]
pub struct DeviceSession {
    pub client_id: String,
    pub client_secret: String,
    pub device_code: String,
    pub user_code: String,
    /// Shown to the operator verbatim.
    pub verification_url: String,
    pub poll_interval_secs: u64,
    pub expires_at: DateTime<Utc>,
}

impl DeviceSession {
    pub fn new(registration: &ClientRegistration, challenge: DeviceChallenge) -> Self {
        let verification_url = challenge
            .verification_uri_complete
            .filter(|uri| !uri.is_empty())
            .unwrap_or(challenge.verification_uri);
        let poll_interval_secs = if challenge.interval_secs == 0 {
            DEFAULT_POLL_INTERVAL_SECS
        } else {
            challenge.interval_secs
        };

        Self {
            client_id: registration.client_id.clone(),
            client_secret: registration.client_secret.clone(),
            device_code: challenge.device_code,
            user_code: challenge.user_code,
            verification_url,
            poll_interval_secs,
            expires_at: Utc::now() + ChronoDuration::seconds(challenge.expires_in_secs as i64),
        }
    }
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("client_id", &self.client_id)
            .field("user_code", &self.user_code)
            .field("verification_url", &self.verification_url)
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Identity Center access token. Never written to disk.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    token: String,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// One `CreateToken` answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenPoll {
    Issued(AccessToken),
    /// The operator has not finished in the browser yet.
    Pending,
    /// Polling too fast; keep waiting with a longer interval.
    SlowDown,
    Denied(String),
    Expired(String),
    OtherError(String),
}

/// Progress of one login run through the device flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceAuthState {
    #[default]
    Unregistered,
    Registered,
    AuthorizationPending,
    Authorized,
    Denied,
    Expired,
}

#[derive(Debug, Error)]
pub enum DeviceAuthError {
    #[error("client registration failed: {0:#}")]
    Registration(#[source] anyhow::Error),

    #[error("starting device authorization failed: {0:#}")]
    StartAuthorization(#[source] anyhow::Error),

    #[error("device authorization was denied: {0}")]
    Denied(String),

    #[error("device authorization expired before it was approved: {0}")]
    Expired(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("device authorization was cancelled")]
    Cancelled,

    #[error("device authorization is in state {actual:?}, expected {expected:?}")]
    InvalidState {
        expected: DeviceAuthState,
        actual: DeviceAuthState,
    },
}

/// SSO OIDC endpoints used by the device flow.
#[async_trait]
pub trait OidcProvider: Send + Sync {
    async fn register_client(
        &self,
        client_name: &str,
        client_type: &str,
        scopes: &[&str],
    ) -> anyhow::Result<ClientRegistration>;

    async fn start_device_authorization(
        &self,
        registration: &ClientRegistration,
        start_url: &str,
    ) -> anyhow::Result<DeviceChallenge>;

    async fn create_token(&self, session: &DeviceSession) -> TokenPoll;
}

/// Suspension point of the poll loop.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Drives one device authorization from registration to token.
pub struct DeviceAuthorization<'a> {
    provider: &'a dyn OidcProvider,
    sleeper: &'a dyn Sleeper,
    client_name: String,
    state: DeviceAuthState,
}

impl<'a> DeviceAuthorization<'a> {
    pub fn new(provider: &'a dyn OidcProvider, sleeper: &'a dyn Sleeper) -> Self {
        Self {
            provider,
            sleeper,
            client_name: format!("awslogin-{}", uuid::Uuid::new_v4()),
            state: DeviceAuthState::Unregistered,
        }
    }

    pub fn with_client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    pub fn state(&self) -> DeviceAuthState {
        self.state
    }

    /// Register a public client. Not retried: a rejected registration will not
    /// succeed on a second attempt.
    pub async fn register(&mut self) -> Result<ClientRegistration, DeviceAuthError> {
        self.expect_state(DeviceAuthState::Unregistered)?;
        info!("Registering OIDC client {}", self.client_name);

        let registration = self
            .provider
            .register_client(
                &self.client_name,
                PUBLIC_CLIENT_TYPE,
                &[SSO_ACCOUNT_ACCESS_SCOPE],
            )
            .await
            .map_err(DeviceAuthError::Registration)?;

        debug!("Registered client {}", registration.client_id);
        self.state = DeviceAuthState::Registered;
        Ok(registration)
    }

    pub async fn start(
        &mut self,
        registration: &ClientRegistration,
        start_url: &str,
    ) -> Result<DeviceSession, DeviceAuthError> {
        self.expect_state(DeviceAuthState::Registered)?;
        info!("Starting device authorization for {}", start_url);

        let challenge = self
            .provider
            .start_device_authorization(registration, start_url)
            .await
            .map_err(DeviceAuthError::StartAuthorization)?;
        let session = DeviceSession::new(registration, challenge);

        debug!(
            "Device authorization started, interval {}s, expires at {}",
            session.poll_interval_secs, session.expires_at
        );
        self.state = DeviceAuthState::AuthorizationPending;
        Ok(session)
    }

    /// Poll `CreateToken` until the token is issued or the flow ends.
    ///
    /// Sleeps the provider interval between attempts and never less. Only
    /// `Pending` and `SlowDown` loop; every other answer is terminal.
    pub async fn poll(
        &mut self,
        session: &DeviceSession,
        cancel: &CancellationToken,
    ) -> Result<AccessToken, DeviceAuthError> {
        self.expect_state(DeviceAuthState::AuthorizationPending)?;
        let mut interval_secs = session.poll_interval_secs;
        let mut attempts: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(DeviceAuthError::Cancelled);
            }
            attempts += 1;

            match self.provider.create_token(session).await {
                TokenPoll::Issued(token) => {
                    info!("Access token issued after {} attempt(s)", attempts);
                    self.state = DeviceAuthState::Authorized;
                    return Ok(token);
                }
                TokenPoll::Pending => {
                    debug!("Authorization pending (attempt {})", attempts);
                }
                TokenPoll::SlowDown => {
                    interval_secs += SLOW_DOWN_INCREMENT_SECS;
                    warn!("Provider asked to slow down, interval now {}s", interval_secs);
                }
                TokenPoll::Denied(message) => {
                    self.state = DeviceAuthState::Denied;
                    return Err(DeviceAuthError::Denied(message));
                }
                TokenPoll::Expired(message) => {
                    self.state = DeviceAuthState::Expired;
                    return Err(DeviceAuthError::Expired(message));
                }
                TokenPoll::OtherError(message) => {
                    return Err(DeviceAuthError::TokenExchange(message));
                }
            }

            if Utc::now() >= session.expires_at {
                self.state = DeviceAuthState::Expired;
                return Err(DeviceAuthError::Expired(format!(
                    "device code expired at {}",
                    session.expires_at
                )));
            }

            tokio::select! {
                _ = self.sleeper.sleep(Duration::from_secs(interval_secs)) => {}
                _ = cancel.cancelled() => return Err(DeviceAuthError::Cancelled),
            }
        }
    }

    /// Full flow. `on_session` runs once the verification URL is known, so
    /// the caller can show it to the operator before polling starts.
    pub async fn authorize(
        &mut self,
        start_url: &str,
        cancel: &CancellationToken,
        on_session: impl FnOnce(&DeviceSession),
    ) -> Result<AccessToken, DeviceAuthError> {
        let registration = self.register().await?;
        let session = self.start(&registration, start_url).await?;
        on_session(&session);
        self.poll(&session, cancel).await
    }

    fn expect_state(&self, expected: DeviceAuthState) -> Result<(), DeviceAuthError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(DeviceAuthError::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }
}
