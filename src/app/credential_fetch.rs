//! Role credential retrieval for discovered assignments.
//!
//! One `GetRoleCredentials` call per assignment, sequentially, in discovery
//! order. A failed pair is recorded and skipped so partial permission grants do
//! not sink the run. An `Unauthorized` answer means the access token itself was
//! rejected; every remaining call would fail the same way, so the stage stops.

use crate::app::device_authorization::AccessToken;
use crate::app::sso_discovery::{RoleAssignment, SsoError, SsoErrorKind, SsoPortal};
use chrono::{DateTime, Utc};
use std::fmt;
use tracing::{debug, info, warn};

/// Temporary credentials as returned by `GetRoleCredentials`.
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expiration: DateTime<Utc>,
}

impl fmt::Debug for IssuedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("expiration", &self.expiration)
            .finish_non_exhaustive()
    }
}

/// Credentials for one (account, role) pair.
#[derive(Clone, PartialEq, Eq)]
pub struct RoleCredential {
    pub account_id: String,
    pub account_name: String,
    pub role_name: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expiration: DateTime<Utc>,
}

impl RoleCredential {
    pub fn new(assignment: &RoleAssignment, issued: IssuedCredentials) -> Self {
        Self {
            account_id: assignment.account_id.clone(),
            account_name: assignment.account_name.clone(),
            role_name: assignment.role_name.clone(),
            access_key_id: issued.access_key_id,
            secret_access_key: issued.secret_access_key,
            session_token: issued.session_token,
            expiration: issued.expiration,
        }
    }
}

impl fmt::Debug for RoleCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoleCredential")
            .field("account_id", &self.account_id)
            .field("account_name", &self.account_name)
            .field("role_name", &self.role_name)
            .field("access_key_id", &self.access_key_id)
            .field("expiration", &self.expiration)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchFailure {
    pub assignment: RoleAssignment,
    pub error: SsoError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOutcome {
    /// In discovery order.
    pub credentials: Vec<RoleCredential>,
    pub failures: Vec<FetchFailure>,
}

impl FetchOutcome {
    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}

pub async fn fetch_role_credentials(
    portal: &dyn SsoPortal,
    token: &AccessToken,
    assignments: &[RoleAssignment],
) -> Result<FetchOutcome, SsoError> {
    let mut outcome = FetchOutcome::default();

    for assignment in assignments {
        match portal
            .get_role_credentials(token, &assignment.account_id, &assignment.role_name)
            .await
        {
            Ok(issued) => {
                debug!(
                    "Retrieved credentials for {} (key {}, expires {})",
                    assignment, issued.access_key_id, issued.expiration
                );
                outcome.credentials.push(RoleCredential::new(assignment, issued));
            }
            Err(error) if error.kind == SsoErrorKind::Unauthorized => {
                warn!("Access token rejected while fetching {}: {}", assignment, error);
                return Err(error);
            }
            Err(error) => {
                warn!("Skipping {}: {}", assignment, error);
                outcome.failures.push(FetchFailure {
                    assignment: assignment.clone(),
                    error,
                });
            }
        }
    }

    info!(
        "Fetched {} credential set(s), {} failure(s)",
        outcome.credentials.len(),
        outcome.failures.len()
    );
    Ok(outcome)
}
