//! Account and role discovery through the IAM Identity Center portal API.
//!
//! Two nested cursor loops: `ListAccounts` pages first, then `ListAccountRoles`
//! pages for every retained account. A page without a continuation token ends
//! its loop. Allow-lists are optional and independent; an empty list accepts
//! everything.

use crate::app::credential_fetch::IssuedCredentials;
use crate::app::device_authorization::AccessToken;
use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Identity Center account as listed by the portal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccountRef {
    pub account_id: String,
    pub account_name: String,
}

/// One role the operator may assume in one account.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoleAssignment {
    pub account_id: String,
    pub account_name: String,
    pub role_name: String,
}

impl fmt::Display for RoleAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.account_id, self.role_name)
    }
}

/// One page of a cursor-driven listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_token: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_token: None,
        }
    }

    pub fn with_next(items: Vec<T>, next_token: impl Into<String>) -> Self {
        Self {
            items,
            next_token: Some(next_token.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SsoErrorKind {
    /// The access token was rejected.
    Unauthorized,
    NotFound,
    TooManyRequests,
    InvalidRequest,
    Other,
}

impl fmt::Display for SsoErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SsoErrorKind::Unauthorized => "unauthorized",
            SsoErrorKind::NotFound => "not found",
            SsoErrorKind::TooManyRequests => "throttled",
            SsoErrorKind::InvalidRequest => "invalid request",
            SsoErrorKind::Other => "error",
        };
        f.write_str(label)
    }
}

/// Failure of one portal call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{operation} failed ({kind}): {message}")]
pub struct SsoError {
    pub operation: String,
    pub kind: SsoErrorKind,
    pub message: String,
}

impl SsoError {
    pub fn new(operation: impl Into<String>, kind: SsoErrorKind, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            kind,
            message: message.into(),
        }
    }
}

/// Identity Center portal endpoints (`ListAccounts`, `ListAccountRoles`,
/// `GetRoleCredentials`).
#[async_trait]
pub trait SsoPortal: Send + Sync {
    async fn list_accounts(
        &self,
        token: &AccessToken,
        next_token: Option<&str>,
    ) -> Result<Page<AccountRef>, SsoError>;

    async fn list_account_roles(
        &self,
        token: &AccessToken,
        account_id: &str,
        next_token: Option<&str>,
    ) -> Result<Page<String>, SsoError>;

    async fn get_role_credentials(
        &self,
        token: &AccessToken,
        account_id: &str,
        role_name: &str,
    ) -> Result<IssuedCredentials, SsoError>;
}

/// Optional allow-lists applied during discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryFilters {
    pub include_accounts: Vec<String>,
    pub allowed_role_names: Vec<String>,
}

impl DiscoveryFilters {
    pub fn accepts_account(&self, account_id: &str) -> bool {
        self.include_accounts.is_empty() || self.include_accounts.iter().any(|a| a == account_id)
    }

    pub fn accepts_role(&self, role_name: &str) -> bool {
        self.allowed_role_names.is_empty()
            || self.allowed_role_names.iter().any(|r| r == role_name)
    }
}

/// An account whose role listing failed and was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedAccount {
    pub account: AccountRef,
    pub error: SsoError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discovery {
    /// Accounts in list order, roles in list order within each account.
    pub assignments: Vec<RoleAssignment>,
    pub skipped_accounts: Vec<SkippedAccount>,
}

/// Page through `ListAccounts`, keeping allowed accounts once each.
///
/// Any failure here is fatal: without the account list there is nothing to do.
pub async fn list_all_accounts(
    portal: &dyn SsoPortal,
    token: &AccessToken,
    filters: &DiscoveryFilters,
) -> Result<Vec<AccountRef>, SsoError> {
    let mut accounts = Vec::new();
    let mut seen = HashSet::new();
    let mut next_token: Option<String> = None;
    let mut pages = 0usize;

    loop {
        let page = portal.list_accounts(token, next_token.as_deref()).await?;
        pages += 1;

        for account in page.items {
            if !filters.accepts_account(&account.account_id) {
                debug!("Skipping account {} (not in include list)", account.account_id);
                continue;
            }
            if seen.insert(account.account_id.clone()) {
                accounts.push(account);
            }
        }

        match page.next_token {
            Some(cursor) => next_token = Some(cursor),
            None => break,
        }
    }

    info!("Listed {} account(s) over {} page(s)", accounts.len(), pages);
    Ok(accounts)
}

/// Page through `ListAccountRoles` for one account.
pub async fn list_roles_for_account(
    portal: &dyn SsoPortal,
    token: &AccessToken,
    account: &AccountRef,
    filters: &DiscoveryFilters,
) -> Result<Vec<RoleAssignment>, SsoError> {
    let mut assignments = Vec::new();
    let mut next_token: Option<String> = None;

    loop {
        let page = portal
            .list_account_roles(token, &account.account_id, next_token.as_deref())
            .await?;

        assignments.extend(
            page.items
                .into_iter()
                .filter(|role| filters.accepts_role(role))
                .map(|role_name| RoleAssignment {
                    account_id: account.account_id.clone(),
                    account_name: account.account_name.clone(),
                    role_name,
                }),
        );

        match page.next_token {
            Some(cursor) => next_token = Some(cursor),
            None => break,
        }
    }

    Ok(assignments)
}

/// Discover every allowed (account, role) pair.
///
/// A failed role listing skips that account and continues with the rest.
pub async fn discover_role_assignments(
    portal: &dyn SsoPortal,
    token: &AccessToken,
    filters: &DiscoveryFilters,
) -> Result<Discovery, SsoError> {
    let accounts = list_all_accounts(portal, token, filters).await?;
    let mut discovery = Discovery::default();

    for account in accounts {
        match list_roles_for_account(portal, token, &account, filters).await {
            Ok(assignments) => {
                debug!(
                    "Account {} has {} matching role(s)",
                    account.account_id,
                    assignments.len()
                );
                discovery.assignments.extend(assignments);
            }
            Err(error) => {
                warn!("Skipping account {}: {}", account.account_id, error);
                discovery.skipped_accounts.push(SkippedAccount { account, error });
            }
        }
    }

    info!(
        "Discovered {} role assignment(s), skipped {} account(s)",
        discovery.assignments.len(),
        discovery.skipped_accounts.len()
    );
    Ok(discovery)
}
