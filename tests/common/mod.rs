//! In-memory fakes for the provider traits, shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use awslogin::app::credential_fetch::IssuedCredentials;
use awslogin::app::device_authorization::{
    AccessToken, ClientRegistration, DeviceChallenge, DeviceSession, OidcProvider, Sleeper,
    TokenPoll,
};
use awslogin::app::sso_discovery::{AccountRef, Page, SsoError, SsoErrorKind, SsoPortal};
use awslogin::app::trust_provisioning::{
    normalize_provider_url, IamCallError, IamControlPlane, IamErrorKind,
};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const ACCOUNT_ID: &str = "123456789012";
pub const START_URL: &str = "https://d-1234567890.awsapps.com/start";
pub const VERIFICATION_URL: &str = "https://device.sso.us-east-1.amazonaws.com/?user_code=ABCD-EFGH";

pub fn token() -> AccessToken {
    AccessToken::new("access-token", Utc::now() + ChronoDuration::hours(8))
}

pub fn expiration() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2030, 1, 1, 12, 0, 0).unwrap()
}

pub fn account(id: &str, name: &str) -> AccountRef {
    AccountRef {
        account_id: id.to_string(),
        account_name: name.to_string(),
    }
}

// ---------------------------------------------------------------------------
// OIDC

/// Answers `CreateToken` from a queue; an empty queue keeps answering pending.
pub struct FakeOidc {
    polls: Mutex<VecDeque<TokenPoll>>,
    pub interval_secs: u64,
    pub expires_in_secs: u64,
    pub fail_registration: bool,
    pub registered_names: Mutex<Vec<String>>,
    pub registered_scopes: Mutex<Vec<String>>,
    pub create_token_calls: AtomicUsize,
}

impl FakeOidc {
    pub fn new(polls: Vec<TokenPoll>) -> Self {
        Self {
            polls: Mutex::new(polls.into()),
            interval_secs: 1,
            expires_in_secs: 600,
            fail_registration: false,
            registered_names: Mutex::new(Vec::new()),
            registered_scopes: Mutex::new(Vec::new()),
            create_token_calls: AtomicUsize::new(0),
        }
    }

    /// Approves on the first poll.
    pub fn approving() -> Self {
        Self::new(vec![TokenPoll::Issued(token())])
    }

    pub fn calls(&self) -> usize {
        self.create_token_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OidcProvider for FakeOidc {
    async fn register_client(
        &self,
        client_name: &str,
        client_type: &str,
        scopes: &[&str],
    ) -> anyhow::Result<ClientRegistration> {
        if self.fail_registration {
            anyhow::bail!("InvalidClientMetadataException: rejected");
        }
        assert_eq!(client_type, "public");
        self.registered_names
            .lock()
            .unwrap()
            .push(client_name.to_string());
        self.registered_scopes
            .lock()
            .unwrap()
            .extend(scopes.iter().map(|s| s.to_string()));
        Ok(ClientRegistration {
            client_id: "client-id".to_string(),
            client_secret: "client-secret".to_string(),
            expires_at: None,
        })
    }

    async fn start_device_authorization(
        &self,
        registration: &ClientRegistration,
        start_url: &str,
    ) -> anyhow::Result<DeviceChallenge> {
        assert_eq!(registration.client_id, "client-id");
        assert_eq!(start_url, START_URL);
        Ok(DeviceChallenge {
            device_code: "device-code".to_string(),
            user_code: "ABCD-EFGH".to_string(),
            verification_uri: "https://device.sso.us-east-1.amazonaws.com/".to_string(),
            verification_uri_complete: Some(VERIFICATION_URL.to_string()),
            expires_in_secs: self.expires_in_secs,
            interval_secs: self.interval_secs,
        })
    }

    async fn create_token(&self, session: &DeviceSession) -> TokenPoll {
        assert_eq!(session.device_code, "device-code");
        self.create_token_calls.fetch_add(1, Ordering::SeqCst);
        self.polls
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(TokenPoll::Pending)
    }
}

/// Records every requested sleep and returns immediately.
#[derive(Default)]
pub struct RecordingSleeper {
    pub sleeps: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn recorded(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
    }
}

/// Cancels the run on the first sleep, then never wakes.
pub struct CancellingSleeper {
    pub cancel: CancellationToken,
}

#[async_trait]
impl Sleeper for CancellingSleeper {
    async fn sleep(&self, _duration: Duration) {
        self.cancel.cancel();
        std::future::pending::<()>().await;
    }
}

// ---------------------------------------------------------------------------
// SSO portal

/// Portal with paged listings and injectable failures.
#[derive(Default)]
pub struct FakePortal {
    account_pages: Vec<Vec<AccountRef>>,
    role_pages: HashMap<String, Vec<Vec<String>>>,
    pub accounts_error: Option<SsoErrorKind>,
    pub failing_role_accounts: HashSet<String>,
    pub credential_errors: HashMap<(String, String), SsoErrorKind>,
    pub list_accounts_calls: AtomicUsize,
    pub list_roles_calls: AtomicUsize,
    pub get_credentials_calls: AtomicUsize,
}

impl FakePortal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_account_pages(mut self, pages: Vec<Vec<AccountRef>>) -> Self {
        self.account_pages = pages;
        self
    }

    /// Single-page account listing.
    pub fn with_accounts(self, accounts: Vec<AccountRef>) -> Self {
        self.with_account_pages(vec![accounts])
    }

    pub fn with_role_pages(mut self, account_id: &str, pages: Vec<Vec<&str>>) -> Self {
        self.role_pages.insert(
            account_id.to_string(),
            pages
                .into_iter()
                .map(|page| page.into_iter().map(str::to_string).collect())
                .collect(),
        );
        self
    }

    pub fn with_roles(self, account_id: &str, roles: Vec<&str>) -> Self {
        self.with_role_pages(account_id, vec![roles])
    }

    pub fn failing_roles_for(mut self, account_id: &str) -> Self {
        self.failing_role_accounts.insert(account_id.to_string());
        self
    }

    pub fn failing_credentials_for(
        mut self,
        account_id: &str,
        role_name: &str,
        kind: SsoErrorKind,
    ) -> Self {
        self.credential_errors
            .insert((account_id.to_string(), role_name.to_string()), kind);
        self
    }

    pub fn account_calls(&self) -> usize {
        self.list_accounts_calls.load(Ordering::SeqCst)
    }

    pub fn role_calls(&self) -> usize {
        self.list_roles_calls.load(Ordering::SeqCst)
    }

    pub fn credential_calls(&self) -> usize {
        self.get_credentials_calls.load(Ordering::SeqCst)
    }
}

fn page_index(next_token: Option<&str>) -> usize {
    next_token
        .and_then(|t| t.strip_prefix("page-"))
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

fn page_of<T: Clone>(pages: &[Vec<T>], index: usize) -> Page<T> {
    let items = pages.get(index).cloned().unwrap_or_default();
    if index + 1 < pages.len() {
        Page::with_next(items, format!("page-{}", index + 1))
    } else {
        Page::last(items)
    }
}

/// Deterministic credentials for one pair.
pub fn issued_for(account_id: &str, role_name: &str) -> IssuedCredentials {
    IssuedCredentials {
        access_key_id: format!("ASIA{}{}", account_id, role_name.len()),
        secret_access_key: format!("secret-{}-{}", account_id, role_name),
        session_token: format!("token-{}-{}", account_id, role_name),
        expiration: expiration(),
    }
}

#[async_trait]
impl SsoPortal for FakePortal {
    async fn list_accounts(
        &self,
        _token: &AccessToken,
        next_token: Option<&str>,
    ) -> Result<Page<AccountRef>, SsoError> {
        self.list_accounts_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(kind) = self.accounts_error {
            return Err(SsoError::new("ListAccounts", kind, "listing failed"));
        }
        Ok(page_of(&self.account_pages, page_index(next_token)))
    }

    async fn list_account_roles(
        &self,
        _token: &AccessToken,
        account_id: &str,
        next_token: Option<&str>,
    ) -> Result<Page<String>, SsoError> {
        self.list_roles_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_role_accounts.contains(account_id) {
            return Err(SsoError::new(
                "ListAccountRoles",
                SsoErrorKind::TooManyRequests,
                "rate exceeded",
            ));
        }
        let pages = self.role_pages.get(account_id).cloned().unwrap_or_default();
        Ok(page_of(&pages, page_index(next_token)))
    }

    async fn get_role_credentials(
        &self,
        _token: &AccessToken,
        account_id: &str,
        role_name: &str,
    ) -> Result<IssuedCredentials, SsoError> {
        self.get_credentials_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(kind) = self
            .credential_errors
            .get(&(account_id.to_string(), role_name.to_string()))
        {
            return Err(SsoError::new("GetRoleCredentials", *kind, "denied"));
        }
        Ok(issued_for(account_id, role_name))
    }
}

// ---------------------------------------------------------------------------
// IAM

#[derive(Debug, Clone, Default)]
pub struct FakeRole {
    pub trust_policy: String,
    pub policies: HashMap<String, String>,
}

#[derive(Debug, Default)]
pub struct IamState {
    pub providers: Vec<String>,
    pub roles: HashMap<String, FakeRole>,
}

/// IAM control plane keeping state in memory, with real IAM error classes.
#[derive(Default)]
pub struct FakeIam {
    pub state: Mutex<IamState>,
    /// Provider ARNs are created but never listed.
    pub hide_providers: bool,
    /// Fail the named operation with `Other`.
    pub fail_operation: Option<String>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeIam {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provider_arn(url: &str) -> String {
        format!(
            "arn:aws:iam::{}:oidc-provider/{}",
            ACCOUNT_ID,
            normalize_provider_url(url)
        )
    }

    pub fn role(&self, name: &str) -> Option<FakeRole> {
        self.state.lock().unwrap().roles.get(name).cloned()
    }

    pub fn providers(&self) -> Vec<String> {
        self.state.lock().unwrap().providers.clone()
    }

    pub fn recorded_calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn enter(&self, operation: &str) -> Result<(), IamCallError> {
        self.calls.lock().unwrap().push(operation.to_string());
        if self.fail_operation.as_deref() == Some(operation) {
            return Err(IamCallError::new(
                operation,
                IamErrorKind::Other,
                "AccessDenied: not authorized",
            ));
        }
        Ok(())
    }
}

fn already_exists(operation: &str, what: &str) -> IamCallError {
    IamCallError::new(
        operation,
        IamErrorKind::AlreadyExists,
        format!("EntityAlreadyExists: {} already exists", what),
    )
}

fn no_such_entity(operation: &str, what: &str) -> IamCallError {
    IamCallError::new(
        operation,
        IamErrorKind::NoSuchEntity,
        format!("NoSuchEntity: {} cannot be found", what),
    )
}

#[async_trait]
impl IamControlPlane for FakeIam {
    async fn create_oidc_provider(
        &self,
        url: &str,
        _audience: &str,
        _thumbprint: &str,
    ) -> Result<(), IamCallError> {
        self.enter("CreateOpenIDConnectProvider")?;
        let arn = Self::provider_arn(url);
        let mut state = self.state.lock().unwrap();
        if state.providers.contains(&arn) {
            return Err(already_exists("CreateOpenIDConnectProvider", &arn));
        }
        state.providers.push(arn);
        Ok(())
    }

    async fn list_oidc_provider_arns(&self) -> Result<Vec<String>, IamCallError> {
        self.enter("ListOpenIDConnectProviders")?;
        if self.hide_providers {
            return Ok(Vec::new());
        }
        Ok(self.providers())
    }

    async fn delete_oidc_provider(&self, arn: &str) -> Result<(), IamCallError> {
        self.enter("DeleteOpenIDConnectProvider")?;
        let mut state = self.state.lock().unwrap();
        let before = state.providers.len();
        state.providers.retain(|p| p != arn);
        if state.providers.len() == before {
            return Err(no_such_entity("DeleteOpenIDConnectProvider", arn));
        }
        Ok(())
    }

    async fn create_role(&self, role_name: &str, trust_policy: &str) -> Result<(), IamCallError> {
        self.enter("CreateRole")?;
        let mut state = self.state.lock().unwrap();
        if state.roles.contains_key(role_name) {
            return Err(already_exists("CreateRole", role_name));
        }
        state.roles.insert(
            role_name.to_string(),
            FakeRole {
                trust_policy: trust_policy.to_string(),
                policies: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn update_trust_policy(
        &self,
        role_name: &str,
        trust_policy: &str,
    ) -> Result<(), IamCallError> {
        self.enter("UpdateAssumeRolePolicy")?;
        let mut state = self.state.lock().unwrap();
        match state.roles.get_mut(role_name) {
            Some(role) => {
                role.trust_policy = trust_policy.to_string();
                Ok(())
            }
            None => Err(no_such_entity("UpdateAssumeRolePolicy", role_name)),
        }
    }

    async fn put_role_policy(
        &self,
        role_name: &str,
        policy_name: &str,
        policy_document: &str,
    ) -> Result<(), IamCallError> {
        self.enter("PutRolePolicy")?;
        let mut state = self.state.lock().unwrap();
        match state.roles.get_mut(role_name) {
            Some(role) => {
                role.policies
                    .insert(policy_name.to_string(), policy_document.to_string());
                Ok(())
            }
            None => Err(no_such_entity("PutRolePolicy", role_name)),
        }
    }

    async fn delete_role_policy(
        &self,
        role_name: &str,
        policy_name: &str,
    ) -> Result<(), IamCallError> {
        self.enter("DeleteRolePolicy")?;
        let mut state = self.state.lock().unwrap();
        let Some(role) = state.roles.get_mut(role_name) else {
            return Err(no_such_entity("DeleteRolePolicy", role_name));
        };
        match role.policies.remove(policy_name) {
            Some(_) => Ok(()),
            None => Err(no_such_entity("DeleteRolePolicy", policy_name)),
        }
    }

    async fn delete_role(&self, role_name: &str) -> Result<(), IamCallError> {
        self.enter("DeleteRole")?;
        let mut state = self.state.lock().unwrap();
        let has_policies = state.roles.get(role_name).map(|r| !r.policies.is_empty());
        match has_policies {
            Some(true) => Err(IamCallError::new(
                "DeleteRole",
                IamErrorKind::Other,
                "DeleteConflict: role has inline policies",
            )),
            Some(false) => {
                state.roles.remove(role_name);
                Ok(())
            }
            None => Err(no_such_entity("DeleteRole", role_name)),
        }
    }

    async fn caller_account_id(&self) -> Result<String, IamCallError> {
        self.enter("GetCallerIdentity")?;
        Ok(ACCOUNT_ID.to_string())
    }
}
