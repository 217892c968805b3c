//! SDK-backed implementations of the provider traits.
//!
//! Every client is built from one `SdkConfig` loaded for the Identity Center
//! region (login) or the ambient profile (OIDC provisioning). Service errors
//! are classified by their error code; anything unrecognised keeps its full
//! error chain via `DisplayErrorContext`.

use crate::app::credential_fetch::IssuedCredentials;
use crate::app::device_authorization::{
    AccessToken, ClientRegistration, DeviceChallenge, DeviceSession, OidcProvider, TokenPoll,
    DEVICE_CODE_GRANT_TYPE,
};
use crate::app::sso_discovery::{AccountRef, Page, SsoError, SsoErrorKind, SsoPortal};
use crate::app::trust_provisioning::{IamCallError, IamControlPlane, IamErrorKind};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_iam::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_iam::Client as IamClient;
use aws_sdk_sso::Client as SsoClient;
use aws_sdk_ssooidc::Client as SsoOidcClient;
use aws_sdk_sts::Client as StsClient;
use aws_types::region::Region;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

/// Load SDK configuration, pinning the region when one is given.
pub async fn load_sdk_config(region: Option<&str>) -> SdkConfig {
    let loader = aws_config::defaults(BehaviorVersion::latest());
    let loader = match region {
        Some(region) => loader.region(Region::new(region.to_string())),
        None => loader,
    };
    loader.load().await
}

/// Error code and message of a modeled service error, if it is one.
fn service_error_parts<E, R>(err: &SdkError<E, R>) -> Option<(&str, &str)>
where
    E: ProvideErrorMetadata,
{
    match err {
        SdkError::ServiceError(service_err) => {
            let inner = service_err.err();
            Some((
                inner.code().unwrap_or("Unknown"),
                inner.message().unwrap_or("no message"),
            ))
        }
        _ => None,
    }
}

fn describe<E, R>(err: &SdkError<E, R>) -> String
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    match service_error_parts(err) {
        Some((code, message)) => format!("{}: {}", code, message),
        None => DisplayErrorContext(err).to_string(),
    }
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    let secs = millis.div_euclid(1000);
    let nsecs = (millis.rem_euclid(1000) * 1_000_000) as u32;
    DateTime::from_timestamp(secs, nsecs).unwrap_or_else(|| {
        warn!("Credential expiration {} out of range, assuming one hour", millis);
        Utc::now() + Duration::hours(1)
    })
}

/// SSO OIDC client for the device authorization grant.
pub struct SdkOidcProvider {
    client: SsoOidcClient,
}

impl SdkOidcProvider {
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            client: SsoOidcClient::new(config),
        }
    }
}

#[async_trait]
impl OidcProvider for SdkOidcProvider {
    async fn register_client(
        &self,
        client_name: &str,
        client_type: &str,
        scopes: &[&str],
    ) -> anyhow::Result<ClientRegistration> {
        let resp = self
            .client
            .register_client()
            .client_name(client_name)
            .client_type(client_type)
            .set_scopes(Some(scopes.iter().map(|s| s.to_string()).collect()))
            .send()
            .await
            .map_err(|e| anyhow!(describe(&e)))
            .context("RegisterClient")?;

        let client_id = resp.client_id.unwrap_or_default();
        let client_secret = resp.client_secret.unwrap_or_default();
        if client_id.is_empty() || client_secret.is_empty() {
            return Err(anyhow!("RegisterClient returned no client credentials"));
        }

        Ok(ClientRegistration {
            client_id,
            client_secret,
            expires_at: (resp.client_secret_expires_at > 0)
                .then(|| DateTime::from_timestamp(resp.client_secret_expires_at, 0))
                .flatten(),
        })
    }

    async fn start_device_authorization(
        &self,
        registration: &ClientRegistration,
        start_url: &str,
    ) -> anyhow::Result<DeviceChallenge> {
        let resp = self
            .client
            .start_device_authorization()
            .client_id(&registration.client_id)
            .client_secret(&registration.client_secret)
            .start_url(start_url)
            .send()
            .await
            .map_err(|e| anyhow!(describe(&e)))
            .context("StartDeviceAuthorization")?;

        let device_code = resp.device_code.unwrap_or_default();
        let verification_uri = resp.verification_uri.unwrap_or_default();
        if device_code.is_empty() || verification_uri.is_empty() {
            return Err(anyhow!(
                "StartDeviceAuthorization returned no device code or verification URI"
            ));
        }

        Ok(DeviceChallenge {
            device_code,
            user_code: resp.user_code.unwrap_or_default(),
            verification_uri,
            verification_uri_complete: resp.verification_uri_complete,
            expires_in_secs: resp.expires_in.max(0) as u64,
            interval_secs: resp.interval.max(0) as u64,
        })
    }

    async fn create_token(&self, session: &DeviceSession) -> TokenPoll {
        let result = self
            .client
            .create_token()
            .client_id(&session.client_id)
            .client_secret(&session.client_secret)
            .device_code(&session.device_code)
            .grant_type(DEVICE_CODE_GRANT_TYPE)
            .send()
            .await;

        match result {
            Ok(resp) => match resp.access_token {
                Some(token) if !token.is_empty() => {
                    let expires_at = Utc::now() + Duration::seconds(resp.expires_in as i64);
                    TokenPoll::Issued(AccessToken::new(token, expires_at))
                }
                _ => TokenPoll::OtherError("CreateToken returned no access token".to_string()),
            },
            Err(err) => match service_error_parts(&err) {
                Some(("AuthorizationPendingException", _)) => TokenPoll::Pending,
                Some(("SlowDownException", _)) => TokenPoll::SlowDown,
                Some(("AccessDeniedException", message)) => TokenPoll::Denied(message.to_string()),
                Some(("ExpiredTokenException", message)) => {
                    TokenPoll::Expired(message.to_string())
                }
                _ => TokenPoll::OtherError(describe(&err)),
            },
        }
    }
}

/// Identity Center portal client.
pub struct SdkSsoPortal {
    client: SsoClient,
}

impl SdkSsoPortal {
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            client: SsoClient::new(config),
        }
    }
}

fn sso_error<E, R>(operation: &str, err: &SdkError<E, R>) -> SsoError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let kind = match service_error_parts(err).map(|(code, _)| code) {
        Some("UnauthorizedException") => SsoErrorKind::Unauthorized,
        Some("ResourceNotFoundException") => SsoErrorKind::NotFound,
        Some("TooManyRequestsException") => SsoErrorKind::TooManyRequests,
        Some("InvalidRequestException") => SsoErrorKind::InvalidRequest,
        _ => SsoErrorKind::Other,
    };
    SsoError::new(operation, kind, describe(err))
}

/// The portal sometimes returns an empty string instead of no token.
fn continuation(next_token: Option<String>) -> Option<String> {
    next_token.filter(|t| !t.is_empty())
}

#[async_trait]
impl SsoPortal for SdkSsoPortal {
    async fn list_accounts(
        &self,
        token: &AccessToken,
        next_token: Option<&str>,
    ) -> Result<Page<AccountRef>, SsoError> {
        let resp = self
            .client
            .list_accounts()
            .access_token(token.as_str())
            .set_next_token(next_token.map(str::to_string))
            .send()
            .await
            .map_err(|e| sso_error("ListAccounts", &e))?;

        let items = resp
            .account_list
            .unwrap_or_default()
            .into_iter()
            .filter_map(|account| {
                let account_id = account.account_id?;
                Some(AccountRef {
                    account_name: account.account_name.unwrap_or_default(),
                    account_id,
                })
            })
            .collect();

        Ok(Page {
            items,
            next_token: continuation(resp.next_token),
        })
    }

    async fn list_account_roles(
        &self,
        token: &AccessToken,
        account_id: &str,
        next_token: Option<&str>,
    ) -> Result<Page<String>, SsoError> {
        let resp = self
            .client
            .list_account_roles()
            .access_token(token.as_str())
            .account_id(account_id)
            .set_next_token(next_token.map(str::to_string))
            .send()
            .await
            .map_err(|e| sso_error("ListAccountRoles", &e))?;

        let items = resp
            .role_list
            .unwrap_or_default()
            .into_iter()
            .filter_map(|role| role.role_name)
            .collect();

        Ok(Page {
            items,
            next_token: continuation(resp.next_token),
        })
    }

    async fn get_role_credentials(
        &self,
        token: &AccessToken,
        account_id: &str,
        role_name: &str,
    ) -> Result<IssuedCredentials, SsoError> {
        let resp = self
            .client
            .get_role_credentials()
            .access_token(token.as_str())
            .account_id(account_id)
            .role_name(role_name)
            .send()
            .await
            .map_err(|e| sso_error("GetRoleCredentials", &e))?;

        let creds = resp.role_credentials.ok_or_else(|| {
            SsoError::new(
                "GetRoleCredentials",
                SsoErrorKind::Other,
                "response contained no credentials",
            )
        })?;

        let issued = IssuedCredentials {
            access_key_id: creds.access_key_id.unwrap_or_default(),
            secret_access_key: creds.secret_access_key.unwrap_or_default(),
            session_token: creds.session_token.unwrap_or_default(),
            expiration: millis_to_datetime(creds.expiration),
        };
        if issued.access_key_id.is_empty() || issued.secret_access_key.is_empty() {
            return Err(SsoError::new(
                "GetRoleCredentials",
                SsoErrorKind::Other,
                "response contained incomplete credentials",
            ));
        }
        Ok(issued)
    }
}

/// IAM and STS clients sharing one configuration.
pub struct SdkIamControlPlane {
    iam: IamClient,
    sts: StsClient,
}

impl SdkIamControlPlane {
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            iam: IamClient::new(config),
            sts: StsClient::new(config),
        }
    }
}

fn iam_error<E, R>(operation: &str, err: &SdkError<E, R>) -> IamCallError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let kind = match service_error_parts(err).map(|(code, _)| code) {
        Some("EntityAlreadyExists") => IamErrorKind::AlreadyExists,
        Some("NoSuchEntity") => IamErrorKind::NoSuchEntity,
        _ => IamErrorKind::Other,
    };
    let error = IamCallError::new(operation, kind, describe(err));
    debug!("{}", error);
    error
}

#[async_trait]
impl IamControlPlane for SdkIamControlPlane {
    async fn create_oidc_provider(
        &self,
        url: &str,
        audience: &str,
        thumbprint: &str,
    ) -> Result<(), IamCallError> {
        let mut request = self
            .iam
            .create_open_id_connect_provider()
            .url(url)
            .client_id_list(audience);
        if !thumbprint.is_empty() {
            request = request.thumbprint_list(thumbprint);
        }
        request
            .send()
            .await
            .map_err(|e| iam_error("CreateOpenIDConnectProvider", &e))?;
        Ok(())
    }

    async fn list_oidc_provider_arns(&self) -> Result<Vec<String>, IamCallError> {
        let resp = self
            .iam
            .list_open_id_connect_providers()
            .send()
            .await
            .map_err(|e| iam_error("ListOpenIDConnectProviders", &e))?;

        Ok(resp
            .open_id_connect_provider_list
            .unwrap_or_default()
            .into_iter()
            .filter_map(|entry| entry.arn)
            .collect())
    }

    async fn delete_oidc_provider(&self, arn: &str) -> Result<(), IamCallError> {
        self.iam
            .delete_open_id_connect_provider()
            .open_id_connect_provider_arn(arn)
            .send()
            .await
            .map_err(|e| iam_error("DeleteOpenIDConnectProvider", &e))?;
        Ok(())
    }

    async fn create_role(&self, role_name: &str, trust_policy: &str) -> Result<(), IamCallError> {
        self.iam
            .create_role()
            .role_name(role_name)
            .assume_role_policy_document(trust_policy)
            .send()
            .await
            .map_err(|e| iam_error("CreateRole", &e))?;
        Ok(())
    }

    async fn update_trust_policy(
        &self,
        role_name: &str,
        trust_policy: &str,
    ) -> Result<(), IamCallError> {
        self.iam
            .update_assume_role_policy()
            .role_name(role_name)
            .policy_document(trust_policy)
            .send()
            .await
            .map_err(|e| iam_error("UpdateAssumeRolePolicy", &e))?;
        Ok(())
    }

    async fn put_role_policy(
        &self,
        role_name: &str,
        policy_name: &str,
        policy_document: &str,
    ) -> Result<(), IamCallError> {
        self.iam
            .put_role_policy()
            .role_name(role_name)
            .policy_name(policy_name)
            .policy_document(policy_document)
            .send()
            .await
            .map_err(|e| iam_error("PutRolePolicy", &e))?;
        Ok(())
    }

    async fn delete_role_policy(
        &self,
        role_name: &str,
        policy_name: &str,
    ) -> Result<(), IamCallError> {
        self.iam
            .delete_role_policy()
            .role_name(role_name)
            .policy_name(policy_name)
            .send()
            .await
            .map_err(|e| iam_error("DeleteRolePolicy", &e))?;
        Ok(())
    }

    async fn delete_role(&self, role_name: &str) -> Result<(), IamCallError> {
        self.iam
            .delete_role()
            .role_name(role_name)
            .send()
            .await
            .map_err(|e| iam_error("DeleteRole", &e))?;
        Ok(())
    }

    async fn caller_account_id(&self) -> Result<String, IamCallError> {
        let resp = self
            .sts
            .get_caller_identity()
            .send()
            .await
            .map_err(|e| iam_error("GetCallerIdentity", &e))?;

        resp.account.filter(|a| !a.is_empty()).ok_or_else(|| {
            IamCallError::new(
                "GetCallerIdentity",
                IamErrorKind::Other,
                "response contained no account id",
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_to_datetime() {
        let at = millis_to_datetime(1_700_000_000_123);
        assert_eq!(at.timestamp(), 1_700_000_000);
        assert_eq!(at.timestamp_subsec_millis(), 123);
    }

    #[test]
    fn test_empty_continuation_is_end_of_listing() {
        assert_eq!(continuation(Some(String::new())), None);
        assert_eq!(continuation(None), None);
        assert_eq!(continuation(Some("abc".to_string())), Some("abc".to_string()));
    }
}
