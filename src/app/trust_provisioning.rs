//! # Workload Identity Federation Trust
//!
//! Creates and tears down the IAM pieces that let an external CI system
//! (Azure DevOps service connections) assume a role with its OIDC token:
//!
//! 1. OIDC identity provider for the CI issuer URL
//! 2. IAM role whose trust policy binds the audience and a subject pattern
//! 3. Inline permission policy on that role
//!
//! The state lives in the cloud account, not here. Every call carries an
//! explicit [`IdempotencyPolicy`] naming which error class it tolerates, so
//! running `create` or `delete` again converges instead of failing.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info};

pub const ASSUME_ROLE_WITH_WEB_IDENTITY: &str = "sts:AssumeRoleWithWebIdentity";
pub const POLICY_VERSION: &str = "2012-10-17";

/// Operator-supplied settings for one pipeline identity.
#[derive(Debug, Clone, PartialEq)]
pub struct TrustConfig {
    pub oidc_provider_url: String,
    pub audience: String,
    pub thumbprint: String,
    pub role_name: String,
    pub policy_name: String,
    pub organization: String,
    pub project: String,
    /// `None` trusts every pipeline in the project.
    pub pipeline: Option<String>,
    pub policy_document: Value,
}

impl TrustConfig {
    /// Provider URL without its scheme, as used in ARNs and condition keys.
    pub fn normalized_provider_url(&self) -> &str {
        normalize_provider_url(&self.oidc_provider_url)
    }

    /// `sc://<org>/<project>/<pipeline>` or `sc://<org>/<project>/*`.
    pub fn subject_claim(&self) -> String {
        let pipeline = self.pipeline.as_deref().unwrap_or("*");
        format!("sc://{}/{}/{}", self.organization, self.project, pipeline)
    }

    pub fn trust_policy(&self, provider_arn: &str) -> Value {
        let prefix = self.normalized_provider_url();
        let audience_key = format!("{}:aud", prefix);
        let subject_key = format!("{}:sub", prefix);
        json!({
            "Version": POLICY_VERSION,
            "Statement": [
                {
                    "Effect": "Allow",
                    "Principal": { "Federated": provider_arn },
                    "Action": ASSUME_ROLE_WITH_WEB_IDENTITY,
                    "Condition": {
                        "StringEquals": { audience_key: self.audience },
                        "StringLike": { subject_key: self.subject_claim() }
                    }
                }
            ]
        })
    }

    pub fn role_arn(&self, account_id: &str) -> String {
        format!("arn:aws:iam::{}:role/{}", account_id, self.role_name)
    }
}

pub fn normalize_provider_url(url: &str) -> &str {
    let url = url.trim();
    url.strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url)
        .trim_end_matches('/')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IamErrorKind {
    AlreadyExists,
    NoSuchEntity,
    Other,
}

/// Failure of one IAM/STS call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{operation} failed: {message}")]
pub struct IamCallError {
    pub operation: String,
    pub kind: IamErrorKind,
    pub message: String,
}

impl IamCallError {
    pub fn new(operation: impl Into<String>, kind: IamErrorKind, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            kind,
            message: message.into(),
        }
    }
}

/// Which error class a provisioning call treats as success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyPolicy {
    Strict,
    TolerateAlreadyExists,
    TolerateAlreadyAbsent,
}

impl IdempotencyPolicy {
    pub fn tolerates(&self, kind: IamErrorKind) -> bool {
        matches!(
            (self, kind),
            (IdempotencyPolicy::TolerateAlreadyExists, IamErrorKind::AlreadyExists)
                | (IdempotencyPolicy::TolerateAlreadyAbsent, IamErrorKind::NoSuchEntity)
        )
    }

    /// Map a call result through the policy.
    pub fn apply(&self, result: Result<(), IamCallError>) -> Result<StepOutcome, IamCallError> {
        match result {
            Ok(()) => Ok(StepOutcome::Applied),
            Err(error) if self.tolerates(error.kind) => {
                info!("{} tolerated: {}", error.operation, error.message);
                Ok(match error.kind {
                    IamErrorKind::NoSuchEntity => StepOutcome::AlreadyAbsent,
                    _ => StepOutcome::AlreadyPresent,
                })
            }
            Err(error) => Err(error),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Applied,
    AlreadyPresent,
    AlreadyAbsent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningStep {
    CreateOidcProvider,
    CreateRole,
    UpdateTrustPolicy,
    PutRolePolicy,
    DeleteRolePolicy,
    DeleteRole,
    DeleteOidcProvider,
}

impl fmt::Display for ProvisioningStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProvisioningStep::CreateOidcProvider => "OIDC provider",
            ProvisioningStep::CreateRole => "IAM role",
            ProvisioningStep::UpdateTrustPolicy => "trust policy",
            ProvisioningStep::PutRolePolicy => "role policy",
            ProvisioningStep::DeleteRolePolicy => "role policy",
            ProvisioningStep::DeleteRole => "IAM role",
            ProvisioningStep::DeleteOidcProvider => "OIDC provider",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepRecord {
    pub step: ProvisioningStep,
    pub outcome: StepOutcome,
}

impl fmt::Display for StepRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let deleting = matches!(
            self.step,
            ProvisioningStep::DeleteRolePolicy
                | ProvisioningStep::DeleteRole
                | ProvisioningStep::DeleteOidcProvider
        );
        match (self.outcome, deleting) {
            (StepOutcome::Applied, false) if self.step == ProvisioningStep::PutRolePolicy => {
                write!(f, "{} attached", self.step)
            }
            (StepOutcome::Applied, false) if self.step == ProvisioningStep::UpdateTrustPolicy => {
                write!(f, "{} updated", self.step)
            }
            (StepOutcome::Applied, false) => write!(f, "{} created", self.step),
            (StepOutcome::Applied, true) => write!(f, "{} deleted", self.step),
            (StepOutcome::AlreadyPresent, _) => write!(f, "{} already exists", self.step),
            (StepOutcome::AlreadyAbsent, _) => write!(f, "{} does not exist", self.step),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error(transparent)]
    Iam(#[from] IamCallError),

    #[error("no OIDC provider matches {0}")]
    ProviderNotFound(String),
}

/// IAM and STS calls used by the workflow.
#[async_trait]
pub trait IamControlPlane: Send + Sync {
    async fn create_oidc_provider(
        &self,
        url: &str,
        audience: &str,
        thumbprint: &str,
    ) -> Result<(), IamCallError>;

    async fn list_oidc_provider_arns(&self) -> Result<Vec<String>, IamCallError>;

    async fn delete_oidc_provider(&self, arn: &str) -> Result<(), IamCallError>;

    async fn create_role(&self, role_name: &str, trust_policy: &str) -> Result<(), IamCallError>;

    async fn update_trust_policy(
        &self,
        role_name: &str,
        trust_policy: &str,
    ) -> Result<(), IamCallError>;

    async fn put_role_policy(
        &self,
        role_name: &str,
        policy_name: &str,
        policy_document: &str,
    ) -> Result<(), IamCallError>;

    async fn delete_role_policy(&self, role_name: &str, policy_name: &str)
        -> Result<(), IamCallError>;

    async fn delete_role(&self, role_name: &str) -> Result<(), IamCallError>;

    async fn caller_account_id(&self) -> Result<String, IamCallError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateReport {
    pub provider_arn: String,
    pub role_arn: String,
    pub steps: Vec<StepRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteReport {
    pub steps: Vec<StepRecord>,
}

pub struct TrustProvisioner<'a> {
    iam: &'a dyn IamControlPlane,
    config: &'a TrustConfig,
}

impl<'a> TrustProvisioner<'a> {
    pub fn new(iam: &'a dyn IamControlPlane, config: &'a TrustConfig) -> Self {
        Self { iam, config }
    }

    /// Find the provider ARN ending with the scheme-stripped provider URL.
    pub async fn resolve_provider_arn(&self) -> Result<Option<String>, IamCallError> {
        let wanted = self.config.normalized_provider_url();
        let arns = self.iam.list_oidc_provider_arns().await?;
        debug!("Matching {} OIDC provider(s) against {}", arns.len(), wanted);
        Ok(arns.into_iter().find(|arn| arn.ends_with(wanted)))
    }

    /// Create provider, role and policy. Stops at the first non-tolerated error.
    pub async fn create(&self) -> Result<CreateReport, ProvisioningError> {
        let config = self.config;
        let mut steps = Vec::new();
        info!(
            "Provisioning OIDC trust for role {} ({})",
            config.role_name,
            config.subject_claim()
        );

        let outcome = IdempotencyPolicy::TolerateAlreadyExists.apply(
            self.iam
                .create_oidc_provider(&config.oidc_provider_url, &config.audience, &config.thumbprint)
                .await,
        )?;
        steps.push(StepRecord {
            step: ProvisioningStep::CreateOidcProvider,
            outcome,
        });

        let provider_arn = self
            .resolve_provider_arn()
            .await?
            .ok_or_else(|| ProvisioningError::ProviderNotFound(config.oidc_provider_url.clone()))?;
        debug!("Using OIDC provider {}", provider_arn);

        let trust_policy = config.trust_policy(&provider_arn).to_string();
        let outcome = IdempotencyPolicy::TolerateAlreadyExists
            .apply(self.iam.create_role(&config.role_name, &trust_policy).await)?;
        steps.push(StepRecord {
            step: ProvisioningStep::CreateRole,
            outcome,
        });

        if outcome == StepOutcome::AlreadyPresent {
            let outcome = IdempotencyPolicy::Strict.apply(
                self.iam
                    .update_trust_policy(&config.role_name, &trust_policy)
                    .await,
            )?;
            steps.push(StepRecord {
                step: ProvisioningStep::UpdateTrustPolicy,
                outcome,
            });
        }

        let outcome = IdempotencyPolicy::Strict.apply(
            self.iam
                .put_role_policy(
                    &config.role_name,
                    &config.policy_name,
                    &config.policy_document.to_string(),
                )
                .await,
        )?;
        steps.push(StepRecord {
            step: ProvisioningStep::PutRolePolicy,
            outcome,
        });

        let account_id = self.iam.caller_account_id().await?;
        let role_arn = config.role_arn(&account_id);
        info!("OIDC trust ready: {}", role_arn);

        Ok(CreateReport {
            provider_arn,
            role_arn,
            steps,
        })
    }

    /// Mirror of [`create`](Self::create) in reverse. The provider is only
    /// removed when `delete_provider` is set because other roles may use it.
    pub async fn delete(&self, delete_provider: bool) -> Result<DeleteReport, ProvisioningError> {
        let config = self.config;
        let mut report = DeleteReport::default();
        info!("Removing OIDC trust for role {}", config.role_name);

        let outcome = IdempotencyPolicy::TolerateAlreadyAbsent.apply(
            self.iam
                .delete_role_policy(&config.role_name, &config.policy_name)
                .await,
        )?;
        report.steps.push(StepRecord {
            step: ProvisioningStep::DeleteRolePolicy,
            outcome,
        });

        let outcome = IdempotencyPolicy::TolerateAlreadyAbsent
            .apply(self.iam.delete_role(&config.role_name).await)?;
        report.steps.push(StepRecord {
            step: ProvisioningStep::DeleteRole,
            outcome,
        });

        if delete_provider {
            let outcome = match self.resolve_provider_arn().await? {
                Some(arn) => IdempotencyPolicy::TolerateAlreadyAbsent
                    .apply(self.iam.delete_oidc_provider(&arn).await)?,
                None => StepOutcome::AlreadyAbsent,
            };
            report.steps.push(StepRecord {
                step: ProvisioningStep::DeleteOidcProvider,
                outcome,
            });
        }

        Ok(report)
    }
}
