//! # Login Workflow
//!
//! Composes the stages of one `awslogin login` run:
//!
//! 1. device authorization until an access token is issued
//! 2. account and role discovery
//! 3. credential retrieval per role
//! 4. replace-by-name merge into the shared credentials file (and, when
//!    enabled, `[profile ...]` entries in the shared config file)
//!
//! Stages run strictly in order. The store files are only touched in the last
//! stage, under the store lock, so an aborted run leaves them as they were.

use crate::app::config::StorePaths;
use crate::app::credential_fetch::{fetch_role_credentials, FetchFailure};
use crate::app::credential_store::{update_file, StoreError};
use crate::app::device_authorization::{DeviceAuthError, DeviceAuthorization, OidcProvider, Sleeper};
use crate::app::profile_merge::{
    merge_config_profiles, merge_credentials, MergeError, MergeReport, ProfileNaming,
};
use crate::app::sso_discovery::{discover_role_assignments, DiscoveryFilters, SkippedAccount, SsoError, SsoPortal};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum LoginError {
    #[error(transparent)]
    Device(#[from] DeviceAuthError),

    #[error(transparent)]
    Portal(#[from] SsoError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("login cancelled before credentials were written")]
    Cancelled,
}

/// Settings for one run, resolved from configuration and flags.
#[derive(Debug, Clone)]
pub struct LoginOptions {
    pub start_url: String,
    /// Written to `[profile ...]` entries; not used for API calls.
    pub region: String,
    pub output: String,
    pub filters: DiscoveryFilters,
    pub naming: ProfileNaming,
    pub open_browser: bool,
    pub write_config_file: bool,
    pub paths: StorePaths,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginSummary {
    pub credentials: MergeReport,
    pub config: Option<MergeReport>,
    pub failures: Vec<FetchFailure>,
    pub skipped_accounts: Vec<SkippedAccount>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Updated(LoginSummary),
    /// Discovery found nothing the filters allow; stores untouched.
    NoRoles { skipped_accounts: Vec<SkippedAccount> },
    /// Every credential fetch failed; stores untouched.
    NoCredentials { failures: Vec<FetchFailure> },
}

pub struct LoginWorkflow<'a> {
    oidc: &'a dyn OidcProvider,
    portal: &'a dyn SsoPortal,
    sleeper: &'a dyn Sleeper,
}

impl<'a> LoginWorkflow<'a> {
    pub fn new(
        oidc: &'a dyn OidcProvider,
        portal: &'a dyn SsoPortal,
        sleeper: &'a dyn Sleeper,
    ) -> Self {
        Self {
            oidc,
            portal,
            sleeper,
        }
    }

    pub async fn run(
        &self,
        options: &LoginOptions,
        cancel: &CancellationToken,
    ) -> Result<LoginOutcome, LoginError> {
        let mut device = DeviceAuthorization::new(self.oidc, self.sleeper);
        let token = device
            .authorize(&options.start_url, cancel, |session| {
                println!("Open the following URL to sign in:");
                println!("  {}", session.verification_url);
                println!("Confirmation code: {}", session.user_code);
                if options.open_browser {
                    if let Err(e) = open::that(&session.verification_url) {
                        warn!("Failed to open browser: {}", e);
                    }
                }
                println!("Waiting for authorization...");
            })
            .await?;
        println!("Authorized.");

        let discovery = discover_role_assignments(self.portal, &token, &options.filters).await?;
        for skipped in &discovery.skipped_accounts {
            println!(
                "Skipped account {} ({}): {}",
                skipped.account.account_name, skipped.account.account_id, skipped.error
            );
        }
        if discovery.assignments.is_empty() {
            println!("No roles matched the configured filters; nothing to write.");
            return Ok(LoginOutcome::NoRoles {
                skipped_accounts: discovery.skipped_accounts,
            });
        }

        let fetched = fetch_role_credentials(self.portal, &token, &discovery.assignments).await?;
        for credential in &fetched.credentials {
            println!(
                "Fetched credentials for {} ({}) / {}, expires {}",
                credential.account_name,
                credential.account_id,
                credential.role_name,
                credential.expiration.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
        for failure in &fetched.failures {
            println!("Failed to fetch {}: {}", failure.assignment, failure.error);
        }
        if fetched.is_empty() {
            println!("No credentials could be retrieved; nothing to write.");
            return Ok(LoginOutcome::NoCredentials {
                failures: fetched.failures,
            });
        }

        if cancel.is_cancelled() {
            return Err(LoginError::Cancelled);
        }

        let credentials_report = update_file(&options.paths.credentials, |store| {
            merge_credentials(store, &fetched.credentials, options.naming).map_err(LoginError::from)
        })?;
        info!(
            "Updated {:?}: {} removed, {} added",
            options.paths.credentials,
            credentials_report.removed.len(),
            credentials_report.added.len()
        );
        for name in &credentials_report.removed {
            println!("Removed profile [{}]", name);
        }
        for name in &credentials_report.added {
            println!("Added profile [{}]", name);
        }

        let config_report = if options.write_config_file {
            let report = update_file(&options.paths.config, |store| {
                merge_config_profiles(
                    store,
                    &fetched.credentials,
                    options.naming,
                    &options.region,
                    &options.output,
                )
                .map_err(LoginError::from)
            })?;
            info!(
                "Updated {:?}: {} profile section(s)",
                options.paths.config,
                report.added.len()
            );
            Some(report)
        } else {
            None
        };

        println!(
            "Done: {} profile(s) written to {}",
            credentials_report.added.len(),
            options.paths.credentials.display()
        );

        Ok(LoginOutcome::Updated(LoginSummary {
            credentials: credentials_report,
            config: config_report,
            failures: fetched.failures,
            skipped_accounts: discovery.skipped_accounts,
        }))
    }
}
