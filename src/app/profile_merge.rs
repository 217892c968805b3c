//! # Profile Merge Engine
//!
//! Computes new store contents from freshly fetched role credentials. Pure: no
//! I/O, the caller reads and writes through
//! [`credential_store`](crate::app::credential_store).
//!
//! ## Replace-by-name
//!
//! 1. Every credential gets a profile name from [`ProfileNaming`].
//! 2. All sections carrying one of those names are deleted.
//! 3. A fresh section is appended per credential.
//! 4. Unrelated sections pass through untouched.
//!
//! A section is never field-merged with its previous version, so expired
//! secret material or keys from an older layout cannot leak into the new
//! profile. Running the same merge twice yields the same store.

use crate::app::credential_fetch::RoleCredential;
use crate::app::credential_store::{CredentialStore, Section};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

pub const ACCESS_KEY_ID_KEY: &str = "aws_access_key_id";
pub const SECRET_ACCESS_KEY_KEY: &str = "aws_secret_access_key";
pub const SESSION_TOKEN_KEY: &str = "aws_session_token";
/// Records which profile a section was written for; `use` relies on it.
pub const PROFILE_NAME_KEY: &str = "profile_name";

pub const REGION_KEY: &str = "region";
pub const OUTPUT_KEY: &str = "output";

/// How a credential's identity maps to a profile name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProfileNaming {
    /// `<account name>-<role name>`
    #[default]
    AccountNameRole,
    /// `<account id>-<role name>`
    AccountIdRole,
    /// `<account name>`; collides when one account has several roles.
    AccountName,
}

impl ProfileNaming {
    pub fn profile_name(&self, credential: &RoleCredential) -> String {
        let account_label = {
            let name = sanitize_profile_name(&credential.account_name);
            if name.is_empty() {
                sanitize_profile_name(&credential.account_id)
            } else {
                name
            }
        };
        let role = sanitize_profile_name(&credential.role_name);

        match self {
            ProfileNaming::AccountNameRole => format!("{}-{}", account_label, role),
            ProfileNaming::AccountIdRole => {
                format!("{}-{}", sanitize_profile_name(&credential.account_id), role)
            }
            ProfileNaming::AccountName => account_label,
        }
    }
}

/// Replace control characters (newlines included) with spaces and trim, so a
/// name can never open a second section header.
pub fn sanitize_profile_name(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect::<String>()
        .trim()
        .to_string()
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MergeError {
    #[error("profile name `{name}` would be written for both {first} and {second}; choose a different profile naming")]
    NameCollision {
        name: String,
        first: String,
        second: String,
    },

    #[error("profile name `{name}` for {owner} is empty or reserved")]
    UnusableName { name: String, owner: String },
}

/// Section names touched by a merge, in the order they were processed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub removed: Vec<String>,
    pub added: Vec<String>,
}

/// Section names a fetched profile must never take over.
const RESERVED_PROFILE_NAMES: &[&str] = &["default"];

/// Name every credential, rejecting a batch where two of them share a name
/// or where a name is empty or reserved.
pub fn plan_profile_names<'c>(
    credentials: &'c [RoleCredential],
    naming: ProfileNaming,
) -> Result<Vec<(String, &'c RoleCredential)>, MergeError> {
    let mut owners: HashMap<String, String> = HashMap::new();
    let mut planned = Vec::with_capacity(credentials.len());

    for credential in credentials {
        let name = naming.profile_name(credential);
        let owner = format!("{}/{}", credential.account_id, credential.role_name);
        if name.is_empty() || RESERVED_PROFILE_NAMES.contains(&name.as_str()) {
            return Err(MergeError::UnusableName { name, owner });
        }
        if let Some(first) = owners.get(&name) {
            return Err(MergeError::NameCollision {
                name,
                first: first.clone(),
                second: owner,
            });
        }
        owners.insert(name.clone(), owner);
        planned.push((name, credential));
    }

    Ok(planned)
}

/// The four keys written per credentials profile.
pub fn credential_section(profile_name: &str, credential: &RoleCredential) -> Section {
    [
        (ACCESS_KEY_ID_KEY, credential.access_key_id.as_str()),
        (SECRET_ACCESS_KEY_KEY, credential.secret_access_key.as_str()),
        (SESSION_TOKEN_KEY, credential.session_token.as_str()),
        (PROFILE_NAME_KEY, profile_name),
    ]
    .into_iter()
    .collect()
}

/// Delete-then-insert `replacements` into a copy of `store`.
pub fn replace_sections(
    store: &CredentialStore,
    replacements: Vec<(String, Section)>,
) -> (CredentialStore, MergeReport) {
    let mut merged = store.clone();
    let mut report = MergeReport::default();

    for (name, _) in &replacements {
        if merged.remove(name).is_some() {
            debug!("Removed section [{}]", name);
            report.removed.push(name.clone());
        }
    }

    for (name, section) in replacements {
        debug!("Inserted section [{}]", name);
        report.added.push(name.clone());
        merged.insert(name, section);
    }

    (merged, report)
}

/// Merge credentials into the shared credentials store.
pub fn merge_credentials(
    store: &CredentialStore,
    credentials: &[RoleCredential],
    naming: ProfileNaming,
) -> Result<(CredentialStore, MergeReport), MergeError> {
    let replacements = plan_profile_names(credentials, naming)?
        .into_iter()
        .map(|(name, credential)| {
            let section = credential_section(&name, credential);
            (name, section)
        })
        .collect();

    Ok(replace_sections(store, replacements))
}

/// Merge `[profile <name>]` sections into the shared config store.
pub fn merge_config_profiles(
    store: &CredentialStore,
    credentials: &[RoleCredential],
    naming: ProfileNaming,
    region: &str,
    output: &str,
) -> Result<(CredentialStore, MergeReport), MergeError> {
    let replacements = plan_profile_names(credentials, naming)?
        .into_iter()
        .map(|(name, _)| {
            let section: Section = [(REGION_KEY, region), (OUTPUT_KEY, output)]
                .into_iter()
                .collect();
            (config_section_name(&name), section)
        })
        .collect();

    Ok(replace_sections(store, replacements))
}

/// Config file section for a profile (`default` is not prefixed).
pub fn config_section_name(profile_name: &str) -> String {
    if profile_name == "default" {
        profile_name.to_string()
    } else {
        format!("profile {}", profile_name)
    }
}
