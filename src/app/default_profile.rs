//! Promote a named credentials profile to `[default]`.
//!
//! The current default is kept under the name recorded in its `profile_name`
//! key (or the name supplied by the operator) so switching back is another
//! `use` away. A section already stored under that name wins over the default
//! copy, since a later `login` may have refreshed it. The previous file is
//! copied to `<credentials>.bak` first.

use crate::app::credential_store::{sibling_path, CredentialStore, Section, StoreError, StoreLock};
use crate::app::profile_merge::{ACCESS_KEY_ID_KEY, PROFILE_NAME_KEY};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_SECTION: &str = "default";

#[derive(Debug, Error)]
pub enum PromotionError {
    #[error("profile `{0}` not found in the credentials file")]
    ProfileNotFound(String),

    #[error("the current default profile has no profile_name; pass --save-previous-as <name> to keep it")]
    PreviousDefaultUnnamed,

    #[error("`{0}` cannot be used as a profile name here")]
    InvalidTarget(String),

    #[error("credentials file {} does not exist", .0.display())]
    MissingStore(PathBuf),

    #[error("failed to back up {} to {}: {source}", .from.display(), .to.display())]
    Backup {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What happened to the default that was replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviousDisposition {
    /// Written to a new section.
    Saved,
    /// An identical section already existed.
    AlreadySaved,
    /// A different section of that name exists and was kept; the old default
    /// only survives in the backup.
    Discarded,
}

/// The default that was replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviousDefault {
    pub name: String,
    /// Last four characters of its access key id.
    pub access_key_suffix: Option<String>,
    pub disposition: PreviousDisposition,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromotionReport {
    pub profile: String,
    pub previous: Option<PreviousDefault>,
}

fn same_entries(a: &Section, b: &Section) -> bool {
    a.len() == b.len() && a.iter().all(|(key, value)| b.get(key) == Some(value))
}

fn key_suffix(access_key_id: &str) -> String {
    let chars: Vec<char> = access_key_id.chars().collect();
    chars[chars.len().saturating_sub(4)..].iter().collect()
}

/// Compute the store with `profile` as the new default.
pub fn promote_default(
    store: &CredentialStore,
    profile: &str,
    save_previous_as: Option<&str>,
) -> Result<(CredentialStore, PromotionReport), PromotionError> {
    if profile == DEFAULT_SECTION {
        return Err(PromotionError::InvalidTarget(profile.to_string()));
    }
    if !store.contains(profile) {
        return Err(PromotionError::ProfileNotFound(profile.to_string()));
    }

    let mut updated = store.clone();
    let mut previous = None;

    if let Some(current_default) = store.get(DEFAULT_SECTION) {
        let name = current_default
            .get(PROFILE_NAME_KEY)
            .filter(|n| !n.is_empty())
            .or(save_previous_as.filter(|n| !n.is_empty()))
            .ok_or(PromotionError::PreviousDefaultUnnamed)?
            .to_string();
        if name == DEFAULT_SECTION {
            return Err(PromotionError::InvalidTarget(name));
        }

        let mut kept = current_default.clone();
        kept.set(PROFILE_NAME_KEY, name.as_str());
        let disposition = match store.get(&name) {
            None => {
                debug!("Keeping previous default as [{}]", name);
                updated.insert(name.clone(), kept);
                PreviousDisposition::Saved
            }
            Some(existing) => {
                let mut existing = existing.clone();
                existing.set(PROFILE_NAME_KEY, name.as_str());
                if same_entries(&existing, &kept) {
                    PreviousDisposition::AlreadySaved
                } else {
                    warn!(
                        "Previous default differs from [{}]; keeping the stored section",
                        name
                    );
                    PreviousDisposition::Discarded
                }
            }
        };

        previous = Some(PreviousDefault {
            access_key_suffix: current_default.get(ACCESS_KEY_ID_KEY).map(key_suffix),
            name,
            disposition,
        });
    }

    let unnamed: Vec<String> = updated
        .iter()
        .filter(|(name, section)| *name != DEFAULT_SECTION && !section.contains_key(PROFILE_NAME_KEY))
        .map(|(name, _)| name.to_string())
        .collect();
    for name in unnamed {
        if let Some(mut section) = updated.get(&name).cloned() {
            section.set(PROFILE_NAME_KEY, name.as_str());
            updated.insert(name, section);
        }
    }

    let mut new_default = updated
        .get(profile)
        .cloned()
        .ok_or_else(|| PromotionError::ProfileNotFound(profile.to_string()))?;
    new_default.set(PROFILE_NAME_KEY, profile);
    updated.insert(DEFAULT_SECTION, new_default);

    Ok((
        updated,
        PromotionReport {
            profile: profile.to_string(),
            previous,
        },
    ))
}

pub fn backup_path(credentials_path: &Path) -> PathBuf {
    sibling_path(credentials_path, "bak")
}

/// Promote `profile` in the credentials file at `path`, backing it up first.
pub fn use_profile(
    path: &Path,
    profile: &str,
    save_previous_as: Option<&str>,
) -> Result<PromotionReport, PromotionError> {
    let _lock = StoreLock::acquire(path)?;
    if !path.exists() {
        return Err(PromotionError::MissingStore(path.to_path_buf()));
    }

    let current = CredentialStore::load(path)?;
    let (updated, report) = promote_default(&current, profile, save_previous_as)?;

    let backup = backup_path(path);
    fs::copy(path, &backup).map_err(|source| PromotionError::Backup {
        from: path.to_path_buf(),
        to: backup.clone(),
        source,
    })?;
    debug!("Backed up {:?} to {:?}", path, backup);

    updated.save(path)?;
    info!("Profile {} is now the default", profile);
    Ok(report)
}
