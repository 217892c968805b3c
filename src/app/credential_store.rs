//! # Shared Credentials Store Codec
//!
//! Reads and writes the section-keyed `key = value` files used by the AWS CLI
//! and SDKs (`~/.aws/credentials`, `~/.aws/config`).
//!
//! ## Format
//!
//! ```text
//! [section name]
//! key = value
//! nested =
//!   sub_key = sub value
//! ```
//!
//! - Blank lines and lines starting with `#` or `;` are ignored.
//! - Indented lines directly after a key are continuation lines (the AWS
//!   config file uses them for nested settings such as `s3 =`). They are kept
//!   verbatim as part of the preceding value so unrelated sections survive a
//!   read-modify-write unchanged.
//! - A repeated section header merges into the first occurrence (later keys
//!   win). Files produced by tools that appended duplicate sections are healed
//!   on the next write.
//!
//! ## File Handling
//!
//! A missing file reads as an empty store. Writes create the parent directory,
//! go through a temporary file and a rename, and are restricted to the owner on
//! unix. [`update_file`] wraps the read-modify-write sequence in an exclusive
//! `fs2` lock on a sibling `.lock` file.

use fs2::FileExt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Errors raised while reading, parsing or writing a store file.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to lock {}: {source}", .path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("section [{section}] cannot be written: {message}")]
    Unrepresentable { section: String, message: String },
}

/// Ordered key/value pairs of one section. Keys are unique.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Section {
    entries: Vec<(String, String)>,
}

impl Section {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Set `key`, replacing the value in place when the key already exists.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Section {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut section = Section::new();
        for (key, value) in iter {
            section.set(key, value);
        }
        section
    }
}

/// A whole store file: named sections in file order. Section names are unique.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialStore {
    sections: Vec<(String, Section)>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse store text.
    pub fn parse(text: &str) -> Result<Self, StoreError> {
        let mut store = CredentialStore::new();
        let mut current: Option<String> = None;
        let mut last_key: Option<String> = None;

        for (index, raw_line) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = raw_line.trim();

            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            let indented = raw_line.starts_with(' ') || raw_line.starts_with('\t');
            if indented {
                if let (Some(section_name), Some(key)) = (&current, &last_key) {
                    let section = store.section_entry(section_name);
                    let mut value = section.get(key).unwrap_or_default().to_string();
                    value.push('\n');
                    value.push_str(raw_line.trim_end());
                    section.set(key.clone(), value);
                    continue;
                }
            }

            if line.starts_with('[') {
                if !line.ends_with(']') {
                    return Err(StoreError::Parse {
                        line: line_no,
                        message: format!("unterminated section header `{}`", line),
                    });
                }
                let name = line[1..line.len() - 1].trim();
                if name.is_empty() {
                    return Err(StoreError::Parse {
                        line: line_no,
                        message: "empty section name".to_string(),
                    });
                }
                store.section_entry(name);
                current = Some(name.to_string());
                last_key = None;
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(StoreError::Parse {
                    line: line_no,
                    message: format!("expected `key = value`, found `{}`", line),
                });
            };
            let key = key.trim();
            if key.is_empty() {
                return Err(StoreError::Parse {
                    line: line_no,
                    message: "empty key".to_string(),
                });
            }
            let Some(section_name) = &current else {
                return Err(StoreError::Parse {
                    line: line_no,
                    message: format!("key `{}` appears before any section header", key),
                });
            };

            store.section_entry(section_name).set(key, value.trim());
            last_key = Some(key.to_string());
        }

        Ok(store)
    }

    /// Render the store in file order, one blank line between sections.
    ///
    /// Fails on any section name, key or value that `parse` would read back
    /// differently.
    pub fn serialize(&self) -> Result<String, StoreError> {
        let mut out = String::new();
        for (index, (name, section)) in self.sections.iter().enumerate() {
            let unrepresentable = |message: String| StoreError::Unrepresentable {
                section: name.clone(),
                message,
            };
            check_section_name(name).map_err(unrepresentable)?;

            if index > 0 {
                out.push('\n');
            }
            out.push('[');
            out.push_str(name);
            out.push_str("]\n");
            for (key, value) in section.iter() {
                check_key(key).map_err(unrepresentable)?;
                check_value(key, value).map_err(unrepresentable)?;
                out.push_str(key);
                // nested blocks and empty values keep the bare `key =` form
                if value.is_empty() || value.starts_with('\n') {
                    out.push_str(" =");
                } else {
                    out.push_str(" = ");
                }
                out.push_str(value);
                out.push('\n');
            }
        }
        Ok(out)
    }

    pub fn get(&self, name: &str) -> Option<&Section> {
        self.sections
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Insert a section. An existing section of the same name is replaced
    /// wholesale at its current position.
    pub fn insert(&mut self, name: impl Into<String>, section: Section) {
        let name = name.into();
        match self.sections.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = section,
            None => self.sections.push((name, section)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Section> {
        let index = self.sections.iter().position(|(n, _)| n == name)?;
        Some(self.sections.remove(index).1)
    }

    pub fn section_names(&self) -> impl Iterator<Item = &str> {
        self.sections.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Section)> {
        self.sections.iter().map(|(n, s)| (n.as_str(), s))
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    fn section_entry(&mut self, name: &str) -> &mut Section {
        let index = match self.sections.iter().position(|(n, _)| n == name) {
            Some(index) => index,
            None => {
                self.sections.push((name.to_string(), Section::new()));
                self.sections.len() - 1
            }
        };
        &mut self.sections[index].1
    }

    /// Load a store from disk. A missing file is an empty store.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        match fs::read_to_string(path) {
            Ok(text) => {
                let store = Self::parse(&text)?;
                debug!("Loaded {} sections from {:?}", store.len(), path);
                Ok(store)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No store at {:?}, starting empty", path);
                Ok(Self::new())
            }
            Err(source) => Err(StoreError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Write the store, creating the parent directory on first use.
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let write_err = |source| StoreError::Write {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(write_err)?;
                info!("Created directory {:?}", parent);
            }
        }

        let text = self.serialize()?;
        let temp_path = sibling_path(path, "tmp");
        {
            let mut file = fs::File::create(&temp_path).map_err(write_err)?;
            restrict_permissions(&file);
            file.write_all(text.as_bytes()).map_err(write_err)?;
            file.sync_all().map_err(write_err)?;
        }
        fs::rename(&temp_path, path).map_err(write_err)?;

        debug!("Wrote {} sections to {:?}", self.len(), path);
        Ok(())
    }
}

/// Run a locked read-modify-write over the store at `path`.
///
/// `apply` receives the current contents and returns the replacement plus a
/// value handed back to the caller. Nothing is written when `apply` fails.
pub fn update_file<T, E>(
    path: &Path,
    apply: impl FnOnce(&CredentialStore) -> Result<(CredentialStore, T), E>,
) -> Result<T, E>
where
    E: From<StoreError>,
{
    let _lock = StoreLock::acquire(path)?;
    let current = CredentialStore::load(path)?;
    let (updated, value) = apply(&current)?;
    if updated != current {
        updated.save(path)?;
    } else {
        debug!("Store {:?} unchanged, skipping write", path);
    }
    Ok(value)
}

/// Exclusive advisory lock on `<store>.lock`, released on drop.
#[derive(Debug)]
pub struct StoreLock {
    file: fs::File,
    path: PathBuf,
}

impl StoreLock {
    pub fn acquire(store_path: &Path) -> Result<Self, StoreError> {
        let path = sibling_path(store_path, "lock");
        let lock_err = |source| StoreError::Lock {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(lock_err)?;
            }
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(lock_err)?;
        file.lock_exclusive().map_err(lock_err)?;
        debug!("Acquired store lock {:?}", path);

        Ok(Self { file, path })
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            debug!("Failed to release store lock {:?}: {}", self.path, e);
        }
    }
}

fn check_section_name(name: &str) -> Result<(), String> {
    if name.is_empty() || name.trim() != name {
        return Err("section names must be non-empty without surrounding whitespace".to_string());
    }
    if name.contains(['\n', '\r']) {
        return Err("section names cannot contain line breaks".to_string());
    }
    Ok(())
}

fn check_key(key: &str) -> Result<(), String> {
    if key.is_empty() || key.trim() != key {
        return Err(format!("key `{}` is empty or has surrounding whitespace", key));
    }
    if key.starts_with(['#', ';', '[']) {
        return Err(format!("key `{}` would be read as a comment or header", key));
    }
    if key.contains(['=', '\n', '\r']) {
        return Err(format!("key `{}` contains `=` or a line break", key));
    }
    Ok(())
}

/// Values are a single trimmed line, optionally followed by indented
/// continuation lines.
fn check_value(key: &str, value: &str) -> Result<(), String> {
    if value.contains('\r') {
        return Err(format!("value of `{}` contains a carriage return", key));
    }
    let mut lines = value.split('\n');
    let first = lines.next().unwrap_or_default();
    if first.trim() != first {
        return Err(format!("value of `{}` has surrounding whitespace", key));
    }
    for line in lines {
        let trimmed = line.trim();
        let indented = line.starts_with([' ', '\t']);
        if !indented
            || trimmed.is_empty()
            || trimmed.starts_with(['#', ';'])
            || line.trim_end() != line
        {
            return Err(format!(
                "value of `{}` has a continuation line that would not read back",
                key
            ));
        }
    }
    Ok(())
}

/// `credentials` + `lock` -> `credentials.lock`
pub fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

fn restrict_permissions(file: &fs::File) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = file.metadata() {
            let mut perms = metadata.permissions();
            perms.set_mode(0o600);
            if let Err(e) = file.set_permissions(perms) {
                tracing::warn!("Failed to restrict store permissions: {}", e);
            }
        }
    }
    #[cfg(not(unix))]
    let _ = file;
}
