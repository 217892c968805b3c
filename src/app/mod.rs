//! Core modules for `awslogin`.
//!
//! # Module Organization
//!
//! ## Login
//! - [`device_authorization`] - OAuth device authorization against Identity Center
//! - [`sso_discovery`] - account and role discovery through the SSO portal
//! - [`credential_fetch`] - temporary credentials per discovered role
//! - [`profile_merge`] - replace-by-name merge of profiles into the stores
//! - [`login`] - orchestrates one login run end to end
//!
//! ## Local Files
//! - [`credential_store`] - codec and locked atomic I/O for `~/.aws/credentials` and `~/.aws/config`
//! - [`default_profile`] - promote a profile to `[default]`
//! - [`config`] - `config.toml` and store locations
//!
//! ## CI/CD Trust
//! - [`trust_provisioning`] - OIDC provider, role and inline policy for pipeline federation
//!
//! ## AWS Integration
//! - [`aws_clients`] - SDK-backed implementations of the provider traits
//!
//! Every remote call goes through a trait ([`device_authorization::OidcProvider`],
//! [`sso_discovery::SsoPortal`], [`trust_provisioning::IamControlPlane`]) so the
//! workflows run against in-memory fakes in tests.

pub mod aws_clients;
pub mod config;
pub mod credential_fetch;
pub mod credential_store;
pub mod default_profile;
pub mod device_authorization;
pub mod login;
pub mod profile_merge;
pub mod sso_discovery;
pub mod trust_provisioning;
