//! awslogin - AWS IAM Identity Center login and CI/CD trust provisioning
//!
//! Signs an operator in through the Identity Center device authorization
//! flow, fetches temporary credentials for every permitted (account, role)
//! pair and merges them into the shared AWS credentials file as named
//! profiles. A second workflow provisions the IAM side of OIDC federation for
//! Azure DevOps pipelines.
//!
//! # Architecture Overview
//!
//! - **Workflows** ([`app::login`], [`app::trust_provisioning`],
//!   [`app::default_profile`]): ordered stages with explicit failure semantics
//! - **Pure transforms** ([`app::profile_merge`], [`app::credential_store`]
//!   codec): no I/O, directly testable
//! - **Integration layer** ([`app::aws_clients`]): AWS SDK calls behind traits
//!
//! The binary in `main.rs` wires configuration, logging and the SDK clients
//! together.

#![warn(clippy::all, rust_2018_idioms)]

pub mod app;
