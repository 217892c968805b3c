#![warn(clippy::all, rust_2018_idioms)]

use anyhow::Context;
use awslogin::app::aws_clients::{
    load_sdk_config, SdkIamControlPlane, SdkOidcProvider, SdkSsoPortal,
};
use awslogin::app::config::{AppConfig, ConfigError, StorePaths, DEFAULT_PIPELINE_USER};
use awslogin::app::default_profile::{backup_path, use_profile, PreviousDisposition};
use awslogin::app::device_authorization::TokioSleeper;
use awslogin::app::login::{LoginOptions, LoginOutcome, LoginWorkflow};
use awslogin::app::trust_provisioning::{StepOutcome, TrustConfig, TrustProvisioner};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::prelude::*;

const ROLE_SESSION_NAME: &str = "azdo-session";

/// AWS IAM Identity Center login and CI/CD trust provisioning
#[derive(Parser)]
#[command(name = "awslogin")]
#[command(author, version, about, long_about = None)]
#[command(long_version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_BRANCH"), " ", env!("GIT_COMMIT"), ")"))]
#[command(propagate_version = true)]
struct Cli {
    /// Path to config.toml (defaults to $AWSLOGIN_CONFIG, then the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Also log to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in through Identity Center and refresh all role profiles
    Login {
        /// Print the verification URL without opening a browser
        #[arg(long)]
        no_browser: bool,
    },

    /// Make a profile the [default] credentials profile
    Use {
        profile: String,

        /// Name to keep the current default under when it has no profile_name
        #[arg(long)]
        save_previous_as: Option<String>,
    },

    /// Manage the IAM OIDC trust used by Azure DevOps pipelines
    #[command(subcommand)]
    Oidc(OidcCommands),
}

#[derive(Subcommand)]
enum OidcCommands {
    /// Create (or refresh) the OIDC provider, pipeline role and policy
    Create(TrustArgs),

    /// Delete the pipeline role and policy
    Delete {
        #[command(flatten)]
        trust: TrustArgs,

        /// Also delete the OIDC provider (shared by every role trusting it)
        #[arg(long)]
        all: bool,
    },
}

#[derive(Args)]
struct TrustArgs {
    /// Azure DevOps organization
    #[arg(long)]
    org: String,

    /// Azure DevOps project
    #[arg(long)]
    project: String,

    /// Prefix for the role and policy names
    #[arg(long, default_value = DEFAULT_PIPELINE_USER)]
    pipeline_user: String,

    /// Restrict the trust to one service connection; any in the project otherwise
    #[arg(long)]
    pipeline: Option<String>,
}

fn init_logging(verbose: bool) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        .parse(std::env::var("RUST_LOG").unwrap_or_else(|_| {
            "awslogin=info,aws_config=warn,aws_sigv4=warn,aws_smithy_runtime=warn,aws_smithy_runtime_api=warn,hyper=warn".to_string()
        }))
        .context("invalid RUST_LOG filter")?;

    let stderr_layer = verbose.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
    });

    let file_layer = match directories::ProjectDirs::from("com", "", "awslogin") {
        Some(proj_dirs) => {
            let log_dir = proj_dirs.data_dir().join("logs");
            std::fs::create_dir_all(&log_dir)
                .with_context(|| format!("failed to create log directory {:?}", log_dir))?;
            let log_path = log_dir.join("awslogin.log");

            let file = std::fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(&log_path)
                .with_context(|| format!("failed to open log file {:?}", log_path))?;

            // Owner read/write only
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(metadata) = file.metadata() {
                    let mut perms = metadata.permissions();
                    perms.set_mode(0o600);
                    if let Err(e) = std::fs::set_permissions(&log_path, perms) {
                        eprintln!("Failed to set log file permissions: {}", e);
                    }
                }
            }

            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    tracing::debug!("Logging initialized");
    Ok(())
}

fn load_config(explicit: Option<&std::path::Path>) -> anyhow::Result<AppConfig> {
    let path = AppConfig::resolve_path(explicit).ok_or(ConfigError::NoHomeDirectory)?;
    Ok(AppConfig::load(&path)?)
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, stopping...");
            token.cancel();
        }
    });
    cancel
}

async fn run_login(cli: &Cli, no_browser: bool) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;
    let settings = config.login()?;
    let paths = StorePaths::from_env()?;

    let options = LoginOptions {
        start_url: settings.normalized_start_url(),
        region: settings.region.clone(),
        output: settings.output.clone(),
        filters: settings.discovery_filters(),
        naming: settings.profile_naming,
        open_browser: !no_browser,
        write_config_file: settings.write_config_file,
        paths,
    };

    let sdk_config = load_sdk_config(Some(&settings.region)).await;
    let oidc = SdkOidcProvider::new(&sdk_config);
    let portal = SdkSsoPortal::new(&sdk_config);
    let sleeper = TokioSleeper;

    let cancel = cancel_on_ctrl_c();
    let outcome = LoginWorkflow::new(&oidc, &portal, &sleeper)
        .run(&options, &cancel)
        .await?;

    match outcome {
        LoginOutcome::Updated(summary) if !summary.failures.is_empty() => {
            println!(
                "{} role(s) could not be refreshed; see messages above.",
                summary.failures.len()
            );
        }
        LoginOutcome::Updated(_) => {}
        LoginOutcome::NoRoles { .. } | LoginOutcome::NoCredentials { .. } => {
            anyhow::bail!("no credentials were written");
        }
    }
    Ok(())
}

fn run_use(profile: &str, save_previous_as: Option<&str>) -> anyhow::Result<()> {
    let paths = StorePaths::from_env()?;
    let report = use_profile(&paths.credentials, profile, save_previous_as)?;

    println!("Profile \"{}\" has been set as the default profile.", report.profile);
    if let Some(previous) = report.previous {
        match (previous.disposition, previous.access_key_suffix) {
            (PreviousDisposition::Discarded, suffix) => println!(
                "The previous default (access key ID ending in {}) differed from the stored profile \"{}\"; the stored profile was kept.",
                suffix.as_deref().unwrap_or("?"),
                previous.name
            ),
            (_, Some(suffix)) => println!(
                "The previous default profile \"{}\" was saved with access key ID ending in {}.",
                previous.name, suffix
            ),
            (_, None) => println!("The previous default profile was saved as \"{}\".", previous.name),
        }
    }
    println!("Backup written to {}", backup_path(&paths.credentials).display());
    Ok(())
}

fn trust_config(cli: &Cli, args: &TrustArgs) -> anyhow::Result<TrustConfig> {
    let config = load_config(cli.config.as_deref())?;
    Ok(config.oidc()?.trust_config(
        &args.org,
        &args.project,
        args.pipeline.as_deref(),
        &args.pipeline_user,
    )?)
}

async fn run_oidc_create(cli: &Cli, args: &TrustArgs) -> anyhow::Result<()> {
    let trust = trust_config(cli, args)?;
    let sdk_config = load_sdk_config(None).await;
    let iam = SdkIamControlPlane::new(&sdk_config);

    let report = TrustProvisioner::new(&iam, &trust).create().await?;
    for step in &report.steps {
        println!("{}", step);
    }

    println!();
    println!("Service connection settings:");
    println!("  OIDC provider URL: {}", trust.oidc_provider_url);
    println!("  Audience:          {}", trust.audience);
    println!("  Role ARN:          {}", report.role_arn);
    println!("  Thumbprint:        {}", trust.thumbprint);
    println!("  Organization:      {}", trust.organization);
    println!("  Project:           {}", trust.project);
    println!(
        "  Pipeline:          {}",
        trust.pipeline.as_deref().unwrap_or("<any pipeline in project>")
    );
    println!("  Role session name: {}", ROLE_SESSION_NAME);
    Ok(())
}

async fn run_oidc_delete(cli: &Cli, args: &TrustArgs, all: bool) -> anyhow::Result<()> {
    let trust = trust_config(cli, args)?;
    if all {
        println!(
            "Warning: deleting the OIDC provider {} affects every role that trusts it.",
            trust.oidc_provider_url
        );
    }
    let sdk_config = load_sdk_config(None).await;
    let iam = SdkIamControlPlane::new(&sdk_config);

    let report = TrustProvisioner::new(&iam, &trust).delete(all).await?;
    for step in &report.steps {
        println!("{}", step);
    }
    if report
        .steps
        .iter()
        .all(|s| s.outcome == StepOutcome::AlreadyAbsent)
    {
        println!("Nothing to delete.");
    }
    Ok(())
}

async fn run(cli: &Cli) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Login { no_browser } => run_login(cli, *no_browser).await,
        Commands::Use {
            profile,
            save_previous_as,
        } => run_use(profile, save_previous_as.as_deref()),
        Commands::Oidc(OidcCommands::Create(args)) => run_oidc_create(cli, args).await,
        Commands::Oidc(OidcCommands::Delete { trust, all }) => {
            run_oidc_delete(cli, trust, *all).await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.verbose) {
        eprintln!("Logging disabled: {:#}", e);
    }
    tracing::info!("awslogin {} starting", env!("CARGO_PKG_VERSION"));

    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
