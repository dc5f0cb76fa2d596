//! Binary entry point for the adept-openstack CLI.
//!
//! The host-description document is the only thing written to stdout; all
//! logging goes to stderr.

use std::env;
use std::ffi::{OsStr, OsString};
use std::io::{self, Write};
use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::Parser;
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use adept_openstack::config::ConfigError;
use adept_openstack::openstack::auth;
use adept_openstack::{
    CreateRequest, Invocation, OpenstackConfig, OpenstackError, Outcome, PollSettings,
    Provisioner, RequestCache, ServerLookup, Workspace, WorkspaceError,
};

mod cli;

use cli::{Cli, CreateCommand};

/// Link names that imply a subcommand, matched by prefix.
const PROGRAM_ALIASES: [(&str, &str); 3] = [
    ("openstack_discover_create", "discover-create"),
    ("openstack_exclusive_create", "exclusive-create"),
    ("openstack_destroy", "destroy"),
];

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    Openstack(#[from] OpenstackError),
    #[error("refusing to create {name}: it already exists at {address}")]
    Refused { name: String, address: String },
    #[error("cannot write the host description: {0}")]
    Output(String),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) | Self::Workspace(WorkspaceError::Missing { .. }) => 2,
            Self::Workspace(WorkspaceError::LockTimeout { .. }) => 6,
            Self::Openstack(err) => err.exit_code(),
            Self::Workspace(_) | Self::Refused { .. } | Self::Output(_) => 1,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse_from(with_implied_subcommand(env::args_os().collect()));
    init_logging(cli.common().verbose);

    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report_error(&err);
            ExitCode::from(err.exit_code())
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("adept_openstack={level},reqwest=warn,hyper=warn"))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn with_implied_subcommand(mut args: Vec<OsString>) -> Vec<OsString> {
    let implied = args
        .first()
        .and_then(|program| Path::new(program).file_name())
        .and_then(OsStr::to_str)
        .and_then(implied_subcommand);
    if let Some(subcommand) = implied
        && args
            .get(1)
            .is_none_or(|arg| arg.as_os_str() != OsStr::new(subcommand))
    {
        args.insert(1, OsString::from(subcommand));
    }
    args
}

fn implied_subcommand(program: &str) -> Option<&'static str> {
    PROGRAM_ALIASES
        .iter()
        .find(|(prefix, _)| program.starts_with(prefix))
        .map(|(_, subcommand)| *subcommand)
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    let config = OpenstackConfig::load_without_cli_args()?;
    let common = cli.common();
    let workspace = Workspace::new(Utf8PathBuf::from(common.workspace.trim()))?;
    let timeout = resolve_timeout(common.timeout, &config)?;
    let invocation = invocation(&cli, &config)?;
    let lock_dir = match &cli {
        Cli::DiscoverCreate(command) | Cli::ExclusiveCreate(command) => command
            .lockdir
            .as_deref()
            .map(str::trim)
            .filter(|dir| !dir.is_empty())
            .map(Utf8PathBuf::from)
            .or_else(|| config.lock_dir()),
        Cli::Destroy(_) => config.lock_dir(),
    };

    let workspace_lock = workspace.workspace_lock()?;
    workspace.prepare(&workspace_lock, timeout).await?;
    let address_lock = workspace.address_lock(lock_dir.as_deref())?;

    let (cloud_name, profile) = auth::load_profile(
        &auth::candidate_paths(workspace.root()),
        common.cloud.as_deref(),
    )?;
    info!(cloud = cloud_name, operation = invocation.operation(), "authenticating");
    let sessions = auth::authenticate(&profile).await?;

    let mut provisioner = Provisioner::new(
        RequestCache::new(sessions),
        address_lock,
        PollSettings::new(timeout),
    );
    let result = provisioner.execute(&invocation).await;
    if common.verbose
        && let Err(err) = workspace.write_api_dump(invocation.operation(), provisioner.rest())
    {
        warn!(error = %err, "could not write the API dump");
    }

    match result? {
        Outcome::Found(host) | Outcome::Created(host) => {
            let document = host.render()?;
            write!(io::stdout(), "{document}").map_err(|err| CliError::Output(err.to_string()))
        }
        Outcome::Refused(host) => Err(CliError::Refused {
            name: host.host_name,
            address: host.ansible_host,
        }),
        Outcome::Destroyed => {
            info!("destroy complete");
            Ok(())
        }
    }
}

fn resolve_timeout(flag: Option<u64>, config: &OpenstackConfig) -> Result<Duration, OpenstackError> {
    let timeout = flag.map_or_else(|| config.timeout(), Duration::from_secs);
    if timeout.is_zero() {
        return Err(OpenstackError::Usage(String::from("timeout must be positive")));
    }
    Ok(timeout)
}

fn invocation(cli: &Cli, config: &OpenstackConfig) -> Result<Invocation, OpenstackError> {
    match cli {
        Cli::DiscoverCreate(command) => Ok(Invocation::DiscoverCreate(create_request(command, config)?)),
        Cli::ExclusiveCreate(command) => Ok(Invocation::ExclusiveCreate(create_request(command, config)?)),
        Cli::Destroy(command) => {
            let name = command.name.trim();
            if name.is_empty() {
                return Err(OpenstackError::Usage(String::from("missing or invalid name")));
            }
            Ok(Invocation::Destroy(ServerLookup::by_name(name)))
        }
    }
}

fn create_request(command: &CreateCommand, config: &OpenstackConfig) -> Result<CreateRequest, OpenstackError> {
    let mut builder = CreateRequest::builder()
        .name(command.name.as_str())
        .image(command.image.clone().unwrap_or_else(|| config.default_image.clone()))
        .flavor(command.flavor.clone().unwrap_or_else(|| config.default_flavor.clone()))
        .private(command.private)
        .router_name(command.router.clone())
        .volume_size_gb(command.size)
        .userdata_template(command.userdata.as_deref().map(Utf8PathBuf::from));
    for key in &command.pubkeys {
        builder = builder.public_key_file(key.as_str());
    }
    builder.build()
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
