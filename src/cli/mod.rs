//! Command-line interface definitions for the `adept-openstack` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser};

/// Top-level CLI for the `adept-openstack` binary.
#[derive(Debug, Parser)]
#[command(
    name = "adept-openstack",
    about = "Discover, create, or destroy a single OpenStack VM for a CI job",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Report the named VM, creating it first when it does not exist.
    #[command(
        name = "discover-create",
        about = "Report the named VM, creating it first when it does not exist"
    )]
    DiscoverCreate(CreateCommand),
    /// Create the named VM, refusing when it already exists.
    #[command(
        name = "exclusive-create",
        about = "Create the named VM, refusing when it already exists"
    )]
    ExclusiveCreate(CreateCommand),
    /// Destroy the named VM and its volumes.
    #[command(name = "destroy", about = "Destroy the named VM and its volumes")]
    Destroy(DestroyCommand),
}

/// Options shared by every operation.
#[derive(Debug, Args)]
pub(crate) struct CommonArgs {
    /// Log every request and write the API history to the workspace.
    #[arg(long, short = 'v')]
    pub(crate) verbose: bool,
    /// Deadline in seconds for each long-running step.
    ///
    /// Overrides `timeout_secs` from configuration (default 300).
    #[arg(long, short = 't', value_name = "SECONDS")]
    pub(crate) timeout: Option<u64>,
    /// Existing, writable directory owned by this job.
    #[arg(long, env = "WORKSPACE", value_name = "DIR")]
    pub(crate) workspace: String,
    /// Cloud profile in `clouds.yaml`; the first profile when omitted.
    #[arg(long, env = "OS_CLOUD_NAME", value_name = "CLOUD")]
    pub(crate) cloud: Option<String>,
}

/// Arguments for the create operations.
#[derive(Debug, Args)]
pub(crate) struct CreateCommand {
    #[command(flatten)]
    pub(crate) common: CommonArgs,
    /// Image to boot when creating, instead of the configured default.
    #[arg(long, short = 'i', value_name = "IMAGE")]
    pub(crate) image: Option<String>,
    /// Flavor to use when creating, instead of the configured default.
    #[arg(long, short = 'f', value_name = "FLAVOR")]
    pub(crate) flavor: Option<String>,
    /// Router whose gateway carries the floating address, instead of the
    /// first one found.
    #[arg(long, short = 'r', value_name = "ROUTER")]
    pub(crate) router: Option<String>,
    /// Report the fixed address and never assign a floating one.
    #[arg(long, short = 'p')]
    pub(crate) private: bool,
    /// Also create and attach a volume of SIZE gigabytes.
    #[arg(long, short = 's', value_name = "SIZE")]
    pub(crate) size: Option<u32>,
    /// Cloud-config template used instead of the built-in one.
    #[arg(long, short = 'u', value_name = "PATH")]
    pub(crate) userdata: Option<String>,
    /// Directory holding the host-wide floating address lock.
    #[arg(long, short = 'l', value_name = "DIR")]
    pub(crate) lockdir: Option<String>,
    /// VM name to search for or create.
    pub(crate) name: String,
    /// Public key files granted root access on a new VM.
    #[arg(required = true, num_args = 1.., value_name = "PUBKEY")]
    pub(crate) pubkeys: Vec<String>,
}

/// Arguments for the destroy operation.
#[derive(Debug, Args)]
pub(crate) struct DestroyCommand {
    #[command(flatten)]
    pub(crate) common: CommonArgs,
    /// VM name to destroy.
    pub(crate) name: String,
}

impl Cli {
    /// Options shared by every operation.
    pub(crate) const fn common(&self) -> &CommonArgs {
        match self {
            Self::DiscoverCreate(command) | Self::ExclusiveCreate(command) => &command.common,
            Self::Destroy(command) => &command.common,
        }
    }
}
