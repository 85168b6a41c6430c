//! stackconf cli interface

use clap::{Args, Parser, Subcommand, ValueEnum};
use stackconf::identifier::InfraType;
use std::fmt::Formatter;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Change the work directory
    ///
    /// Can be specified multiple times. Note that all
    /// paths on the way to the final path must exist.
    ///
    /// This is equivalent to running { cd <directory>; stackconf ... }
    #[clap(short = 'C', long = "directory", global(true))]
    pub directory: Vec<PathBuf>,

    /// Engine configuration (yaml)
    #[clap(short = 'c', long = "config", global(true))]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create or update the configuration of one stack
    #[command(alias = "synth")]
    Synthesize(SynthesizeCommand),

    /// Write the configuration of a deployed stack as is
    Import(ImportCommand),

    /// Store defaults for one scope as a settings file
    ///
    /// Values the lower scopes already resolve to are left out of the file.
    SaveLayer(SaveLayerCommand),
}

#[derive(Args, Debug)]
pub struct StackArgs {
    pub infra_type: InfraType,

    pub prefix: String,

    /// Required for every infra type except service-role
    pub project_id: Option<String>,

    /// Required for pipeline and network
    pub stage_id: Option<String>,

    /// Saved output of `aws cloudformation describe-stacks`
    #[clap(short = 's', long = "snapshot-file")]
    pub snapshot_file: Option<PathBuf>,

    /// Credentials profile for remote calls
    #[clap(long = "profile")]
    pub profile: Option<String>,

    /// Region for remote calls
    #[clap(long = "region")]
    pub region: Option<String>,
}

#[derive(Args, Debug)]
pub struct SynthesizeCommand {
    #[clap(flatten)]
    pub stack: StackArgs,

    /// Template file name (below templates/<infra type>/) or s3://bucket/key[?versionId=..]
    ///
    /// Defaults to the template recorded in the existing configuration or on the deployed stack.
    #[clap(short = 't', long = "template")]
    pub template: Option<String>,

    /// What to do when the configuration and the deployed stack disagree
    ///
    /// Without this flag the question is asked, or the run aborts with --no-input.
    #[clap(long = "on-drift")]
    pub on_drift: Option<DriftPolicy>,

    /// Accept every offered value instead of asking
    #[clap(long = "no-input")]
    pub no_input: bool,

    /// Bucket for deploy artifacts
    #[clap(long = "s3-bucket")]
    pub s3_bucket: Option<String>,

    /// Role the deploy tool assumes
    #[clap(long = "role-arn")]
    pub role_arn: Option<String>,
}

#[derive(Args, Debug)]
pub struct ImportCommand {
    #[clap(flatten)]
    pub stack: StackArgs,
}

#[derive(Args, Debug)]
pub struct SaveLayerCommand {
    #[clap(flatten)]
    pub stack: StackArgs,

    #[clap(long = "scope")]
    pub scope: Scope,

    #[clap(long = "kind", default_value = "params")]
    pub kind: Kind,

    /// KEY=VALUE, can be specified multiple times
    #[clap(short = 'e', long = "entry", required(true))]
    pub entries: Vec<String>,
}

/// Settings file a layer is stored in
#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum Scope {
    /// <kind>.json
    Global,
    /// <kind>-<prefix>.json
    Prefix,
    /// <kind>-<prefix>-<project>.json
    PrefixProject,
    /// <infra type>/<kind>.json
    Infra,
    /// <infra type>/<kind>-<prefix>.json
    InfraPrefix,
    /// <infra type>/<kind>-<prefix>-<project>.json
    InfraProject,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum Kind {
    Params,
    Tags,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum DriftPolicy {
    UseLocal,
    UseDeployed,
    Abort,
}

impl std::fmt::Display for DriftPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DriftPolicy::UseLocal => f.write_str("use-local"),
            DriftPolicy::UseDeployed => f.write_str("use-deployed"),
            DriftPolicy::Abort => f.write_str("abort"),
        }
    }
}
