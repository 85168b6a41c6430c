mod cli;

use stackconf::cascade::{LayerKind, LayerScope};
use stackconf::contract::{ConstraintViolation, ParameterSpec, TemplateSource};
use stackconf::document::{keys, Pairs};
use stackconf::drift::{self, DriftEntry, ResolveDrift, Resolution};
use stackconf::identifier::{EnvironmentKey, Identifier};
use stackconf::prompt::{AcceptDefaults, Decision, ParameterPrompt};
use stackconf::snapshot::{DescribeStacksFile, SessionContext};
use stackconf::synthesis::{Synthesis, SynthesisRequest, Synthesizer};
use stackconf::{config::EngineConfig, settings};
use std::io::{BufRead, Write};

fn main() {
    use clap::Parser;
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("STACKCONF_LOG"))
        .with_writer(std::io::stderr)
        .init();

    for new_path in cli.directory.iter() {
        match new_path.canonicalize() {
            Err(e) => {
                eprintln!(
                    "Failed to resolve path for -C/--directory {}\n{}",
                    new_path.display(),
                    e
                );
                std::process::exit(1);
            }
            Ok(cwd) => {
                if let Err(err) = std::env::set_current_dir(&cwd) {
                    eprintln!("Failed to set work directory to {}\n{}", cwd.display(), err,);
                    std::process::exit(1);
                }

                tracing::info!(directory=%cwd.display(), "Changed working directory");
            }
        }
    }

    let command_result = load_config(&cli).and_then(|config| match cli.command {
        cli::Command::Synthesize(synth_cli) => synthesize(&config, synth_cli),
        cli::Command::Import(import_cli) => import(&config, import_cli),
        cli::Command::SaveLayer(save_cli) => save_layer(&config, save_cli),
    });

    if let Err(e) = command_result {
        for error in e.chain() {
            eprintln!("{error}")
        }
        std::process::exit(1);
    }
}

fn load_config(cli: &cli::Cli) -> anyhow::Result<EngineConfig> {
    Ok(match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    })
}

fn identifier(stack: &cli::StackArgs) -> anyhow::Result<Identifier> {
    Ok(Identifier::new(
        stack.infra_type,
        stack.prefix.as_str(),
        stack.project_id.clone(),
        stack.stage_id.clone(),
    )?)
}

fn session(stack: &cli::StackArgs) -> SessionContext {
    SessionContext::new(stack.profile.clone(), stack.region.clone())
}

/// Command line as recorded in the provenance header
fn arguments() -> Vec<String> {
    std::env::args().skip(1).collect()
}

pub fn synthesize(config: &EngineConfig, cli: cli::SynthesizeCommand) -> anyhow::Result<()> {
    let mut request = SynthesisRequest::new(identifier(&cli.stack)?);
    request.template = cli
        .template
        .as_deref()
        .map(TemplateSource::parse)
        .transpose()?;
    request.role_arn = cli.role_arn.clone();
    request.arguments = arguments();
    if let Some(bucket) = &cli.s3_bucket {
        request.global.insert(keys::S3_BUCKET.into(), bucket.as_str().into());
    }
    if let Some(region) = &cli.stack.region {
        request.global.insert(keys::REGION.into(), region.as_str().into());
    }

    let snapshot_file = cli.stack.snapshot_file.as_ref().map(DescribeStacksFile::new);
    let mut synthesizer = Synthesizer::new(config, ".").with_session(session(&cli.stack));
    if let Some(file) = &snapshot_file {
        synthesizer = synthesizer.with_stack_query(file);
    }

    let mut drift: Box<dyn ResolveDrift> = match (cli.on_drift, cli.no_input) {
        (Some(cli::DriftPolicy::UseLocal), _) => Box::new(Resolution::UseLocal),
        (Some(cli::DriftPolicy::UseDeployed), _) => Box::new(Resolution::UseDeployed),
        (Some(cli::DriftPolicy::Abort), _) | (None, true) => Box::new(Resolution::Abort),
        (None, false) => Box::new(AskDrift),
    };
    let mut prompt: Box<dyn ParameterPrompt> = if cli.no_input {
        Box::new(AcceptDefaults)
    } else {
        Box::new(AskParameter)
    };

    let synthesis = synthesizer.synthesize(&request, drift.as_mut(), prompt.as_mut())?;
    report(&synthesis);
    Ok(())
}

pub fn import(config: &EngineConfig, cli: cli::ImportCommand) -> anyhow::Result<()> {
    let id = identifier(&cli.stack)?;
    let Some(snapshot_file) = &cli.stack.snapshot_file else {
        anyhow::bail!("import needs the deployed state: pass --snapshot-file");
    };

    let file = DescribeStacksFile::new(snapshot_file);
    let synthesis = Synthesizer::new(config, ".")
        .with_session(session(&cli.stack))
        .with_stack_query(&file)
        .import_snapshot(&id, arguments())?;
    report(&synthesis);
    Ok(())
}

pub fn save_layer(config: &EngineConfig, cli: cli::SaveLayerCommand) -> anyhow::Result<()> {
    let id = identifier(&cli.stack)?;
    let entries = cli
        .entries
        .iter()
        .map(|entry| match entry.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(anyhow::anyhow!("expected KEY=VALUE, got {entry:?}")),
        })
        .collect::<anyhow::Result<Pairs>>()?;

    let scope = match cli.scope {
        cli::Scope::Global => LayerScope::Global,
        cli::Scope::Prefix => LayerScope::Prefix,
        cli::Scope::PrefixProject => LayerScope::PrefixProject,
        cli::Scope::Infra => LayerScope::Infra,
        cli::Scope::InfraPrefix => LayerScope::InfraPrefix,
        cli::Scope::InfraProject => LayerScope::InfraProject,
    };
    let kind = match cli.kind {
        cli::Kind::Params => LayerKind::Params,
        cli::Kind::Tags => LayerKind::Tags,
    };

    let layer = settings::save_layer(&config.settings_dir, &id, scope, kind, &entries)?;
    println!("{}", config.settings_dir.join(layer.name()).display());
    Ok(())
}

fn report(synthesis: &Synthesis) {
    for diagnostic in &synthesis.diagnostics {
        eprintln!("warning: {diagnostic}");
    }
    println!("{}", synthesis.path.display());
}

/// Reads answers from stdin
///
/// Empty input accepts the offered value, `?` shows help, `-` clears, `^` aborts.
struct AskParameter;

fn read_line() -> Option<String> {
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
    }
}

impl ParameterPrompt for AskParameter {
    fn ask(&mut self, spec: &ParameterSpec, current: &str) -> Decision {
        let shown = if spec.no_echo && !current.is_empty() {
            drift::MASKED
        } else {
            current
        };
        eprint!("{} [{shown}]: ", spec.name);
        let _ = std::io::stderr().flush();

        match read_line().as_deref() {
            None | Some("^") => Decision::Abort,
            Some("") => Decision::Accept(current.to_string()),
            Some("?") => Decision::Help,
            Some("-") => Decision::Clear,
            Some(value) => Decision::Accept(value.to_string()),
        }
    }

    fn help(&mut self, spec: &ParameterSpec) {
        eprintln!("  type: {}", spec.param_type);
        if let Some(description) = &spec.description {
            eprintln!("  {description}");
        }
        if let Some(allowed) = &spec.allowed_values {
            eprintln!("  allowed: {}", allowed.join(", "));
        }
        if let Some(pattern) = &spec.allowed_pattern {
            eprintln!("  pattern: {pattern}");
        }
        eprintln!("  enter ? for help, - to clear, ^ to abort");
    }

    fn rejected(&mut self, spec: &ParameterSpec, value: &str, violation: &ConstraintViolation) {
        eprintln!("  invalid value {value:?}: {violation}");
        if let Some(description) = &spec.constraint_description {
            eprintln!("  {description}");
        }
    }
}

struct AskDrift;

impl ResolveDrift for AskDrift {
    fn resolve(&mut self, environment: &EnvironmentKey, entries: &[DriftEntry]) -> Resolution {
        eprintln!("configuration of {environment} differs from the deployed stack:");
        for entry in entries {
            eprintln!("  {entry}");
        }

        loop {
            eprint!("use [l]ocal, use [d]eployed or [a]bort: ");
            let _ = std::io::stderr().flush();
            match read_line().as_deref().map(str::trim) {
                Some("l") => return Resolution::UseLocal,
                Some("d") => return Resolution::UseDeployed,
                Some("a") | None => return Resolution::Abort,
                Some(_) => continue,
            }
        }
    }
}
