//! Drift between a local configuration document and the deployed stack
//!
//! The reconciler never picks a winner on its own. When values differ it hands the [DriftEntry]s to a
//! [ResolveDrift] implementation and applies the answer to the whole environment: keep every local value,
//! adopt every deployed value, or abort. There is no per-key resolution.
use crate::cascade::ReservedKeys;
use crate::document::{ConfigurationDocument, EnvironmentSection, Pairs};
use crate::identifier::EnvironmentKey;
use crate::snapshot::StackSnapshot;

/// Value the remote service returns in place of `NoEcho` parameters
pub const MASKED: &str = "****";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriftScope {
    Parameter,
    Tag,
}

impl std::fmt::Display for DriftScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DriftScope::Parameter => "parameter",
            DriftScope::Tag => "tag",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftEntry {
    pub key: String,
    pub scope: DriftScope,
    pub local: Option<String>,
    pub deployed: Option<String>,
}

impl std::fmt::Display for DriftEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let show = |value: &Option<String>| match value {
            Some(value) => format!("{value:?}"),
            None => "<unset>".to_string(),
        };
        write!(
            f,
            "{} {}: local {} / deployed {}",
            self.scope,
            self.key,
            show(&self.local),
            show(&self.deployed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    UseLocal,
    UseDeployed,
    Abort,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriftReport {
    pub entries: Vec<DriftEntry>,
    /// `None` when there was nothing to resolve
    pub resolution: Option<Resolution>,
}

impl DriftReport {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Decides what to do about drift
///
/// A fixed [Resolution] is a non-interactive policy.
pub trait ResolveDrift {
    fn resolve(&mut self, environment: &EnvironmentKey, entries: &[DriftEntry]) -> Resolution;
}

impl ResolveDrift for Resolution {
    fn resolve(&mut self, _environment: &EnvironmentKey, _entries: &[DriftEntry]) -> Resolution {
        *self
    }
}

/// No policy given: drift aborts the run
impl ResolveDrift for Option<Resolution> {
    fn resolve(&mut self, _environment: &EnvironmentKey, _entries: &[DriftEntry]) -> Resolution {
        self.unwrap_or(Resolution::Abort)
    }
}

#[derive(thiserror::Error, Debug)]
#[error("aborted on drift in {environment} ({} keys differ)", .report.entries.len())]
pub struct DriftAborted {
    pub environment: EnvironmentKey,
    pub report: DriftReport,
}

/// Compare one environment of the local document against the deployed stack
///
/// Without both sides there is no drift: the present side is taken as is. `fresh` is the document used when
/// no local document exists; deployed values are adopted into its `environment` section.
#[tracing::instrument(level = "debug", skip_all, fields(%environment))]
pub fn reconcile(
    environment: &EnvironmentKey,
    local: Option<ConfigurationDocument>,
    remote: Option<&StackSnapshot>,
    fresh: ConfigurationDocument,
    reserved: &ReservedKeys,
    decider: &mut dyn ResolveDrift,
) -> Result<(ConfigurationDocument, DriftReport), DriftAborted> {
    let (local, remote) = match (local, remote) {
        (None, None) => return Ok((fresh, DriftReport::default())),
        (Some(local), None) => return Ok((local, DriftReport::default())),
        (None, Some(remote)) => {
            tracing::info!("no local document, adopting deployed values");
            return Ok((adopt(fresh, environment, remote, reserved), DriftReport::default()));
        }
        (Some(local), Some(remote)) => (local, remote),
    };

    let Some(section) = local.environment(environment) else {
        tracing::info!("environment not in local document, adopting deployed values");
        return Ok((adopt(local, environment, remote, reserved), DriftReport::default()));
    };

    let mut entries = compare(
        DriftScope::Parameter,
        &section.parameter_overrides,
        &remote.parameters,
        &ReservedKeys::default(),
    );
    entries.extend(compare(DriftScope::Tag, &section.tags, &remote.tags, reserved));

    if entries.is_empty() {
        return Ok((local, DriftReport::default()));
    }

    for entry in &entries {
        tracing::warn!(%entry, "drift");
    }

    let resolution = decider.resolve(environment, &entries);
    let report = DriftReport {
        entries,
        resolution: Some(resolution),
    };

    match resolution {
        Resolution::UseLocal => Ok((local, report)),
        Resolution::UseDeployed => Ok((adopt(local, environment, remote, reserved), report)),
        Resolution::Abort => Err(DriftAborted {
            environment: environment.clone(),
            report,
        }),
    }
}

fn compare(scope: DriftScope, local: &Pairs, deployed: &Pairs, reserved: &ReservedKeys) -> Vec<DriftEntry> {
    let keys = local
        .keys()
        .chain(deployed.keys().filter(|key| !local.contains_key(*key)))
        .filter(|key| !reserved.contains(key));

    keys.filter_map(|key| {
        let l = local.get(key);
        let d = deployed.get(key);
        if l == d || d.map(String::as_str) == Some(MASKED) {
            return None;
        }
        Some(DriftEntry {
            key: key.clone(),
            scope,
            local: l.cloned(),
            deployed: d.cloned(),
        })
    })
    .collect()
}

/// Replace parameters and user tags of one environment with the deployed values
///
/// Masked (NoEcho) parameters keep their local value.
fn adopt(
    mut document: ConfigurationDocument,
    environment: &EnvironmentKey,
    remote: &StackSnapshot,
    reserved: &ReservedKeys,
) -> ConfigurationDocument {
    let mut section = document
        .environment(environment)
        .cloned()
        .unwrap_or_else(|| EnvironmentSection::new(remote.stack_name.clone(), remote.stack_name.clone()));

    // masked values are unknown, the local value (if any) stays
    section.parameter_overrides = remote
        .parameters
        .iter()
        .filter_map(|(key, value)| match value.as_str() {
            MASKED => section
                .parameter_overrides
                .get(key)
                .map(|local| (key.clone(), local.clone())),
            _ => Some((key.clone(), value.clone())),
        })
        .collect();
    section.tags = remote
        .tags
        .iter()
        .filter(|(key, _)| !reserved.contains(key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    document.upsert_environment(environment.clone(), section);
    document
}
