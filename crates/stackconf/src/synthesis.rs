//! Synthesis of one environment section
//!
//! A run handles exactly one identifier:
//!
//! 1. load the existing document (if any) and the deployed stack (if any)
//! 2. reconcile drift between the two
//! 3. load the template and extract its parameter contract
//! 4. resolve parameter and tag defaults: seed from step 2, then the override layers
//! 5. fill identity parameters, ask for every other declared parameter
//! 6. append the automatic tags, check the document against the contract
//! 7. replace the file on disk in one step
//!
//! Any failure before step 7 leaves the file untouched.
use crate::cascade::{self, Diagnostic, LayerKind, OverrideLayer, ReservedKeys};
use crate::config::EngineConfig;
use crate::contract::{self, TemplateContract, TemplateFetcher, TemplateSource};
use crate::dialect::{self, Provenance};
use crate::document::{keys, ConfigurationDocument, EnvironmentSection, Pairs};
use crate::drift::{self, DriftReport, ResolveDrift};
use crate::identifier::{EnvironmentKey, Identifier, InfraType, StageClass, ValidationErrors};
use crate::prompt::{self, ParameterPrompt};
use crate::settings;
use crate::snapshot::{SessionContext, SnapshotReader, StackQuery, StackSnapshot};
use crate::util;
use crate::value::Value;
use crate::Error;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};

/// Parameters filled from the identifier, never asked for
pub mod identity {
    pub const PREFIX: &str = "Prefix";
    pub const PREFIX_UPPER: &str = "PrefixUpper";
    pub const PROJECT_ID: &str = "ProjectId";
    pub const STAGE_ID: &str = "StageId";
}

/// Parameters defaulted from the stage class; existing values and every layer win over them
pub mod stage {
    pub const DEPLOY_ENVIRONMENT: &str = crate::tags::DEPLOY_ENVIRONMENT_PARAMETER;
    pub const CODE_COMMIT_BRANCH: &str = "CodeCommitBranch";
}

#[derive(Debug, Clone, derive_new::new)]
pub struct SynthesisRequest {
    pub identifier: Identifier,
    /// Falls back to the template recorded in the document or on the deployed stack
    #[new(default)]
    pub template: Option<TemplateSource>,
    /// Written into the global section, replacing existing values
    #[new(default)]
    pub global: IndexMap<String, Value>,
    #[new(default)]
    pub role_arn: Option<String>,
    /// Recorded in the provenance header
    #[new(default)]
    pub arguments: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Synthesis {
    pub path: PathBuf,
    pub document: ConfigurationDocument,
    pub drift: DriftReport,
    pub diagnostics: Vec<Diagnostic>,
}

pub struct Synthesizer<'a> {
    config: &'a EngineConfig,
    /// Directories of the config are relative to this
    root: PathBuf,
    session: SessionContext,
    query: Option<&'a dyn StackQuery>,
    fetcher: Option<&'a dyn TemplateFetcher>,
}

impl<'a> Synthesizer<'a> {
    pub fn new(config: &'a EngineConfig, root: impl Into<PathBuf>) -> Self {
        Self {
            config,
            root: root.into(),
            session: SessionContext::default(),
            query: None,
            fetcher: None,
        }
    }

    pub fn with_session(mut self, session: SessionContext) -> Self {
        self.session = session;
        self
    }

    /// Without a stack query the deployed state is treated as unknown
    pub fn with_stack_query(mut self, query: &'a dyn StackQuery) -> Self {
        self.query = Some(query);
        self
    }

    pub fn with_template_fetcher(mut self, fetcher: &'a dyn TemplateFetcher) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    #[tracing::instrument(level = "info", skip_all, fields(stack = %request.identifier.stack_name()))]
    pub fn synthesize(
        &self,
        request: &SynthesisRequest,
        drift: &mut dyn ResolveDrift,
        prompt: &mut dyn ParameterPrompt,
    ) -> Result<Synthesis, Error> {
        let id = &request.identifier;
        let env = id.environment();
        let tag_names = self.config.tag_names();
        let reserved = tag_names.reserved();
        let (path, config_file) = self.document_file(id);

        let existing = self.load_document(&path)?;
        let requested = request.template.as_ref().map(ToString::to_string);
        let snapshot = self.fetch_snapshot(id, requested.as_deref())?;

        let source = self.template_source(request, existing.as_ref(), snapshot.as_ref())?;
        let text = contract::load_template(
            &source,
            &self.root.join(self.config.template_dir(id.infra_type())),
            self.fetcher,
        )?;
        let contract = contract::extract(&source.to_string(), &text)?;
        let template_version = contract::fingerprint(&text);
        tracing::debug!(parameters = contract.len(), %template_version, "template contract");

        let (mut document, drift) = drift::reconcile(
            &env,
            existing,
            snapshot.as_ref(),
            fresh_document(id),
            &reserved,
            drift,
        )?;

        let current = document
            .environment(&env)
            .cloned()
            .unwrap_or_else(|| EnvironmentSection::new(id.stack_name(), id.artifact_prefix()));

        let settings_dir = self.root.join(&self.config.settings_dir);
        let params = {
            let mut seed: Pairs = stage_defaults(id)
                .into_iter()
                .filter(|(key, _)| contract.get(key).is_some())
                .collect();
            seed.extend(current.parameter_overrides.clone());
            let mut layers: Vec<OverrideLayer> =
                OverrideLayer::seed("seed", seed).into_iter().collect();
            layers.extend(settings::load_layers(&settings_dir, id, LayerKind::Params)?);
            cascade::resolve(&layers, &ReservedKeys::default())
        };
        let tags = {
            let seed = current
                .tags
                .iter()
                .filter(|(key, _)| !reserved.contains(key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            let mut layers: Vec<OverrideLayer> =
                OverrideLayer::seed("seed", seed).into_iter().collect();
            layers.extend(settings::load_layers(&settings_dir, id, LayerKind::Tags)?);
            cascade::resolve(&layers, &reserved)
        };

        let identity = identity_parameters(id);
        let mut parameter_overrides = Pairs::new();
        for spec in contract.iter() {
            if let Some(value) = identity.get(&spec.name) {
                parameter_overrides.insert(spec.name.clone(), value.clone());
                continue;
            }

            let offered = params
                .values
                .get(&spec.name)
                .or(spec.default.as_ref())
                .map(String::as_str)
                .unwrap_or_default();
            let value = prompt::collect(prompt, spec, offered)?;
            parameter_overrides.insert(spec.name.clone(), value);
        }
        for key in params.values.keys().filter(|key| contract.get(key).is_none()) {
            tracing::debug!(%key, "not declared by the template, dropped");
        }

        let mut section_tags = tags.values;
        section_tags.extend(tag_names.automatic(
            id,
            &source.to_string(),
            &template_version,
            &parameter_overrides,
        ));

        document.upsert_environment(
            env.clone(),
            EnvironmentSection {
                stack_name: id.stack_name(),
                s3_prefix: id.artifact_prefix(),
                parameter_overrides,
                tags: section_tags,
                role_arn: request.role_arn.clone().or(current.role_arn),
            },
        );
        self.apply_global(&mut document, id, &source, &request.global);
        prune_undeclared(&mut document, &env, &contract);
        document.check_contract(&contract)?;

        let provenance = Provenance::new(
            self.config.generator.clone(),
            request.arguments.clone(),
            config_file,
        );
        write_document(&path, &dialect::serialize(&document, &provenance))?;
        tracing::info!(path=%path.display(), "configuration written");

        let mut diagnostics = params.diagnostics;
        diagnostics.extend(tags.diagnostics);

        Ok(Synthesis {
            path,
            document,
            drift,
            diagnostics,
        })
    }

    /// Adopt a deployed stack as is
    ///
    /// The template contract is not consulted: every deployed parameter and tag is kept.
    #[tracing::instrument(level = "info", skip_all, fields(stack = %identifier.stack_name()))]
    pub fn import_snapshot(
        &self,
        identifier: &Identifier,
        arguments: Vec<String>,
    ) -> Result<Synthesis, Error> {
        if self.query.is_none() {
            return Err(Error::NoStackQuery);
        }

        let env = identifier.environment();
        let (path, config_file) = self.document_file(identifier);
        let snapshot = self
            .fetch_snapshot(identifier, None)?
            .ok_or_else(|| Error::StackNotFound(identifier.stack_name()))?;

        let mut document = self.load_document(&path)?.unwrap_or_default();
        let role_arn = document
            .environment(&env)
            .and_then(|section| section.role_arn.clone());

        let parameter_overrides = snapshot
            .parameters
            .iter()
            .filter(|(key, value)| {
                let masked = value.as_str() == drift::MASKED;
                if masked {
                    tracing::warn!(%key, "masked parameter not imported");
                }
                !masked
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        document.upsert_environment(
            env,
            EnvironmentSection {
                stack_name: snapshot.stack_name.clone(),
                s3_prefix: identifier.artifact_prefix(),
                parameter_overrides,
                tags: snapshot.tags.clone(),
                role_arn,
            },
        );

        let template_file = snapshot
            .template_ref
            .as_deref()
            .map(TemplateSource::parse)
            .transpose()
            .map_err(ValidationErrors::from)?
            .map(|source| self.template_file(identifier, &source));

        let global = &mut document.global;
        if let Some(template_file) = template_file {
            global
                .entry(keys::TEMPLATE_FILE.into())
                .or_insert_with(|| template_file.into());
        }
        if let Some(region) = &snapshot.region {
            global
                .entry(keys::REGION.into())
                .or_insert_with(|| region.as_str().into());
        }
        if !snapshot.capabilities.is_empty() {
            global.insert(
                keys::CAPABILITIES.into(),
                Value::Array(snapshot.capabilities.iter().map(|c| c.as_str().into()).collect()),
            );
        }
        global
            .entry(keys::CONFIRM_CHANGESET.into())
            .or_insert(Value::Boolean(true));

        let provenance = Provenance::new(self.config.generator.clone(), arguments, config_file);
        write_document(&path, &dialect::serialize(&document, &provenance))?;
        tracing::info!(path=%path.display(), "stack imported");

        Ok(Synthesis {
            path,
            document,
            drift: DriftReport::default(),
            diagnostics: Vec::new(),
        })
    }

    /// Absolute path, and the path as the deploy tool is given it
    fn document_file(&self, id: &Identifier) -> (PathBuf, String) {
        let relative = id.document_path(&self.config.samconfig_dir);
        (self.root.join(&relative), slash_path(&relative))
    }

    fn load_document(&self, path: &Path) -> Result<Option<ConfigurationDocument>, Error> {
        if !path.is_file() {
            tracing::info!(path=%path.display(), "no existing configuration");
            return Ok(None);
        }

        let text = std::fs::read_to_string(path).map_err(|source| Error::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Some(dialect::parse(&text, &path.display().to_string())?))
    }

    fn fetch_snapshot(
        &self,
        id: &Identifier,
        fallback_template: Option<&str>,
    ) -> Result<Option<StackSnapshot>, Error> {
        let Some(query) = self.query else {
            tracing::debug!("no stack query, deployed state unknown");
            return Ok(None);
        };

        let reader = SnapshotReader::new(
            query,
            self.config.retry.clone(),
            self.config.tag_names().template_file(),
        );
        Ok(reader.fetch(&self.session, &id.stack_name(), fallback_template)?)
    }

    fn template_source(
        &self,
        request: &SynthesisRequest,
        existing: Option<&ConfigurationDocument>,
        snapshot: Option<&StackSnapshot>,
    ) -> Result<TemplateSource, Error> {
        if let Some(template) = &request.template {
            return Ok(template.clone());
        }

        let tag = self.config.tag_names().template_file();
        let recorded = existing
            .and_then(|doc| doc.environment(&request.identifier.environment()))
            .and_then(|section| section.tags.get(&tag))
            .or_else(|| snapshot.and_then(|snapshot| snapshot.template_ref.as_ref()))
            .ok_or_else(|| Error::NoTemplate(request.identifier.stack_name()))?;

        tracing::info!(template=%recorded, "using recorded template");
        TemplateSource::parse(recorded)
            .map_err(ValidationErrors::from)
            .map_err(Error::from)
    }

    /// `template_file` as the deploy tool resolves it from the working directory
    fn template_file(&self, id: &Identifier, source: &TemplateSource) -> String {
        match source {
            TemplateSource::Local(file) => {
                slash_path(&self.config.template_dir(id.infra_type()).join(file))
            }
            TemplateSource::S3 { .. } => source.to_string(),
        }
    }

    fn apply_global(
        &self,
        document: &mut ConfigurationDocument,
        id: &Identifier,
        source: &TemplateSource,
        overrides: &IndexMap<String, Value>,
    ) {
        let template_file = self.template_file(id, source);
        let capabilities = match id.infra_type() {
            InfraType::ServiceRole => "CAPABILITY_IAM",
            _ => "CAPABILITY_NAMED_IAM",
        };

        let global = &mut document.global;
        global.insert(keys::TEMPLATE_FILE.into(), template_file.into());
        global
            .entry(keys::CAPABILITIES.into())
            .or_insert_with(|| capabilities.into());
        global
            .entry(keys::CONFIRM_CHANGESET.into())
            .or_insert(Value::Boolean(true));
        for (key, value) in overrides {
            global.insert(key.clone(), value.clone());
        }
    }
}

fn fresh_document(id: &Identifier) -> ConfigurationDocument {
    let mut document = ConfigurationDocument::default();
    document.upsert_environment(
        id.environment(),
        EnvironmentSection::new(id.stack_name(), id.artifact_prefix()),
    );
    document
}

/// Identity parameter values for an identifier
pub fn identity_parameters(id: &Identifier) -> Pairs {
    let mut values = Pairs::new();
    values.insert(identity::PREFIX.into(), id.prefix().to_string());
    values.insert(identity::PREFIX_UPPER.into(), id.prefix().to_uppercase());
    if let Some(project_id) = id.project_id() {
        values.insert(identity::PROJECT_ID.into(), project_id.to_string());
    }
    if let Some(stage_id) = id.stage_id() {
        values.insert(identity::STAGE_ID.into(), stage_id.to_string());
    }
    values
}

/// Defaults derived from the stage id
///
/// `DeployEnvironment` is `TEST` for test stages and `PROD` for beta, stage and prod stages.
/// `CodeCommitBranch` is `main` for prod stages and the stage id otherwise.
pub fn stage_defaults(id: &Identifier) -> Pairs {
    let mut values = Pairs::new();
    let Some(stage_id) = id.stage_id() else {
        return values;
    };
    let Some(class) = StageClass::of(stage_id) else {
        return values;
    };

    let environment = match class {
        StageClass::Test => "TEST",
        StageClass::Beta | StageClass::Stage | StageClass::Prod => "PROD",
    };
    let branch = match class {
        StageClass::Prod => "main",
        _ => stage_id,
    };
    values.insert(stage::DEPLOY_ENVIRONMENT.into(), environment.into());
    values.insert(stage::CODE_COMMIT_BRANCH.into(), branch.into());
    values
}

/// Environments share one template; keys it no longer declares are dropped from the other environments
fn prune_undeclared(
    document: &mut ConfigurationDocument,
    synthesized: &EnvironmentKey,
    contract: &TemplateContract,
) {
    for (env, section) in document.environments.iter_mut() {
        if env == synthesized {
            continue;
        }
        section.parameter_overrides.retain(|key, _| {
            let declared = contract.get(key).is_some();
            if !declared {
                tracing::warn!(%env, %key, "parameter no longer declared by the template, dropped");
            }
            declared
        });
    }
}

fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn write_document(path: &Path, contents: &str) -> Result<(), Error> {
    util::write_atomically(path, contents).map_err(|source| Error::Write {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn identity_values() {
        let id = Identifier::new(
            InfraType::Pipeline,
            "acme",
            Some("widget".into()),
            Some("test".into()),
        )
        .unwrap();
        let values: Vec<_> = identity_parameters(&id)
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        assert_eq!(
            values,
            ["Prefix=acme", "PrefixUpper=ACME", "ProjectId=widget", "StageId=test"]
        );

        let role = Identifier::new(InfraType::ServiceRole, "acme", None, None).unwrap();
        assert_eq!(identity_parameters(&role).len(), 2);
    }

    #[test]
    fn stage_defaults_follow_the_stage_class() {
        let defaults = |infra_type: InfraType, stage: Option<&str>| {
            let project = infra_type != InfraType::ServiceRole;
            let id = Identifier::new(
                infra_type,
                "acme",
                project.then(|| "widget".to_string()),
                stage.map(String::from),
            )
            .unwrap();
            stage_defaults(&id)
                .into_iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
        };

        assert_eq!(
            defaults(InfraType::Pipeline, Some("test")),
            ["DeployEnvironment=TEST", "CodeCommitBranch=test"]
        );
        assert_eq!(
            defaults(InfraType::Pipeline, Some("beta2")),
            ["DeployEnvironment=PROD", "CodeCommitBranch=beta2"]
        );
        assert_eq!(
            defaults(InfraType::Network, Some("prod")),
            ["DeployEnvironment=PROD", "CodeCommitBranch=main"]
        );
        assert!(defaults(InfraType::Storage, None).is_empty());
    }

    #[test]
    fn other_environments_lose_undeclared_keys() {
        let contract: TemplateContract = [contract::ParameterSpec::new("Prefix", "String")]
            .into_iter()
            .collect();

        let mut doc = ConfigurationDocument::default();
        for stage in ["test", "prod"] {
            let mut section = EnvironmentSection::new(stage.into(), stage.into());
            section.parameter_overrides.insert("Prefix".into(), "acme".into());
            section.parameter_overrides.insert("Legacy".into(), "x".into());
            doc.upsert_environment(EnvironmentKey::Stage(stage.into()), section);
        }

        let test = EnvironmentKey::Stage("test".into());
        prune_undeclared(&mut doc, &test, &contract);

        assert_eq!(doc.environment(&test).unwrap().parameter_overrides.len(), 2);
        assert_eq!(
            doc.environment(&EnvironmentKey::Stage("prod".into()))
                .unwrap()
                .parameter_overrides
                .len(),
            1
        );
    }
}
