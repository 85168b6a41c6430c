//! Naming and validation of stack identifiers
//!
//! An [Identifier] is the tuple `(Prefix, ProjectId, StageId, InfraType)` every other component keys off.
//! Derived names are pure functions of the identifier:
//!
//! | infra type     | stack name                           | document file name                       |
//! |----------------|--------------------------------------|------------------------------------------|
//! | `service-role` | `acme-service-role`                  | `samconfig-acme-service-role.toml`       |
//! | `storage`      | `acme-widget-storage`                | `samconfig-acme-widget-storage.toml`     |
//! | `pipeline`     | `acme-widget-test-pipeline`          | `samconfig-acme-widget-pipeline.toml`    |
//! | `network`      | `acme-widget-prod-network`           | `samconfig-acme-widget-network.toml`     |
//!
//! Validation never truncates or corrects a value. Every violated rule is collected so the caller can
//! report all of them at once.
use std::path::{Path, PathBuf};

pub const PREFIX_MIN_LEN: usize = 2;
pub const PREFIX_MAX_LEN: usize = 8;
pub const PREFIX_PROJECT_MAX_LEN: usize = 28;
pub const STAGE_MAX_LEN: usize = 6;

/// Category of stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InfraType {
    ServiceRole,
    Pipeline,
    Storage,
    Network,
}

impl InfraType {
    pub const ALL: [InfraType; 4] = [
        InfraType::ServiceRole,
        InfraType::Pipeline,
        InfraType::Storage,
        InfraType::Network,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InfraType::ServiceRole => "service-role",
            InfraType::Pipeline => "pipeline",
            InfraType::Storage => "storage",
            InfraType::Network => "network",
        }
    }

    /// Whether stacks of this type are deployed once per stage
    pub fn is_staged(&self) -> bool {
        matches!(self, InfraType::Pipeline | InfraType::Network)
    }

    /// Whether stacks of this type are scoped to a project
    pub fn has_project(&self) -> bool {
        !matches!(self, InfraType::ServiceRole)
    }
}

impl std::fmt::Display for InfraType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InfraType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InfraType::ALL
            .into_iter()
            .find(|infra_type| infra_type.as_str() == s)
            .ok_or_else(|| ValidationError::new("infra_type", Rule::UnknownInfraType, s))
    }
}

/// Stage class, derived from the leading token of a stage id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StageClass {
    Test,
    Beta,
    Stage,
    Prod,
}

impl StageClass {
    /// Classify a stage id by its full class token (`test`, `beta`, ...) or its first letter
    pub fn of(stage_id: &str) -> Option<Self> {
        match stage_id.chars().next()? {
            't' => Some(StageClass::Test),
            'b' => Some(StageClass::Beta),
            's' => Some(StageClass::Stage),
            'p' => Some(StageClass::Prod),
            _ => None,
        }
    }
}

/// Key of an environment section in a configuration document
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EnvironmentKey {
    /// The single section of stage-less infra types
    Default,
    Stage(String),
}

impl EnvironmentKey {
    pub const DEFAULT: &'static str = "default";

    pub fn parse(key: &str) -> Result<Self, ValidationError> {
        if key == Self::DEFAULT {
            return Ok(EnvironmentKey::Default);
        }

        validate_stage_id(key)?;
        Ok(EnvironmentKey::Stage(key.to_string()))
    }

    pub fn as_str(&self) -> &str {
        match self {
            EnvironmentKey::Default => Self::DEFAULT,
            EnvironmentKey::Stage(stage) => stage,
        }
    }

    pub fn stage_class(&self) -> Option<StageClass> {
        match self {
            EnvironmentKey::Default => None,
            EnvironmentKey::Stage(stage) => StageClass::of(stage),
        }
    }

    /// Canonical section order: `default`, then test, beta, stage, prod classes, then by name
    pub fn sort_key(&self) -> (Option<StageClass>, &str) {
        (self.stage_class(), self.as_str())
    }
}

impl std::fmt::Display for EnvironmentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated `(Prefix, ProjectId, StageId, InfraType)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identifier {
    prefix: String,
    project_id: Option<String>,
    stage_id: Option<String>,
    infra_type: InfraType,
}

impl Identifier {
    pub fn new(
        infra_type: InfraType,
        prefix: impl Into<String>,
        project_id: Option<String>,
        stage_id: Option<String>,
    ) -> Result<Self, ValidationErrors> {
        let prefix = prefix.into();
        let mut e = ValidationErrors::default();

        if let Err(err) = validate_prefix(&prefix) {
            e.log(err);
        }

        match (&project_id, infra_type.has_project()) {
            (None, true) => e.log(ValidationError::new("project_id", Rule::Required, "")),
            (Some(project_id), false) => {
                e.log(ValidationError::new("project_id", Rule::NotAllowed, project_id))
            }
            (Some(project_id), true) => {
                if let Err(err) = validate_project_id(project_id) {
                    e.log(err);
                }
                let combined = prefix.len() + project_id.len();
                if combined > PREFIX_PROJECT_MAX_LEN {
                    e.log(ValidationError::new(
                        "project_id",
                        Rule::CombinedLength {
                            max: PREFIX_PROJECT_MAX_LEN,
                        },
                        format!("{prefix}{project_id}"),
                    ));
                }
            }
            (None, false) => {}
        }

        match (&stage_id, infra_type.is_staged()) {
            (None, true) => e.log(ValidationError::new("stage_id", Rule::Required, "")),
            (Some(stage_id), false) => {
                e.log(ValidationError::new("stage_id", Rule::NotAllowed, stage_id))
            }
            (Some(stage_id), true) => {
                if let Err(err) = validate_stage_id(stage_id) {
                    e.log(err);
                }
            }
            (None, false) => {}
        }

        e.into_result()?;

        Ok(Self {
            prefix,
            project_id,
            stage_id,
            infra_type,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }

    pub fn stage_id(&self) -> Option<&str> {
        self.stage_id.as_deref()
    }

    pub fn infra_type(&self) -> InfraType {
        self.infra_type
    }

    pub fn environment(&self) -> EnvironmentKey {
        match &self.stage_id {
            Some(stage) => EnvironmentKey::Stage(stage.clone()),
            None => EnvironmentKey::Default,
        }
    }

    /// `<prefix>[-<project>]`
    pub fn application(&self) -> String {
        match &self.project_id {
            Some(project_id) => format!("{}-{}", self.prefix, project_id),
            None => self.prefix.clone(),
        }
    }

    /// `<prefix>[-<project>][-<stage>]-<infra type>`
    pub fn stack_name(&self) -> String {
        let mut parts = vec![self.prefix.as_str()];
        parts.extend(self.project_id.as_deref());
        parts.extend(self.stage_id.as_deref());
        parts.push(self.infra_type.as_str());
        parts.join("-")
    }

    /// Artifact key prefix inside the deploy bucket
    pub fn artifact_prefix(&self) -> String {
        self.stack_name()
    }

    /// One document per (prefix, project, infra type); stages share it
    pub fn file_name(&self) -> String {
        format!("samconfig-{}-{}.toml", self.application(), self.infra_type)
    }

    /// Location of the document below the configuration root
    pub fn document_path(&self, samconfig_dir: &Path) -> PathBuf {
        let mut path = samconfig_dir.join(&self.prefix);
        if let Some(project_id) = &self.project_id {
            path.push(project_id);
        }
        path.push(self.file_name());
        path
    }
}

fn check_characters(field: &'static str, value: &str) -> Result<(), ValidationError> {
    let valid = value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid {
        return Err(ValidationError::new(field, Rule::Characters, value));
    }
    Ok(())
}

fn check_length(
    field: &'static str,
    value: &str,
    min: usize,
    max: usize,
) -> Result<(), ValidationError> {
    if value.len() < min || value.len() > max {
        return Err(ValidationError::new(field, Rule::Length { min, max }, value));
    }
    Ok(())
}

pub fn validate_prefix(prefix: &str) -> Result<(), ValidationError> {
    check_characters("prefix", prefix)?;
    check_length("prefix", prefix, PREFIX_MIN_LEN, PREFIX_MAX_LEN)
}

pub fn validate_project_id(project_id: &str) -> Result<(), ValidationError> {
    check_characters("project_id", project_id)?;
    check_length(
        "project_id",
        project_id,
        1,
        PREFIX_PROJECT_MAX_LEN - PREFIX_MIN_LEN,
    )
}

pub fn validate_stage_id(stage_id: &str) -> Result<(), ValidationError> {
    check_characters("stage_id", stage_id)?;
    check_length("stage_id", stage_id, 1, STAGE_MAX_LEN)?;
    if StageClass::of(stage_id).is_none() {
        return Err(ValidationError::new("stage_id", Rule::StageClass, stage_id));
    }
    Ok(())
}

/// Rule a value violated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    Required,
    NotAllowed,
    Characters,
    Length { min: usize, max: usize },
    CombinedLength { max: usize },
    StageClass,
    UnknownInfraType,
    MalformedLocator,
    UnknownParameter,
}

impl std::fmt::Display for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rule::Required => f.write_str("is required"),
            Rule::NotAllowed => f.write_str("is not allowed for this infra type"),
            Rule::Characters => f.write_str("may only contain a-z, 0-9 and -"),
            Rule::Length { min, max } => write!(f, "must be {min} to {max} characters"),
            Rule::CombinedLength { max } => {
                write!(f, "prefix and project id together must not exceed {max} characters")
            }
            Rule::StageClass => f.write_str("must start with t(est), b(eta), s(tage) or p(rod)"),
            Rule::UnknownInfraType => {
                f.write_str("must be one of service-role, pipeline, storage, network")
            }
            Rule::MalformedLocator => f.write_str("must be a file name or s3://bucket/key"),
            Rule::UnknownParameter => f.write_str("is not declared by the template"),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{field} {rule} (got {value:?})")]
pub struct ValidationError {
    pub field: String,
    pub rule: Rule,
    pub value: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, rule: Rule, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            rule,
            value: value.into(),
        }
    }
}

/// All rule violations found while validating one input
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ValidationErrors {
    issues: Vec<ValidationError>,
}

impl ValidationErrors {
    pub fn log(&mut self, issue: ValidationError) {
        tracing::trace!(?issue, "validation issue found");
        self.issues.push(issue);
    }

    pub fn issues(&self) -> &[ValidationError] {
        &self.issues
    }

    pub fn into_result(self) -> Result<(), Self> {
        if self.issues.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl From<ValidationError> for ValidationErrors {
    fn from(value: ValidationError) -> Self {
        Self {
            issues: vec![value],
        }
    }
}

impl std::error::Error for ValidationErrors {}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.issues.as_slice() {
            [] => f.write_str("validation failed"),
            [only] => only.fmt(f),
            [first, rest @ ..] => write!(f, "{first} (and {} more)", rest.len()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pipeline(prefix: &str, project: &str, stage: &str) -> Result<Identifier, ValidationErrors> {
        Identifier::new(
            InfraType::Pipeline,
            prefix,
            Some(project.to_string()),
            Some(stage.to_string()),
        )
    }

    #[test]
    fn derived_names() {
        let id = pipeline("acme", "widget", "test").unwrap();
        assert_eq!(id.stack_name(), "acme-widget-test-pipeline");
        assert_eq!(id.artifact_prefix(), "acme-widget-test-pipeline");
        assert_eq!(id.file_name(), "samconfig-acme-widget-pipeline.toml");
        assert_eq!(
            id.document_path(Path::new("samconfig")),
            PathBuf::from("samconfig/acme/widget/samconfig-acme-widget-pipeline.toml")
        );
        assert_eq!(id.environment(), EnvironmentKey::Stage("test".into()));
    }

    #[test]
    fn service_role_has_neither_project_nor_stage() {
        let id = Identifier::new(InfraType::ServiceRole, "acme", None, None).unwrap();
        assert_eq!(id.stack_name(), "acme-service-role");
        assert_eq!(id.file_name(), "samconfig-acme-service-role.toml");
        assert_eq!(id.environment(), EnvironmentKey::Default);

        let errors =
            Identifier::new(InfraType::ServiceRole, "acme", None, Some("test".into())).unwrap_err();
        assert_eq!(errors.issues()[0].rule, Rule::NotAllowed);
    }

    #[test]
    fn combined_length_rule() {
        let errors = pipeline("acmecorpteam", "abcdefghijklmnopqrst", "test").unwrap_err();
        assert!(errors.issues().iter().any(|issue| issue.field == "project_id"
            && issue.rule == Rule::CombinedLength { max: 28 }));
    }

    #[test]
    fn prefix_rules() {
        let errors = pipeline("Acme", "widget", "test").unwrap_err();
        assert_eq!(errors.issues()[0].rule, Rule::Characters);

        let errors = pipeline("a", "widget", "test").unwrap_err();
        assert_eq!(errors.issues()[0].rule, Rule::Length { min: 2, max: 8 });
    }

    #[test]
    fn stage_rules() {
        assert!(pipeline("acme", "widget", "t95").is_ok());
        assert!(pipeline("acme", "widget", "prod").is_ok());

        let errors = pipeline("acme", "widget", "dev").unwrap_err();
        assert_eq!(errors.issues()[0].rule, Rule::StageClass);

        let errors = pipeline("acme", "widget", "testing").unwrap_err();
        assert_eq!(errors.issues()[0].rule, Rule::Length { min: 1, max: 6 });
    }

    #[test]
    fn staged_types_require_stage() {
        let errors =
            Identifier::new(InfraType::Network, "acme", Some("widget".into()), None).unwrap_err();
        assert_eq!(errors.issues()[0].field, "stage_id");
        assert_eq!(errors.issues()[0].rule, Rule::Required);
    }

    #[test]
    fn environment_ordering() {
        let mut keys = vec![
            EnvironmentKey::Stage("prod".into()),
            EnvironmentKey::Stage("beta".into()),
            EnvironmentKey::Default,
            EnvironmentKey::Stage("test".into()),
        ];
        keys.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        let names: Vec<_> = keys.iter().map(EnvironmentKey::as_str).collect();
        assert_eq!(names, ["default", "test", "beta", "prod"]);
    }

    #[test]
    fn infra_type_round_trip() {
        for infra_type in InfraType::ALL {
            assert_eq!(infra_type.as_str().parse::<InfraType>().unwrap(), infra_type);
        }
        assert!("lambda".parse::<InfraType>().is_err());
    }
}
