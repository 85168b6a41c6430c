//! Template parameter contract
//!
//! Templates carry an open-ended set of tagged expressions (`!Ref`, `!If`, `!Sub`, ...) that a strict YAML
//! reader would have to know about. None of them matter for the parameter contract, so instead of parsing
//! the whole template we cut out the top-level `Parameters` block and parse only that.
//!
//! ```yaml
//! AWSTemplateFormatVersion: "2010-09-09"   # ignored
//! Parameters:                              # <- captured from here
//!   Prefix:
//!     Type: String
//!     AllowedPattern: "[a-z][a-z0-9-]+"
//! Conditions:                              # <- up to (not including) the next top-level key
//!   IsProd: !Equals [!Ref StageId, prod]
//! ```
//!
//! JSON templates have no tags and are parsed whole.
use indexmap::IndexMap;
use serde_yaml::Value as Yaml;
use sha2::Digest;
use std::path::Path;

const PARAMETERS_KEY: &str = "Parameters";

/// A declared template parameter
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParameterSpec {
    pub name: String,
    /// Passed through literally (`String`, `Number`, `AWS::EC2::VPC::Id`, ...)
    pub param_type: String,
    pub default: Option<String>,
    pub allowed_values: Option<Vec<String>>,
    pub allowed_pattern: Option<String>,
    pub description: Option<String>,
    pub constraint_description: Option<String>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub no_echo: bool,
}

impl ParameterSpec {
    pub fn new(name: impl Into<String>, param_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_type: param_type.into(),
            ..Default::default()
        }
    }

    /// Check a candidate value against the declared constraints
    pub fn check(&self, value: &str) -> Result<(), ConstraintViolation> {
        if value.is_empty() && self.default.is_some() {
            return Ok(());
        }

        if let Some(allowed) = &self.allowed_values {
            if !allowed.iter().any(|a| a == value) {
                return Err(ConstraintViolation::NotAllowed(allowed.join(", ")));
            }
        }

        if let Some(pattern) = &self.allowed_pattern {
            let regex = regex::Regex::new(&format!("^(?:{pattern})$"))
                .map_err(|_| ConstraintViolation::InvalidPattern(pattern.clone()))?;
            if !regex.is_match(value) {
                return Err(ConstraintViolation::PatternMismatch(pattern.clone()));
            }
        }

        match self.param_type.as_str() {
            "String" | "AWS::SSM::Parameter::Value<String>" => {
                let len = value.chars().count();
                if let Some(min) = self.min_length.filter(|min| len < *min) {
                    return Err(ConstraintViolation::TooShort(min));
                }
                if let Some(max) = self.max_length.filter(|max| len > *max) {
                    return Err(ConstraintViolation::TooLong(max));
                }
            }
            "Number" | "AWS::SSM::Parameter::Value<Number>" => {
                let number: f64 = value
                    .trim()
                    .parse()
                    .map_err(|_| ConstraintViolation::NotANumber)?;
                if let Some(min) = self.min_value.filter(|min| number < *min) {
                    return Err(ConstraintViolation::BelowMinimum(min));
                }
                if let Some(max) = self.max_value.filter(|max| number > *max) {
                    return Err(ConstraintViolation::AboveMaximum(max));
                }
            }
            "CommaDelimitedList" => {
                if value.split(',').any(|item| item.trim().is_empty()) {
                    return Err(ConstraintViolation::EmptyListItem);
                }
            }
            "List<Number>" => {
                if value
                    .split(',')
                    .any(|item| item.trim().parse::<f64>().is_err())
                {
                    return Err(ConstraintViolation::NotANumber);
                }
            }
            "AWS::EC2::KeyPair::KeyName" if value.is_empty() => {
                return Err(ConstraintViolation::Empty);
            }
            "AWS::EC2::VPC::Id" => require_prefix(value, "vpc-")?,
            "AWS::EC2::Subnet::Id" => require_prefix(value, "subnet-")?,
            "AWS::EC2::SecurityGroup::Id" => require_prefix(value, "sg-")?,
            _ => {}
        }

        Ok(())
    }
}

fn require_prefix(value: &str, prefix: &'static str) -> Result<(), ConstraintViolation> {
    if value.starts_with(prefix) {
        Ok(())
    } else {
        Err(ConstraintViolation::MissingPrefix(prefix))
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConstraintViolation {
    #[error("value must be one of: {0}")]
    NotAllowed(String),
    #[error("value must match pattern: {0}")]
    PatternMismatch(String),
    #[error("template declares an invalid pattern: {0}")]
    InvalidPattern(String),
    #[error("value must be at least {0} characters")]
    TooShort(usize),
    #[error("value must be no more than {0} characters")]
    TooLong(usize),
    #[error("value must be a number")]
    NotANumber,
    #[error("value must be at least {0}")]
    BelowMinimum(f64),
    #[error("value must be no more than {0}")]
    AboveMaximum(f64),
    #[error("list must not contain empty items")]
    EmptyListItem,
    #[error("value must not be empty")]
    Empty,
    #[error("value must start with {0:?}")]
    MissingPrefix(&'static str),
}

/// Parameters declared by one template, in declaration order
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TemplateContract {
    pub template: String,
    parameters: IndexMap<String, ParameterSpec>,
}

impl TemplateContract {
    pub fn get(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParameterSpec> {
        self.parameters.values()
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }
}

impl FromIterator<ParameterSpec> for TemplateContract {
    fn from_iter<T: IntoIterator<Item = ParameterSpec>>(iter: T) -> Self {
        Self {
            template: String::new(),
            parameters: iter
                .into_iter()
                .map(|spec| (spec.name.clone(), spec))
                .collect(),
        }
    }
}

/// Extract the parameter contract of a template
///
/// `template` names the template in errors; it is not read.
#[tracing::instrument(level = "debug", skip(text))]
pub fn extract(template: &str, text: &str) -> Result<TemplateContract, ContractParseError> {
    let (block, first_line) = if text.trim_start().starts_with('{') {
        (text.to_string(), 1)
    } else {
        match parameters_block(text) {
            Some(found) => found,
            None => {
                tracing::debug!("template declares no parameters");
                return Ok(TemplateContract {
                    template: template.to_string(),
                    parameters: Default::default(),
                });
            }
        }
    };

    let error_at = |line: usize, message: String| ContractParseError {
        template: template.to_string(),
        line,
        context: text
            .lines()
            .nth(line.saturating_sub(1))
            .unwrap_or_default()
            .trim_end()
            .to_string(),
        message,
    };

    let document: Yaml = serde_yaml::from_str(&block).map_err(|err| {
        let line = err
            .location()
            .map(|location| first_line + location.line() - 1)
            .unwrap_or(first_line);
        error_at(line, err.to_string())
    })?;

    let declared = match document.get(PARAMETERS_KEY) {
        None | Some(Yaml::Null) => Yaml::Mapping(Default::default()),
        Some(declared) => declared.clone(),
    };
    let Yaml::Mapping(declared) = declared else {
        return Err(error_at(first_line, "Parameters must be a mapping".into()));
    };

    let mut parameters = IndexMap::new();
    for (name, definition) in declared {
        let Some(name) = name.as_str().map(str::to_string) else {
            return Err(error_at(first_line, "parameter names must be strings".into()));
        };
        let line = line_of(text, &name).unwrap_or(first_line);
        let spec = parameter_spec(&name, &definition).map_err(|message| error_at(line, message))?;
        parameters.insert(name, spec);
    }

    tracing::debug!(count = parameters.len(), "parameters extracted");
    Ok(TemplateContract {
        template: template.to_string(),
        parameters,
    })
}

/// Cut out the top-level `Parameters` block, returning it with its 1-based starting line
fn parameters_block(text: &str) -> Option<(String, usize)> {
    let mut lines = text.lines().enumerate();
    let (start, first) = lines.find(|(_, line)| is_top_level_key(line, PARAMETERS_KEY))?;

    let mut block = String::from(first);
    block.push('\n');
    for (_, line) in lines {
        if is_section_start(line) {
            break;
        }
        block.push_str(line);
        block.push('\n');
    }

    Some((block, start + 1))
}

/// Unindented key opening a block of its own (`Conditions:`, `Resources:  # ...`)
///
/// Other unindented lines, such as the closing brace of a multi-line flow mapping, stay in the block.
fn is_section_start(line: &str) -> bool {
    let starts_unindented = line
        .chars()
        .next()
        .is_some_and(|c| !c.is_whitespace() && c != '#');
    let content = line.split(" #").next().unwrap_or_default().trim_end();
    starts_unindented && content.ends_with(':')
}

fn is_top_level_key(line: &str, key: &str) -> bool {
    line.strip_prefix(key)
        .is_some_and(|rest| rest.trim_start().starts_with(':'))
}

fn line_of(text: &str, name: &str) -> Option<usize> {
    text.lines()
        .position(|line| {
            line.starts_with(char::is_whitespace)
                && line.trim_start().strip_prefix(name).is_some_and(|rest| rest.starts_with(':'))
        })
        .map(|index| index + 1)
}

fn parameter_spec(name: &str, definition: &Yaml) -> Result<ParameterSpec, String> {
    let Yaml::Mapping(definition) = definition else {
        return Err(format!("parameter {name} must be a mapping"));
    };

    let mut spec = ParameterSpec::new(name, "");
    let mut has_type = false;

    for (key, value) in definition {
        let key = key.as_str().unwrap_or_default();
        if let Yaml::Tagged(tagged) = value {
            return Err(format!(
                "parameter {name}.{key} uses the expression {}, which is not supported in Parameters",
                tagged.tag
            ));
        }

        match key {
            "Type" => {
                spec.param_type = scalar(name, key, value)?;
                has_type = true;
            }
            "Default" => spec.default = Some(scalar(name, key, value)?),
            "AllowedValues" => {
                let Yaml::Sequence(items) = value else {
                    return Err(format!("parameter {name}.AllowedValues must be a list"));
                };
                spec.allowed_values = Some(
                    items
                        .iter()
                        .map(|item| scalar(name, key, item))
                        .collect::<Result<_, _>>()?,
                );
            }
            "AllowedPattern" => spec.allowed_pattern = Some(scalar(name, key, value)?),
            "Description" => spec.description = Some(scalar(name, key, value)?),
            "ConstraintDescription" => {
                spec.constraint_description = Some(scalar(name, key, value)?)
            }
            "MinLength" => spec.min_length = Some(length(name, key, value)?),
            "MaxLength" => spec.max_length = Some(length(name, key, value)?),
            "MinValue" => spec.min_value = Some(number(name, key, value)?),
            "MaxValue" => spec.max_value = Some(number(name, key, value)?),
            "NoEcho" => spec.no_echo = scalar(name, key, value)?.eq_ignore_ascii_case("true"),
            _ => {}
        }
    }

    if !has_type {
        return Err(format!("parameter {name} has no Type"));
    }

    Ok(spec)
}

fn scalar(name: &str, key: &str, value: &Yaml) -> Result<String, String> {
    match value {
        Yaml::String(s) => Ok(s.clone()),
        Yaml::Number(n) => Ok(n.to_string()),
        Yaml::Bool(b) => Ok(b.to_string()),
        Yaml::Null => Ok(String::new()),
        Yaml::Tagged(tagged) => Err(format!(
            "parameter {name}.{key} uses the expression {}, which is not supported in Parameters",
            tagged.tag
        )),
        _ => Err(format!("parameter {name}.{key} must be a scalar")),
    }
}

fn number(name: &str, key: &str, value: &Yaml) -> Result<f64, String> {
    scalar(name, key, value)?
        .trim()
        .parse()
        .map_err(|_| format!("parameter {name}.{key} must be a number"))
}

fn length(name: &str, key: &str, value: &Yaml) -> Result<usize, String> {
    let n = number(name, key, value)?;
    if n < 0.0 || n.fract() != 0.0 || n > u32::MAX as f64 {
        return Err(format!("parameter {name}.{key} must be a non-negative whole number"));
    }
    Ok(n as usize)
}

/// The `Parameters` block of a template could not be read
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{template}:{line}: {message}\n  | {context}")]
pub struct ContractParseError {
    pub template: String,
    pub line: usize,
    pub context: String,
    pub message: String,
}

/// Where a template comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateSource {
    /// Relative to the per-infra-type template directory
    Local(String),
    S3 {
        bucket: String,
        key: String,
        version_id: Option<String>,
    },
}

impl TemplateSource {
    pub fn parse(locator: &str) -> Result<Self, crate::identifier::ValidationError> {
        use crate::identifier::{Rule, ValidationError};
        let malformed = || ValidationError::new("template", Rule::MalformedLocator, locator);

        if let Some(rest) = locator.strip_prefix("s3://") {
            let (path, query) = match rest.split_once('?') {
                Some((path, query)) => (path, Some(query)),
                None => (rest, None),
            };
            let (bucket, key) = path.split_once('/').ok_or_else(malformed)?;
            if bucket.is_empty() || key.is_empty() {
                return Err(malformed());
            }

            let mut version_id = None;
            for pair in query.into_iter().flat_map(|q| q.split('&')) {
                match pair.split_once('=') {
                    Some(("versionId", id)) if !id.is_empty() => {
                        version_id = Some(id.to_string())
                    }
                    Some(_) => {}
                    None => return Err(malformed()),
                }
            }

            return Ok(TemplateSource::S3 {
                bucket: bucket.to_string(),
                key: key.to_string(),
                version_id,
            });
        }

        let path = Path::new(locator);
        let escapes = path
            .components()
            .any(|c| !matches!(c, std::path::Component::Normal(_)));
        if locator.is_empty() || escapes {
            return Err(malformed());
        }

        Ok(TemplateSource::Local(locator.to_string()))
    }

}

impl std::fmt::Display for TemplateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TemplateSource::Local(path) => f.write_str(path),
            TemplateSource::S3 {
                bucket,
                key,
                version_id,
            } => {
                write!(f, "s3://{bucket}/{key}")?;
                if let Some(version_id) = version_id {
                    write!(f, "?versionId={version_id}")?;
                }
                Ok(())
            }
        }
    }
}

/// Retrieves remote template text
pub trait TemplateFetcher {
    fn fetch(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<String, Box<dyn std::error::Error + Send + Sync>>;
}

#[derive(thiserror::Error, Debug)]
pub enum TemplateLoadError {
    #[error("unable to read template {path}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("template {0} is remote but no fetcher is available")]
    NoFetcher(String),
    #[error("unable to fetch template {locator}")]
    Fetch {
        locator: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Read template text from disk or through the fetcher
pub fn load_template(
    source: &TemplateSource,
    template_dir: &Path,
    fetcher: Option<&dyn TemplateFetcher>,
) -> Result<String, TemplateLoadError> {
    match source {
        TemplateSource::Local(relative) => {
            let path = template_dir.join(relative);
            tracing::info!(path=%path.display(), "loading template");
            std::fs::read_to_string(&path).map_err(|source| TemplateLoadError::Io { path, source })
        }
        TemplateSource::S3 {
            bucket,
            key,
            version_id,
        } => {
            let fetcher = fetcher.ok_or_else(|| TemplateLoadError::NoFetcher(source.to_string()))?;
            tracing::info!(locator=%source, "fetching template");
            fetcher
                .fetch(bucket, key, version_id.as_deref())
                .map_err(|err| TemplateLoadError::Fetch {
                    locator: source.to_string(),
                    source: err,
                })
        }
    }
}

/// Short content hash identifying one revision of a template
pub fn fingerprint(text: &str) -> String {
    let digest = sha2::Sha256::digest(text.as_bytes());
    hex::encode(digest)[..8].to_string()
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    const PIPELINE: &str = r#"AWSTemplateFormatVersion: "2010-09-09"
Transform: AWS::Serverless-2016-10-31
Description: Pipeline

Parameters:
  Prefix: {Type: String}
  # comment between parameters
  DeployEnvironment:
    Type: String
    AllowedValues: [DEV, TEST, PROD]
    Default: TEST
    Description: What deploy/testing environment will this run under?

  RetentionDays:
    Type: Number
    MinValue: 1
    MaxValue: 365
    Default: 90

Conditions:
  IsProduction: !Equals [!Ref DeployEnvironment, "PROD"]

Resources:
  Bucket:
    Type: AWS::S3::Bucket
    Properties:
      BucketName: !Sub "${Prefix}-artifacts"
"#;

    #[test]
    fn extracts_only_the_parameters_block() {
        let contract = extract("template-pipeline.yml", PIPELINE).unwrap();
        let names: Vec<_> = contract.iter().map(|spec| spec.name.as_str()).collect();
        assert_eq!(names, ["Prefix", "DeployEnvironment", "RetentionDays"]);

        assert_eq!(contract.get("Prefix"), Some(&ParameterSpec::new("Prefix", "String")));

        let env = contract.get("DeployEnvironment").unwrap();
        assert_eq!(env.default.as_deref(), Some("TEST"));
        assert_eq!(
            env.allowed_values,
            Some(vec!["DEV".to_string(), "TEST".into(), "PROD".into()])
        );

        let retention = contract.get("RetentionDays").unwrap();
        assert_eq!(retention.default.as_deref(), Some("90"));
        assert_eq!(retention.max_value, Some(365.0));
    }

    #[test]
    fn unsupported_tags_after_parameters_are_ignored() {
        let text = "Parameters:\n  Prefix: {Type: String}\nOutputs:\n  Weird: !UnknownThing {a: b}\n";
        let contract = extract("t.yml", text).unwrap();
        assert_eq!(
            contract.iter().cloned().collect::<Vec<_>>(),
            vec![ParameterSpec::new("Prefix", "String")]
        );
    }

    #[test]
    fn multi_line_flow_mapping() {
        let text = "Parameters: {\n  Prefix: {Type: String},\n  StageId: {Type: String}\n}\nResources:\n  A: !Ref Prefix\n";
        let contract = extract("t.yml", text).unwrap();
        let names: Vec<_> = contract.iter().map(|spec| spec.name.as_str()).collect();
        assert_eq!(names, ["Prefix", "StageId"]);
    }

    #[test]
    fn lengths_must_be_whole_numbers() {
        for bad in ["-1", "2.5"] {
            let text = format!("Parameters:\n  Prefix:\n    Type: String\n    MinLength: {bad}\n");
            let err = extract("t.yml", &text).unwrap_err();
            assert_eq!(err.line, 2);
            assert!(err.message.contains("whole number"), "{}", err.message);
        }

        let text = "Parameters:\n  Prefix:\n    Type: String\n    MaxLength: 8\n";
        let contract = extract("t.yml", text).unwrap();
        assert_eq!(contract.get("Prefix").unwrap().max_length, Some(8));
    }

    #[test]
    fn no_parameters_block() {
        let contract = extract("t.yml", "Resources:\n  A:\n    Type: X\n").unwrap();
        assert!(contract.is_empty());
    }

    #[test]
    fn tagged_default_is_an_error() {
        let text = "Parameters:\n  Prefix:\n    Type: String\n    Default: !Ref Other\n";
        let err = extract("t.yml", text).unwrap_err();
        assert_eq!(err.template, "t.yml");
        assert_eq!(err.line, 2);
        assert_eq!(err.context, "  Prefix:");
        assert!(err.message.contains("!Ref"), "{}", err.message);
    }

    #[test]
    fn malformed_block_names_template_and_line() {
        let text = "Description: x\nParameters:\n  Prefix:\n    Type: [unclosed\nResources: {}\n";
        let err = extract("broken.yml", text).unwrap_err();
        assert_eq!(err.template, "broken.yml");
        assert!(err.line >= 2, "line {}", err.line);
    }

    #[test]
    fn missing_type_is_an_error() {
        let err = extract("t.yml", "Parameters:\n  Prefix:\n    Default: x\n").unwrap_err();
        assert!(err.message.contains("no Type"));
    }

    #[test]
    fn json_templates() {
        let text = r#"{"Parameters": {"Prefix": {"Type": "String", "Default": "acme"}}}"#;
        let contract = extract("t.json", text).unwrap();
        assert_eq!(contract.get("Prefix").unwrap().default.as_deref(), Some("acme"));
    }

    #[test]
    fn constraint_checks() {
        let mut spec = ParameterSpec::new("Env", "String");
        spec.allowed_values = Some(vec!["DEV".into(), "PROD".into()]);
        assert_eq!(spec.check("DEV"), Ok(()));
        assert_eq!(
            spec.check("QA"),
            Err(ConstraintViolation::NotAllowed("DEV, PROD".into()))
        );

        let mut spec = ParameterSpec::new("Prefix", "String");
        spec.allowed_pattern = Some("[a-z]+".into());
        spec.max_length = Some(4);
        assert_eq!(spec.check("acme"), Ok(()));
        assert!(matches!(spec.check("acme1"), Err(ConstraintViolation::PatternMismatch(_))));
        assert_eq!(spec.check("acmes"), Err(ConstraintViolation::TooLong(4)));

        let mut spec = ParameterSpec::new("Days", "Number");
        spec.min_value = Some(1.0);
        assert_eq!(spec.check("0"), Err(ConstraintViolation::BelowMinimum(1.0)));
        assert_eq!(spec.check("x"), Err(ConstraintViolation::NotANumber));

        let spec = ParameterSpec::new("Vpc", "AWS::EC2::VPC::Id");
        assert_eq!(spec.check("subnet-1"), Err(ConstraintViolation::MissingPrefix("vpc-")));

        let spec = ParameterSpec::new("List", "CommaDelimitedList");
        assert_eq!(spec.check("a,,b"), Err(ConstraintViolation::EmptyListItem));

        let mut spec = ParameterSpec::new("Optional", "String");
        spec.default = Some("x".into());
        spec.min_length = Some(3);
        assert_eq!(spec.check(""), Ok(()));
    }

    #[test]
    fn template_sources() {
        assert_eq!(
            TemplateSource::parse("template-pipeline.yml").unwrap(),
            TemplateSource::Local("template-pipeline.yml".into())
        );

        let s3 = TemplateSource::parse("s3://63klabs/atlantis/v2/template-pipeline.yml?versionId=abc")
            .unwrap();
        assert_eq!(
            s3,
            TemplateSource::S3 {
                bucket: "63klabs".into(),
                key: "atlantis/v2/template-pipeline.yml".into(),
                version_id: Some("abc".into()),
            }
        );
        assert_eq!(
            s3.to_string(),
            "s3://63klabs/atlantis/v2/template-pipeline.yml?versionId=abc"
        );

        assert!(TemplateSource::parse("s3://bucket-only").is_err());
        assert!(TemplateSource::parse("../escape.yml").is_err());
        assert!(TemplateSource::parse("/abs.yml").is_err());
    }

    #[test]
    fn fingerprint_is_stable() {
        assert_eq!(fingerprint("a"), fingerprint("a"));
        assert_ne!(fingerprint("a"), fingerprint("b"));
        assert_eq!(fingerprint("a").len(), 8);
    }
}
