//! In-memory configuration document
//!
//! A [ConfigurationDocument] mirrors what the deploy tool reads from disk, independent of the dialect it is
//! written in (see [crate::dialect]).
//!
//! The global section is an organizational convention: values written there once are shared by every
//! environment *by agreement only*. The deploy tool does not merge it into environment sections, so this
//! model does not pretend it does either.
use crate::contract::TemplateContract;
use crate::identifier::{EnvironmentKey, Rule, ValidationError, ValidationErrors};
use crate::value::Value;
use indexmap::IndexMap;

/// Ordered `key -> value` pairs as written into `parameter_overrides` and `tags`
pub type Pairs = IndexMap<String, String>;

pub mod keys {
    //! Well-known keys of the global section
    pub const TEMPLATE_FILE: &str = "template_file";
    pub const S3_BUCKET: &str = "s3_bucket";
    pub const REGION: &str = "region";
    pub const CAPABILITIES: &str = "capabilities";
    pub const CONFIRM_CHANGESET: &str = "confirm_changeset";
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConfigurationDocument {
    pub global: IndexMap<String, Value>,
    pub environments: IndexMap<EnvironmentKey, EnvironmentSection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, derive_new::new)]
pub struct EnvironmentSection {
    pub stack_name: String,
    pub s3_prefix: String,
    #[new(default)]
    pub parameter_overrides: Pairs,
    #[new(default)]
    pub tags: Pairs,
    #[new(default)]
    pub role_arn: Option<String>,
}

impl ConfigurationDocument {
    pub fn template_file(&self) -> Option<&str> {
        self.global.get(keys::TEMPLATE_FILE).and_then(Value::as_str)
    }

    pub fn environment(&self, key: &EnvironmentKey) -> Option<&EnvironmentSection> {
        self.environments.get(key)
    }

    /// Insert or replace one environment, keeping sections in canonical stage order
    pub fn upsert_environment(&mut self, key: EnvironmentKey, section: EnvironmentSection) {
        self.environments.insert(key, section);
        self.environments
            .sort_by(|a, _, b, _| a.sort_key().cmp(&b.sort_key()));
    }

    /// Every parameter override must be declared by the template in force
    pub fn check_contract(&self, contract: &TemplateContract) -> Result<(), ValidationErrors> {
        let mut e = ValidationErrors::default();
        for (env, section) in &self.environments {
            for key in section.parameter_overrides.keys() {
                if contract.get(key).is_none() {
                    e.log(ValidationError::new(
                        format!("{env}.parameter_overrides"),
                        Rule::UnknownParameter,
                        key,
                    ));
                }
            }
        }
        e.into_result()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::contract;
    use pretty_assertions::assert_eq;

    fn section(name: &str) -> EnvironmentSection {
        EnvironmentSection::new(name.to_string(), name.to_string())
    }

    #[test]
    fn upsert_keeps_canonical_order() {
        let mut doc = ConfigurationDocument::default();
        doc.upsert_environment(EnvironmentKey::Stage("prod".into()), section("p"));
        doc.upsert_environment(EnvironmentKey::Stage("test".into()), section("t"));
        doc.upsert_environment(EnvironmentKey::Stage("beta".into()), section("b"));
        doc.upsert_environment(EnvironmentKey::Stage("test".into()), section("t2"));

        let order: Vec<_> = doc.environments.keys().map(EnvironmentKey::as_str).collect();
        assert_eq!(order, ["test", "beta", "prod"]);
        assert_eq!(
            doc.environment(&EnvironmentKey::Stage("test".into()))
                .unwrap()
                .stack_name,
            "t2"
        );
    }

    #[test]
    fn contract_check_reports_undeclared_overrides() {
        let contract =
            contract::extract("t.yml", "Parameters:\n  Prefix:\n    Type: String\n").unwrap();

        let mut env = section("acme-service-role");
        env.parameter_overrides.insert("Prefix".into(), "acme".into());
        env.parameter_overrides.insert("Legacy".into(), "x".into());

        let mut doc = ConfigurationDocument::default();
        doc.upsert_environment(EnvironmentKey::Default, env);

        let errors = doc.check_contract(&contract).unwrap_err();
        assert_eq!(
            errors.issues(),
            &[ValidationError::new(
                "default.parameter_overrides",
                Rule::UnknownParameter,
                "Legacy"
            )]
        );
    }
}
