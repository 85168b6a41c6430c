//! Tags managed by the engine
//!
//! Identity, template revision and environment classification tags are computed on every synthesis run.
//! They are reserved: override layers cannot set them and drift detection ignores them, since they are
//! expected to change whenever the template does.
use crate::cascade::ReservedKeys;
use crate::document::Pairs;
use crate::identifier::{EnvironmentKey, Identifier};

pub const PROVISIONER: &str = "Provisioner";
pub const DEPLOYED_USING: &str = "DeployedUsing";
pub const STAGE: &str = "Stage";
pub const ENVIRONMENT: &str = "Environment";

/// Parameter whose value is copied into the [ENVIRONMENT] tag
pub const DEPLOY_ENVIRONMENT_PARAMETER: &str = "DeployEnvironment";

/// Tag names below one namespace
#[derive(Debug, Clone, PartialEq, Eq, derive_new::new)]
pub struct TagNames {
    namespace: String,
}

impl TagNames {
    /// `atlantis` -> `Atlantis`
    pub fn identity(&self) -> String {
        let mut chars = self.namespace.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    }

    fn namespaced(&self, name: &str) -> String {
        format!("{}:{}", self.namespace, name)
    }

    pub fn prefix(&self) -> String {
        self.namespaced("Prefix")
    }

    pub fn template_version(&self) -> String {
        self.namespaced("TemplateVer")
    }

    /// Carries the template locator; read back from deployed stacks
    pub fn template_file(&self) -> String {
        self.namespaced("TemplateFile")
    }

    pub fn application(&self) -> String {
        self.namespaced("Application")
    }

    pub fn deployment_id(&self) -> String {
        self.namespaced("ApplicationDeploymentId")
    }

    pub fn reserved(&self) -> ReservedKeys {
        [
            self.identity(),
            self.prefix(),
            self.template_version(),
            self.template_file(),
            self.application(),
            self.deployment_id(),
            PROVISIONER.to_string(),
            DEPLOYED_USING.to_string(),
            STAGE.to_string(),
            ENVIRONMENT.to_string(),
        ]
        .into_iter()
        .collect()
    }

    /// Tags appended after the user tags of one environment
    pub fn automatic(
        &self,
        identifier: &Identifier,
        template_file: &str,
        template_version: &str,
        parameters: &Pairs,
    ) -> Pairs {
        let mut tags = Pairs::new();
        tags.insert(self.identity(), identifier.infra_type().to_string());
        tags.insert(self.prefix(), identifier.prefix().to_string());
        tags.insert(PROVISIONER.into(), "CloudFormation".into());
        tags.insert(DEPLOYED_USING.into(), "AWS SAM CLI".into());
        tags.insert(self.template_version(), template_version.to_string());
        tags.insert(self.template_file(), template_file.to_string());

        if identifier.project_id().is_some() {
            tags.insert(self.application(), identifier.application());
        }

        if let EnvironmentKey::Stage(stage) = identifier.environment() {
            tags.insert(
                self.deployment_id(),
                format!("{}-{}", identifier.application(), stage),
            );
            tags.insert(STAGE.into(), stage);
            if let Some(environment) = parameters.get(DEPLOY_ENVIRONMENT_PARAMETER) {
                tags.insert(ENVIRONMENT.into(), environment.clone());
            }
        }

        tags
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::identifier::InfraType;
    use pretty_assertions::assert_eq;

    #[test]
    fn automatic_tags_for_a_staged_stack() {
        let names = TagNames::new("atlantis".into());
        let id = Identifier::new(
            InfraType::Pipeline,
            "acme",
            Some("widget".into()),
            Some("test".into()),
        )
        .unwrap();
        let params: Pairs = [("DeployEnvironment".to_string(), "TEST".to_string())]
            .into_iter()
            .collect();

        let tags = names.automatic(&id, "template-pipeline.yml", "0a1b2c3d", &params);
        let tags: Vec<_> = tags.iter().map(|(k, v)| format!("{k}={v}")).collect();
        assert_eq!(
            tags,
            [
                "Atlantis=pipeline",
                "atlantis:Prefix=acme",
                "Provisioner=CloudFormation",
                "DeployedUsing=AWS SAM CLI",
                "atlantis:TemplateVer=0a1b2c3d",
                "atlantis:TemplateFile=template-pipeline.yml",
                "atlantis:Application=acme-widget",
                "atlantis:ApplicationDeploymentId=acme-widget-test",
                "Stage=test",
                "Environment=TEST",
            ]
        );
    }

    #[test]
    fn every_automatic_tag_is_reserved() {
        let names = TagNames::new("acme".into());
        let id =
            Identifier::new(InfraType::Network, "acme", Some("net".into()), Some("prod".into()))
                .unwrap();
        let params: Pairs = [("DeployEnvironment".to_string(), "PROD".to_string())]
            .into_iter()
            .collect();

        let reserved = names.reserved();
        for key in names.automatic(&id, "t.yml", "v", &params).keys() {
            assert!(reserved.contains(key), "{key} is not reserved");
        }
    }
}
