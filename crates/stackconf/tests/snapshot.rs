//! Snapshot tests
//!
//! Renders documents and compares the exact text the deploy tool will read.

use stackconf::dialect::{self, Provenance};
use stackconf::document::{keys, ConfigurationDocument, EnvironmentSection};
use stackconf::identifier::EnvironmentKey;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("STACKCONF_LOG"))
        .with_writer(std::io::stderr)
        .try_init();
}

fn provenance() -> Provenance {
    Provenance::new(
        "stackconf".into(),
        vec![
            "synthesize".into(),
            "pipeline".into(),
            "acme".into(),
            "widget".into(),
            "test".into(),
        ],
        "samconfig/acme/widget/samconfig-acme-widget-pipeline.toml".into(),
    )
}

#[test]
fn pipeline_document() {
    init_logging();

    let mut doc = ConfigurationDocument::default();
    doc.global.insert(
        keys::TEMPLATE_FILE.into(),
        "templates/pipeline/template-pipeline.yml".into(),
    );
    doc.global.insert(keys::S3_BUCKET.into(), "acme-deploy".into());
    doc.global.insert(keys::CONFIRM_CHANGESET.into(), true.into());

    let mut test = EnvironmentSection::new(
        "acme-widget-test-pipeline".into(),
        "acme-widget-test-pipeline".into(),
    );
    test.parameter_overrides.insert("Prefix".into(), "acme".into());
    test.parameter_overrides.insert("AlarmEmail".into(), "".into());
    test.parameter_overrides
        .insert("Message".into(), r#"say "hi""#.into());
    test.tags.insert("Owner".into(), "ops team".into());
    doc.upsert_environment(EnvironmentKey::Stage("test".into()), test);

    let text = dialect::serialize(&doc, &provenance());
    insta::assert_snapshot!(text, @r#"
    # Generated by stackconf
    # Arguments: synthesize pipeline acme widget test
    # DO NOT EDIT: changes are overwritten on the next run
    version = 0.1

    [global.deploy.parameters]
    template_file = "templates/pipeline/template-pipeline.yml"
    s3_bucket = "acme-deploy"
    confirm_changeset = true

    # sam deploy --config-env test --config-file samconfig/acme/widget/samconfig-acme-widget-pipeline.toml
    [test.deploy.parameters]
    stack_name = "acme-widget-test-pipeline"
    s3_prefix = "acme-widget-test-pipeline"
    parameter_overrides = "\"Prefix\"=\"acme\" \"AlarmEmail\"=\"\" \"Message\"=\"say \\\"hi\\\"\""
    tags = "\"Owner\"=\"ops team\""
    "#);

    assert_eq!(dialect::parse(&text, "snapshot").unwrap(), doc);
}

#[test]
fn hand_written_document_is_normalized() {
    init_logging();

    let hand_written = r#"version = 0.1
[prod.deploy.parameters]
stack_name = 'acme-widget-prod-pipeline'
s3_prefix = "acme-widget-prod-pipeline"
parameter_overrides = 'Prefix=acme "StageId"="prod"'

[global.deploy.parameters]
region = "us-east-2"
capabilities = ["CAPABILITY_IAM", "CAPABILITY_AUTO_EXPAND"]

[test.deploy.parameters]
stack_name = "acme-widget-test-pipeline"
s3_prefix = "acme-widget-test-pipeline"
"#;

    let doc = dialect::parse(hand_written, "samconfig.toml").unwrap();
    let text = dialect::serialize(&doc, &Provenance::new("stackconf".into(), vec![], "".into()));
    insta::assert_snapshot!(text, @r#"
    # Generated by stackconf
    # DO NOT EDIT: changes are overwritten on the next run
    version = 0.1

    [global.deploy.parameters]
    region = "us-east-2"
    capabilities = ["CAPABILITY_IAM", "CAPABILITY_AUTO_EXPAND"]

    [prod.deploy.parameters]
    stack_name = "acme-widget-prod-pipeline"
    s3_prefix = "acme-widget-prod-pipeline"
    parameter_overrides = "\"Prefix\"=\"acme\" \"StageId\"=\"prod\""

    [test.deploy.parameters]
    stack_name = "acme-widget-test-pipeline"
    s3_prefix = "acme-widget-test-pipeline"
    "#);
}
