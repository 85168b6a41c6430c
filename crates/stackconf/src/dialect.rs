//! On-disk dialect of configuration documents
//!
//! ```toml
//! # Generated by stackconf
//! # Arguments: pipeline acme --project widget --stage test
//! # DO NOT EDIT: changes are overwritten on the next run
//! version = 0.1
//!
//! [global.deploy.parameters]
//! template_file = "template-pipeline.yml"
//!
//! # sam deploy --config-env test --config-file samconfig/acme/widget/samconfig-acme-widget-pipeline.toml
//! [test.deploy.parameters]
//! stack_name = "acme-widget-test-pipeline"
//! s3_prefix = "acme-widget-test-pipeline"
//! parameter_overrides = "\"Prefix\"=\"acme\" \"StageId\"=\"test\""
//! tags = "\"Owner\"=\"ops team\""
//! ```
//!
//! # Escaping
//!
//! `parameter_overrides` and `tags` hold a *pair string*: `"Key"="Value"` tokens separated by one space.
//! There are two escaping layers and each is applied exactly once:
//!
//! 1. inside a token, `\` and `"` are backslash escaped ([encode_pairs])
//! 2. the pair string is written as a TOML basic string, which escapes `\` and `"` again
//!
//! Literal (single quoted) strings are never written, so the second layer is always the same.
//!
//! Comments are provenance only. They are dropped on parse and regenerated on serialize.
use crate::document::{ConfigurationDocument, EnvironmentSection, Pairs};
use crate::identifier::EnvironmentKey;
use crate::value::Value;
use std::fmt::Write;

pub const VERSION: &str = "0.1";
pub const GLOBAL: &str = "global";
const COMMAND: &str = "deploy";
const PARAMETERS: &str = "parameters";

/// Non-semantic header and comment content
#[derive(Debug, Clone, Default, PartialEq, Eq, derive_new::new)]
pub struct Provenance {
    pub generator: String,
    pub arguments: Vec<String>,
    /// path of the document as passed to the deploy tool
    pub config_file: String,
}

/// Encode ordered pairs as `"K1"="V1" "K2"="V2"`
pub fn encode_pairs(pairs: &Pairs) -> String {
    let mut out = String::new();
    for (i, (key, value)) in pairs.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        quote_token(&mut out, key);
        out.push('=');
        quote_token(&mut out, value);
    }
    out
}

fn quote_token(out: &mut String, token: &str) {
    out.push('"');
    for c in token.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} at offset {offset}")]
pub struct PairsError {
    pub offset: usize,
    pub message: String,
}

impl PairsError {
    fn new(offset: usize, message: impl Into<String>) -> Self {
        Self {
            offset,
            message: message.into(),
        }
    }
}

/// Decode a pair string
///
/// Besides the canonical quoted form, unquoted `Key=Value` tokens are accepted, as hand-written files use
/// them. Tokens may be separated by any run of spaces. Duplicate keys are an error.
pub fn decode_pairs(text: &str) -> Result<Pairs, PairsError> {
    let mut pairs = Pairs::new();
    let mut chars = text.char_indices().peekable();

    loop {
        while chars.next_if(|(_, c)| *c == ' ').is_some() {}
        let Some(&(start, _)) = chars.peek() else {
            break;
        };

        let key = token(&mut chars, text.len())?;
        match chars.next() {
            Some((_, '=')) => {}
            Some((offset, c)) => return Err(PairsError::new(offset, format!("expected '=', found {c:?}"))),
            None => return Err(PairsError::new(text.len(), "expected '=' after key")),
        }
        let value = token(&mut chars, text.len())?;

        match chars.peek() {
            None | Some((_, ' ')) => {}
            Some(&(offset, c)) => {
                return Err(PairsError::new(offset, format!("expected ' ', found {c:?}")))
            }
        }

        if key.is_empty() {
            return Err(PairsError::new(start, "empty key"));
        }
        if pairs.contains_key(&key) {
            return Err(PairsError::new(start, format!("duplicate key {key:?}")));
        }
        pairs.insert(key, value);
    }

    Ok(pairs)
}

type Chars<'a> = std::iter::Peekable<std::str::CharIndices<'a>>;

fn token(chars: &mut Chars<'_>, end: usize) -> Result<String, PairsError> {
    let mut token = String::new();

    let Some(&(open, first)) = chars.peek() else {
        return Err(PairsError::new(end, "unexpected end of input"));
    };

    if first != '"' {
        while let Some((_, c)) = chars.next_if(|(_, c)| *c != '=' && *c != ' ' && *c != '"') {
            token.push(c);
        }
        return Ok(token);
    }

    chars.next();
    loop {
        match chars.next() {
            Some((_, '"')) => return Ok(token),
            Some((offset, '\\')) => match chars.next() {
                Some((_, c @ ('"' | '\\'))) => token.push(c),
                Some((_, c)) => {
                    return Err(PairsError::new(offset, format!("invalid escape \\{c}")))
                }
                None => return Err(PairsError::new(offset, "unterminated escape")),
            },
            Some((_, c)) => token.push(c),
            None => return Err(PairsError::new(open, "unterminated quoted token")),
        }
    }
}

/// Render a document
///
/// The output depends on nothing but the arguments, so serializing a parsed document reproduces its bytes.
pub fn serialize(document: &ConfigurationDocument, provenance: &Provenance) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "# Generated by {}", provenance.generator);
    if !provenance.arguments.is_empty() {
        let _ = writeln!(out, "# Arguments: {}", provenance.arguments.join(" "));
    }
    out.push_str("# DO NOT EDIT: changes are overwritten on the next run\n");
    let _ = writeln!(out, "version = {VERSION}");

    out.push('\n');
    section_header(&mut out, GLOBAL);
    for (key, value) in &document.global {
        write_key(&mut out, key);
        out.push_str(" = ");
        write_value(&mut out, value);
        out.push('\n');
    }

    for (env, section) in &document.environments {
        out.push('\n');
        if !provenance.config_file.is_empty() {
            let _ = writeln!(
                out,
                "# sam deploy --config-env {env} --config-file {}",
                provenance.config_file
            );
        }
        section_header(&mut out, env.as_str());
        write_environment(&mut out, section);
    }

    out
}

fn section_header(out: &mut String, env: &str) {
    out.push('[');
    write_key(out, env);
    let _ = writeln!(out, ".{COMMAND}.{PARAMETERS}]");
}

fn write_environment(out: &mut String, section: &EnvironmentSection) {
    let mut field = |key: &str, value: &str| {
        out.push_str(key);
        out.push_str(" = ");
        basic_string(out, value);
        out.push('\n');
    };

    field(fields::STACK_NAME, &section.stack_name);
    field(fields::S3_PREFIX, &section.s3_prefix);
    if !section.parameter_overrides.is_empty() {
        field(
            fields::PARAMETER_OVERRIDES,
            &encode_pairs(&section.parameter_overrides),
        );
    }
    if !section.tags.is_empty() {
        field(fields::TAGS, &encode_pairs(&section.tags));
    }
    if let Some(role_arn) = &section.role_arn {
        field(fields::ROLE_ARN, role_arn);
    }
}

mod fields {
    pub const STACK_NAME: &str = "stack_name";
    pub const S3_PREFIX: &str = "s3_prefix";
    pub const PARAMETER_OVERRIDES: &str = "parameter_overrides";
    pub const TAGS: &str = "tags";
    pub const ROLE_ARN: &str = "role_arn";
}

fn write_key(out: &mut String, key: &str) {
    let bare = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if bare {
        out.push_str(key);
    } else {
        basic_string(out, key);
    }
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Boolean(b) => {
            let _ = write!(out, "{b}");
        }
        Value::Integer(i) => {
            let _ = write!(out, "{i}");
        }
        Value::Decimal(d) => out.push_str(&decimal(*d)),
        Value::String(s) => basic_string(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_value(out, item);
            }
            out.push(']');
        }
    }
}

/// Decimals must read back as floats, never as integers
fn decimal(d: f64) -> String {
    if d.is_nan() {
        return "nan".into();
    }
    if d.is_infinite() {
        return if d > 0.0 { "inf".into() } else { "-inf".into() };
    }
    let text = d.to_string();
    if text.contains(['.', 'e', 'E']) {
        text
    } else {
        format!("{text}.0")
    }
}

/// Double quoted TOML string
fn basic_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            c if c.is_control() && (c as u32) < 0x80 => {
                let _ = write!(out, "\\u{:04X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{source_ref}: {context}: {message}")]
pub struct DialectParseError {
    /// file the text was read from
    pub source_ref: String,
    /// line or section/key the problem was found in
    pub context: String,
    pub message: String,
}

/// Parse a document, rejecting anything the model cannot represent
#[tracing::instrument(level = "debug", skip(text))]
pub fn parse(text: &str, source_ref: &str) -> Result<ConfigurationDocument, DialectParseError> {
    let err = |context: &str, message: String| DialectParseError {
        source_ref: source_ref.to_string(),
        context: context.to_string(),
        message,
    };

    let table: toml::Table = text.parse().map_err(|e: toml::de::Error| {
        let context = match e.span() {
            Some(span) => format!("line {}", line_of(text, span.start)),
            None => "document".to_string(),
        };
        err(&context, e.message().to_string())
    })?;

    let mut document = ConfigurationDocument::default();
    let mut version = false;

    for (name, entry) in table {
        if name == "version" {
            match &entry {
                toml::Value::Float(v) if v.to_string() == VERSION => version = true,
                other => return Err(err("version", format!("unsupported version {other}"))),
            }
            continue;
        }

        let parameters = command_parameters(&name, entry).map_err(|message| err(&name, message))?;

        if name == GLOBAL {
            for (key, value) in parameters {
                let context = format!("{GLOBAL}.{key}");
                let value = Value::try_from(value)
                    .map_err(|e| err(&context, format!("unsupported {} value", e.0)))?;
                document.global.insert(key, value);
            }
            continue;
        }

        let key = EnvironmentKey::parse(&name).map_err(|e| err(&name, e.to_string()))?;
        let section = environment(&name, parameters).map_err(|(field, message)| {
            err(&format!("{name}.{field}"), message)
        })?;
        document.environments.insert(key, section);
    }

    if !version {
        return Err(err("version", "missing version".to_string()));
    }

    Ok(document)
}

fn line_of(text: &str, offset: usize) -> usize {
    text[..offset.min(text.len())].matches('\n').count() + 1
}

/// `[<name>.deploy.parameters]` is the only table an environment may have
fn command_parameters(name: &str, entry: toml::Value) -> Result<toml::Table, String> {
    let toml::Value::Table(mut commands) = entry else {
        return Err(format!("expected a [{name}.{COMMAND}.{PARAMETERS}] section"));
    };

    let deploy = commands
        .remove(COMMAND)
        .ok_or_else(|| format!("missing [{name}.{COMMAND}.{PARAMETERS}] section"))?;
    if let Some(other) = commands.keys().next() {
        return Err(format!("unsupported command {other:?}"));
    }

    let toml::Value::Table(mut deploy) = deploy else {
        return Err(format!("expected a [{name}.{COMMAND}.{PARAMETERS}] section"));
    };
    let parameters = deploy
        .remove(PARAMETERS)
        .ok_or_else(|| format!("missing [{name}.{COMMAND}.{PARAMETERS}] section"))?;
    if let Some(other) = deploy.keys().next() {
        return Err(format!("unsupported key {COMMAND}.{other}"));
    }

    match parameters {
        toml::Value::Table(parameters) => Ok(parameters),
        _ => Err(format!("{COMMAND}.{PARAMETERS} must be a table")),
    }
}

fn environment(
    name: &str,
    mut parameters: toml::Table,
) -> Result<EnvironmentSection, (String, String)> {
    let mut string = |field: &str| -> Result<Option<String>, (String, String)> {
        match parameters.remove(field) {
            None => Ok(None),
            Some(toml::Value::String(s)) => Ok(Some(s)),
            Some(other) => Err((
                field.to_string(),
                format!("expected a string, found {}", other.type_str()),
            )),
        }
    };
    let required = |value: Option<String>, field: &str| {
        value.ok_or_else(|| (field.to_string(), format!("missing in environment {name}")))
    };
    let pairs = |value: Option<String>, field: &str| match value {
        None => Ok(Pairs::new()),
        Some(text) => decode_pairs(&text).map_err(|e| (field.to_string(), e.to_string())),
    };

    let stack_name = required(string(fields::STACK_NAME)?, fields::STACK_NAME)?;
    let s3_prefix = required(string(fields::S3_PREFIX)?, fields::S3_PREFIX)?;
    let parameter_overrides = pairs(
        string(fields::PARAMETER_OVERRIDES)?,
        fields::PARAMETER_OVERRIDES,
    )?;
    let tags = pairs(string(fields::TAGS)?, fields::TAGS)?;
    let role_arn = string(fields::ROLE_ARN)?;

    if let Some(unknown) = parameters.keys().next() {
        return Err((unknown.clone(), "unsupported key".to_string()));
    }

    Ok(EnvironmentSection {
        stack_name,
        s3_prefix,
        parameter_overrides,
        tags,
        role_arn,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::document::keys;
    use pretty_assertions::assert_eq;

    fn pairs(entries: &[(&str, &str)]) -> Pairs {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn provenance() -> Provenance {
        Provenance::new(
            "stackconf".into(),
            vec!["pipeline".into(), "acme".into()],
            "samconfig/acme/widget/samconfig-acme-widget-pipeline.toml".into(),
        )
    }

    fn awkward() -> Pairs {
        pairs(&[
            ("Owner", "ops team"),
            ("Quote", r#"say "hi""#),
            ("Empty", ""),
            ("Path", r"C:\temp\"),
            ("Equals", "a=b c=d"),
        ])
    }

    fn document() -> ConfigurationDocument {
        let mut doc = ConfigurationDocument::default();
        doc.global
            .insert(keys::TEMPLATE_FILE.into(), "template-pipeline.yml".into());
        doc.global.insert(keys::CONFIRM_CHANGESET.into(), true.into());
        doc.global.insert("ratio".into(), Value::Decimal(1.0));
        doc.global.insert(
            keys::CAPABILITIES.into(),
            Value::Array(vec!["CAPABILITY_IAM".into(), "CAPABILITY_NAMED_IAM".into()]),
        );

        let mut test = EnvironmentSection::new(
            "acme-widget-test-pipeline".into(),
            "acme-widget-test-pipeline".into(),
        );
        test.parameter_overrides = awkward();
        test.tags = pairs(&[("Owner", "ops"), ("Note", "line\nbreak\ttab")]);
        test.role_arn = Some("arn:aws:iam::123456789012:role/deploy".into());
        doc.upsert_environment(EnvironmentKey::Stage("test".into()), test);

        doc.upsert_environment(
            EnvironmentKey::Stage("prod".into()),
            EnvironmentSection::new(
                "acme-widget-prod-pipeline".into(),
                "acme-widget-prod-pipeline".into(),
            ),
        );
        doc
    }

    #[test]
    fn pair_encoding() {
        assert_eq!(
            encode_pairs(&pairs(&[("Prefix", "acme"), ("Empty", "")])),
            r#""Prefix"="acme" "Empty"="""#
        );
        assert_eq!(
            encode_pairs(&pairs(&[("Quote", r#"a "b""#)])),
            r#""Quote"="a \"b\"""#
        );
        assert_eq!(encode_pairs(&Pairs::new()), "");
    }

    #[test]
    fn pairs_round_trip() {
        let encoded = encode_pairs(&awkward());
        let decoded = decode_pairs(&encoded).unwrap();
        assert_eq!(decoded, awkward());
        assert!(decoded.keys().eq(awkward().keys()));
    }

    #[test]
    fn hand_written_pairs() {
        assert_eq!(
            decode_pairs(r#"Prefix=acme  "Owner"="ops team" Flag="""#).unwrap(),
            pairs(&[("Prefix", "acme"), ("Owner", "ops team"), ("Flag", "")])
        );
    }

    #[test]
    fn malformed_pairs() {
        assert_eq!(
            decode_pairs(r#""Owner"="ops"#).unwrap_err().message,
            "unterminated quoted token"
        );
        assert_eq!(
            decode_pairs(r#""Owner" "ops""#).unwrap_err().offset,
            7
        );
        assert_eq!(
            decode_pairs(r#""a"="1" "a"="2""#).unwrap_err().message,
            r#"duplicate key "a""#
        );
        assert!(decode_pairs(r#""a"="1""b"="2""#).is_err());
        assert!(decode_pairs(r#""a"="\n""#).is_err());
    }

    #[test]
    fn outer_quotes_are_escaped_once() {
        let text = serialize(&document(), &provenance());
        assert!(text.contains(r#"tags = "\"Owner\"=\"ops\" \"Note\"=\"line\nbreak\ttab\"""#));
        assert!(text.contains(r#"\"Quote\"=\"say \\\"hi\\\"\""#));
        assert!(!text.contains('\''));
    }

    #[test]
    fn document_round_trip() {
        let doc = document();
        let text = serialize(&doc, &provenance());
        let parsed = parse(&text, "samconfig.toml").unwrap();

        assert_eq!(parsed, doc);
        let order: Vec<_> = parsed.environments.keys().map(EnvironmentKey::as_str).collect();
        assert_eq!(order, ["test", "prod"]);
        let test = parsed.environment(&EnvironmentKey::Stage("test".into())).unwrap();
        assert!(test.parameter_overrides.keys().eq(awkward().keys()));
    }

    #[test]
    fn serialize_is_idempotent() {
        let first = serialize(&document(), &provenance());
        let second = serialize(&parse(&first, "samconfig.toml").unwrap(), &provenance());
        assert_eq!(first, second);
    }

    #[test]
    fn global_comes_first() {
        let text = serialize(&document(), &provenance());
        let global = text.find("[global.deploy.parameters]").unwrap();
        let test = text.find("[test.deploy.parameters]").unwrap();
        assert!(global < test);
        assert!(text.contains("ratio = 1.0\n"));
        assert!(text.contains(
            "# sam deploy --config-env prod --config-file samconfig/acme/widget/samconfig-acme-widget-pipeline.toml\n[prod.deploy.parameters]\n"
        ));
    }

    #[test]
    fn comments_are_ignored() {
        let text = "# hand written\nversion = 0.1 # trailing\n\n[default.deploy.parameters]\n# note\nstack_name = \"acme-service-role\"\ns3_prefix = \"acme-service-role\"\n";
        let doc = parse(text, "samconfig.toml").unwrap();
        assert!(doc.global.is_empty());
        assert_eq!(
            doc.environment(&EnvironmentKey::Default).unwrap().stack_name,
            "acme-service-role"
        );
    }

    fn parse_err(text: &str) -> DialectParseError {
        parse(text, "samconfig.toml").unwrap_err()
    }

    #[test]
    fn strict_parse() {
        let e = parse_err("version = 0.1\n[test.deploy.parameters]\nstack_name = \"s\"\n");
        assert_eq!(e.context, "test.s3_prefix");

        let e = parse_err("version = 0.1\n[test.deploy.parameters]\nstack_name = \"s\"\ns3_prefix = \"s\"\nregion = \"x\"\n");
        assert_eq!(e.context, "test.region");
        assert_eq!(e.message, "unsupported key");

        let e = parse_err("version = 0.1\n[test.build.parameters]\ncached = true\n");
        assert_eq!(e.context, "test");

        let e = parse_err("[global.deploy.parameters]\n");
        assert_eq!(e.context, "version");

        let e = parse_err(
            "version = 0.1\n[test.deploy.parameters]\nstack_name = \"s\"\ns3_prefix = \"s\"\ntags = \"\\\"Owner\"\n",
        );
        assert_eq!(e.context, "test.tags");
        assert_eq!(e.source_ref, "samconfig.toml");
    }

    #[test]
    fn syntax_errors_name_the_line() {
        let e = parse_err("version = 0.1\n\n[test.deploy.parameters\n");
        assert_eq!(e.context, "line 3");
    }
}
