//! Override layer files
//!
//! Layers live below the settings directory, one file per scope and kind:
//!
//! ```text
//! settings/
//!   params.json                      global
//!   params-acme.json                 prefix
//!   params-acme-widget.json          prefix + project
//!   pipeline/params.json             infra type
//!   pipeline/params-acme.json        infra type + prefix
//!   pipeline/params-acme-widget.json infra type + prefix + project
//!   tags.json ...                    same scheme for tags
//! ```
//!
//! `params` files are JSON objects. `tags` files are either JSON objects or arrays of `{"Key": .., "Value": ..}`
//! entries. Missing files are skipped.
use crate::cascade::{LayerError, LayerKind, LayerScope, OverrideLayer};
use crate::document::Pairs;
use crate::identifier::Identifier;
use std::path::{Path, PathBuf};

/// Candidate files for one kind, in fold order
pub fn layer_files(
    settings_dir: &Path,
    identifier: &Identifier,
    kind: LayerKind,
) -> Vec<(LayerScope, PathBuf)> {
    let kind = kind.as_str();
    let prefix = identifier.prefix();
    let infra_dir = settings_dir.join(identifier.infra_type().as_str());

    let mut files = vec![
        (LayerScope::Global, settings_dir.join(format!("{kind}.json"))),
        (
            LayerScope::Prefix,
            settings_dir.join(format!("{kind}-{prefix}.json")),
        ),
    ];
    if let Some(project) = identifier.project_id() {
        files.push((
            LayerScope::PrefixProject,
            settings_dir.join(format!("{kind}-{prefix}-{project}.json")),
        ));
    }

    files.push((LayerScope::Infra, infra_dir.join(format!("{kind}.json"))));
    files.push((
        LayerScope::InfraPrefix,
        infra_dir.join(format!("{kind}-{prefix}.json")),
    ));
    if let Some(project) = identifier.project_id() {
        files.push((
            LayerScope::InfraProject,
            infra_dir.join(format!("{kind}-{prefix}-{project}.json")),
        ));
    }

    files
}

/// Load every existing layer file of one kind
///
/// A file whose every value repeats what earlier files resolved to is rejected.
#[tracing::instrument(level = "debug", skip(settings_dir, identifier))]
pub fn load_layers(
    settings_dir: &Path,
    identifier: &Identifier,
    kind: LayerKind,
) -> Result<Vec<OverrideLayer>, LayerLoadError> {
    let mut layers = Vec::new();
    let mut cumulative = Pairs::new();

    for (scope, path) in layer_files(settings_dir, identifier, kind) {
        if !path.is_file() {
            tracing::debug!(path=%path.display(), "no layer file");
            continue;
        }

        let name = path
            .strip_prefix(settings_dir)
            .unwrap_or(&path)
            .display()
            .to_string();
        let layer = load_layer_file(&path, &name, scope, kind)?;

        match layer.check_delta(&cumulative) {
            Ok(()) => {}
            Err(LayerError::Redundant { all: false, keys, .. }) => {
                tracing::warn!(layer = %name, ?keys, "layer repeats inherited values");
            }
            Err(source) => return Err(LayerLoadError::Layer { path, source }),
        }

        cumulative.extend(layer.entries().clone());
        layers.push(layer);
    }

    Ok(layers)
}

pub fn load_layer_file(
    path: &Path,
    name: &str,
    scope: LayerScope,
    kind: LayerKind,
) -> Result<OverrideLayer, LayerLoadError> {
    tracing::info!(path=%path.display(), "loading layer file");
    let contents = std::fs::read_to_string(path).map_err(|source| LayerLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let json: serde_json::Value =
        serde_json::from_str(&contents).map_err(|source| LayerLoadError::Json {
            path: path.to_path_buf(),
            source,
        })?;

    let entries = entries_from_json(json, kind).map_err(|message| LayerLoadError::Shape {
        path: path.to_path_buf(),
        message,
    })?;

    OverrideLayer::new(name, scope, entries).map_err(|source| LayerLoadError::Layer {
        path: path.to_path_buf(),
        source,
    })
}

/// Persist the entries of one scope as a delta-only layer file
///
/// Keys whose value equals what the lower scopes already resolve to are left out, so the file only holds what
/// this scope changes. A layer left empty is refused and nothing is written. `tags` layers are written as
/// `{"Key": .., "Value": ..}` arrays, `params` layers as objects.
#[tracing::instrument(level = "debug", skip(settings_dir, identifier, entries))]
pub fn save_layer(
    settings_dir: &Path,
    identifier: &Identifier,
    scope: LayerScope,
    kind: LayerKind,
    entries: &Pairs,
) -> Result<OverrideLayer, LayerLoadError> {
    let files = layer_files(settings_dir, identifier, kind);
    let path = files
        .iter()
        .find(|(candidate, _)| *candidate == scope)
        .map(|(_, path)| path.clone())
        .ok_or(LayerLoadError::NoSuchScope { scope })?;

    let mut inherited = Pairs::new();
    for (lower, file) in files.iter().filter(|(lower, _)| *lower < scope) {
        if file.is_file() {
            let name = file.strip_prefix(settings_dir).unwrap_or(file).display().to_string();
            inherited.extend(load_layer_file(file, &name, *lower, kind)?.entries().clone());
        }
    }

    let delta: Pairs = entries
        .iter()
        .filter(|(key, value)| inherited.get(*key) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    for key in entries.keys().filter(|key| !delta.contains_key(*key)) {
        tracing::debug!(%key, "inherited from a lower scope, not saved");
    }

    let name = path
        .strip_prefix(settings_dir)
        .unwrap_or(&path)
        .display()
        .to_string();
    let layer = OverrideLayer::new(name, scope, delta).map_err(|source| LayerLoadError::Layer {
        path: path.clone(),
        source,
    })?;

    let json = match kind {
        LayerKind::Params => serde_json::to_string_pretty(layer.entries()),
        LayerKind::Tags => serde_json::to_string_pretty(
            &layer
                .entries()
                .iter()
                .map(|(key, value)| TagEntry {
                    key: key.clone(),
                    value: serde_json::Value::String(value.clone()),
                })
                .collect::<Vec<_>>(),
        ),
    }
    .map_err(|source| LayerLoadError::Json {
        path: path.clone(),
        source,
    })?;

    tracing::info!(path=%path.display(), keys = layer.entries().len(), "saving layer file");
    crate::util::write_atomically(&path, &format!("{json}\n"))
        .map_err(|source| LayerLoadError::Write { path, source })?;
    Ok(layer)
}

fn entries_from_json(json: serde_json::Value, kind: LayerKind) -> Result<Pairs, String> {
    use serde_json::Value;

    match (json, kind) {
        (Value::Object(object), _) => object
            .into_iter()
            .map(|(key, value)| Ok((key.clone(), scalar(&key, value)?)))
            .collect(),
        (Value::Array(items), LayerKind::Tags) => {
            let mut entries = Pairs::new();
            for item in items {
                let tag: TagEntry = serde_json::from_value(item).map_err(|e| e.to_string())?;
                let value = scalar(&tag.key, tag.value)?;
                if entries.contains_key(&tag.key) {
                    return Err(format!("tag {:?} is listed more than once", tag.key));
                }
                entries.insert(tag.key, value);
            }
            Ok(entries)
        }
        (_, LayerKind::Tags) => Err("expected an object or an array of {Key, Value}".into()),
        (_, LayerKind::Params) => Err("expected an object".into()),
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TagEntry {
    key: String,
    value: serde_json::Value,
}

fn scalar(key: &str, value: serde_json::Value) -> Result<String, String> {
    use serde_json::Value;

    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(format!("value of {key:?} must be a string, number or boolean")),
    }
}

#[derive(thiserror::Error, Debug)]
pub enum LayerLoadError {
    #[error("unable to read layer file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to write layer file {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no {scope:?} layer file exists for this stack")]
    NoSuchScope { scope: LayerScope },
    #[error("invalid JSON in layer file {path}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unexpected content in layer file {path}: {message}")]
    Shape { path: PathBuf, message: String },
    #[error("invalid layer file {path}")]
    Layer {
        path: PathBuf,
        #[source]
        source: LayerError,
    },
}
