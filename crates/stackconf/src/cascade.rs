//! Cascading resolution of tags and parameter defaults
//!
//! Defaults come from a fixed sequence of [OverrideLayer]s. Each layer is a flat, delta-only `key -> value`
//! map; folding them left to right (later wins, key by key) yields the [ResolvedMapping].
//!
//! | order | scope                       | example file (params)               |
//! |-------|-----------------------------|-------------------------------------|
//! | 0     | [LayerScope::Seed]          | existing document / deployed stack  |
//! | 1     | [LayerScope::Global]        | `params.json`                       |
//! | 2     | [LayerScope::Prefix]        | `params-acme.json`                  |
//! | 3     | [LayerScope::PrefixProject] | `params-acme-widget.json`           |
//! | 4     | [LayerScope::Infra]         | `pipeline/params.json`              |
//! | 5     | [LayerScope::InfraPrefix]   | `pipeline/params-acme.json`         |
//! | 6     | [LayerScope::InfraProject]  | `pipeline/params-acme-widget.json`  |
//!
//! There is no deep merging: a key is replaced as a whole.
//!
//! Reserved keys are managed by the engine. A layer that sets one is not an error (the file may predate the
//! reservation); the key is dropped and a [Diagnostic] is recorded.
use crate::document::Pairs;
use std::collections::BTreeSet;

/// Scope of a layer, in fold order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LayerScope {
    /// Values previously resolved into a document or deployed stack
    Seed,
    Global,
    Prefix,
    PrefixProject,
    Infra,
    InfraPrefix,
    InfraProject,
}

/// What the values of a layer are used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    Params,
    Tags,
}

impl LayerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerKind::Params => "params",
            LayerKind::Tags => "tags",
        }
    }
}

/// A named source of `key -> value` deltas
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverrideLayer {
    name: String,
    scope: LayerScope,
    entries: Pairs,
}

impl OverrideLayer {
    /// Empty layers are not valid layers
    pub fn new(
        name: impl Into<String>,
        scope: LayerScope,
        entries: Pairs,
    ) -> Result<Self, LayerError> {
        let name = name.into();
        if entries.is_empty() {
            return Err(LayerError::Empty { layer: name });
        }

        Ok(Self {
            name,
            scope,
            entries,
        })
    }

    /// A seed may legitimately be empty (first deployment); it is then omitted
    pub fn seed(name: impl Into<String>, entries: Pairs) -> Option<Self> {
        Self::new(name, LayerScope::Seed, entries).ok()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> LayerScope {
        self.scope
    }

    pub fn entries(&self) -> &Pairs {
        &self.entries
    }

    /// Keys of this layer that do not change the cumulative result of earlier layers
    pub fn redundant_keys(&self, prior: &Pairs) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(key, value)| prior.get(*key) == Some(*value))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Layers must only carry values that differ from what earlier layers resolved to
    pub fn check_delta(&self, prior: &Pairs) -> Result<(), LayerError> {
        let keys = self.redundant_keys(prior);
        if keys.is_empty() {
            return Ok(());
        }

        Err(LayerError::Redundant {
            layer: self.name.clone(),
            all: keys.len() == self.entries.len(),
            keys,
        })
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LayerError {
    #[error("layer {layer} is empty")]
    Empty { layer: String },
    #[error("layer {layer} repeats values already resolved by earlier layers: {}", .keys.join(", "))]
    Redundant {
        layer: String,
        keys: Vec<String>,
        /// every key of the layer is redundant
        all: bool,
    },
}

/// Keys only the engine may set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservedKeys(BTreeSet<String>);

impl ReservedKeys {
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for ReservedKeys {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Non-fatal finding while resolving
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    ReservedKeyRejected { layer: String, key: String },
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Diagnostic::ReservedKeyRejected { layer, key } => {
                write!(f, "{layer}: reserved key {key:?} ignored")
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedMapping {
    pub values: Pairs,
    pub diagnostics: Vec<Diagnostic>,
}

/// Fold layers in scope order
///
/// Layers of equal scope keep the order they were passed in.
#[tracing::instrument(level = "debug", skip_all, fields(layers = layers.len()))]
pub fn resolve(layers: &[OverrideLayer], reserved: &ReservedKeys) -> ResolvedMapping {
    let mut ordered: Vec<&OverrideLayer> = layers.iter().collect();
    ordered.sort_by_key(|layer| layer.scope);

    let mut resolved = ResolvedMapping::default();
    for layer in ordered {
        for (key, value) in &layer.entries {
            if reserved.contains(key) {
                tracing::warn!(layer = %layer.name, %key, "reserved key ignored");
                resolved.diagnostics.push(Diagnostic::ReservedKeyRejected {
                    layer: layer.name.clone(),
                    key: key.clone(),
                });
                continue;
            }

            tracing::trace!(layer = %layer.name, %key, "apply");
            resolved.values.insert(key.clone(), value.clone());
        }
    }

    resolved
}

/// Strip every key that repeats the cumulative value of earlier layers, dropping layers left empty
///
/// Resolving the collapsed layers yields the same values as resolving the originals.
pub fn collapse_redundant(layers: &[OverrideLayer]) -> Vec<OverrideLayer> {
    let mut ordered: Vec<&OverrideLayer> = layers.iter().collect();
    ordered.sort_by_key(|layer| layer.scope);

    let mut cumulative = Pairs::new();
    let mut collapsed = Vec::new();
    for layer in ordered {
        let delta: Pairs = layer
            .entries
            .iter()
            .filter(|(key, value)| cumulative.get(*key) != Some(*value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        cumulative.extend(layer.entries.clone());

        match OverrideLayer::new(layer.name.clone(), layer.scope, delta) {
            Ok(layer) => collapsed.push(layer),
            Err(_) => tracing::debug!(layer = %layer.name, "layer collapsed to nothing"),
        }
    }

    collapsed
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pairs(entries: &[(&str, &str)]) -> Pairs {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn layer(name: &str, scope: LayerScope, entries: &[(&str, &str)]) -> OverrideLayer {
        OverrideLayer::new(name, scope, pairs(entries)).unwrap()
    }

    fn sample_layers() -> Vec<OverrideLayer> {
        vec![
            layer(
                "pipeline/params-acme.json",
                LayerScope::InfraPrefix,
                &[("Owner", "infra-team")],
            ),
            layer(
                "params.json",
                LayerScope::Global,
                &[("Owner", "ops"), ("AlarmEmail", "ops@example.com")],
            ),
            layer(
                "seed",
                LayerScope::Seed,
                &[("Owner", "bob"), ("Runtime", "nodejs20.x")],
            ),
            layer(
                "params-acme.json",
                LayerScope::Prefix,
                &[("AlarmEmail", "acme@example.com"), ("Provisioner", "me")],
            ),
        ]
    }

    #[test]
    fn later_scopes_win_key_by_key() {
        let reserved: ReservedKeys = ["Provisioner"].into_iter().collect();
        let resolved = resolve(&sample_layers(), &reserved);

        assert_eq!(
            resolved.values,
            pairs(&[
                ("Owner", "infra-team"),
                ("Runtime", "nodejs20.x"),
                ("AlarmEmail", "acme@example.com"),
            ])
        );
        assert_eq!(
            resolved.diagnostics,
            vec![Diagnostic::ReservedKeyRejected {
                layer: "params-acme.json".into(),
                key: "Provisioner".into()
            }]
        );
    }

    #[test]
    fn resolve_is_deterministic() {
        let reserved: ReservedKeys = ["Provisioner"].into_iter().collect();
        let layers = sample_layers();
        assert_eq!(resolve(&layers, &reserved), resolve(&layers, &reserved));
    }

    #[test]
    fn reserved_keys_never_survive() {
        let reserved: ReservedKeys = ["Owner", "AlarmEmail", "Provisioner"].into_iter().collect();
        let resolved = resolve(&sample_layers(), &reserved);
        assert!(resolved.values.keys().all(|key| !reserved.contains(key)));
        assert_eq!(resolved.values, pairs(&[("Runtime", "nodejs20.x")]));
    }

    #[test]
    fn empty_layers_are_invalid() {
        assert_eq!(
            OverrideLayer::new("tags.json", LayerScope::Global, Pairs::new()),
            Err(LayerError::Empty {
                layer: "tags.json".into()
            })
        );
        assert_eq!(OverrideLayer::seed("seed", Pairs::new()), None);
    }

    #[test]
    fn delta_check() {
        let prior = pairs(&[("Owner", "ops"), ("CostCenter", "42")]);

        let delta = layer("a", LayerScope::Prefix, &[("Owner", "acme")]);
        assert_eq!(delta.check_delta(&prior), Ok(()));

        let partial = layer("b", LayerScope::Prefix, &[("Owner", "acme"), ("CostCenter", "42")]);
        assert_eq!(
            partial.check_delta(&prior),
            Err(LayerError::Redundant {
                layer: "b".into(),
                keys: vec!["CostCenter".into()],
                all: false
            })
        );

        let redundant = layer("c", LayerScope::Prefix, &[("Owner", "ops")]);
        assert!(matches!(
            redundant.check_delta(&prior),
            Err(LayerError::Redundant { all: true, .. })
        ));
    }

    #[test]
    fn collapsing_redundant_layers_keeps_the_resolution() {
        let reserved: ReservedKeys = ["Provisioner"].into_iter().collect();
        let layers = vec![
            layer("params.json", LayerScope::Global, &[("Owner", "ops"), ("Tier", "1")]),
            layer("params-acme.json", LayerScope::Prefix, &[("Owner", "ops")]),
            layer(
                "pipeline/params.json",
                LayerScope::Infra,
                &[("Tier", "1"), ("Owner", "acme")],
            ),
            layer("pipeline/params-acme.json", LayerScope::InfraPrefix, &[("Owner", "ops")]),
        ];

        let collapsed = collapse_redundant(&layers);
        let names: Vec<_> = collapsed.iter().map(OverrideLayer::name).collect();
        assert_eq!(
            names,
            ["params.json", "pipeline/params.json", "pipeline/params-acme.json"]
        );
        assert_eq!(collapsed[1].entries(), &pairs(&[("Owner", "acme")]));

        assert_eq!(
            resolve(&collapsed, &reserved).values,
            resolve(&layers, &reserved).values
        );
        assert_eq!(collapse_redundant(&collapsed), collapsed);
    }
}
