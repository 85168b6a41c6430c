//! # stackconf - deploy configuration synthesis
//!
//! `stackconf` writes the configuration documents the SAM CLI reads (`samconfig.toml`) for stacks named after
//! a `(prefix, project, stage, infra type)` [identifier::Identifier].
//!
//! ## Introduction for developers
//!
//! Read this to understand how `stackconf` works internally.
//!
//! ### Terms
//!
//! - a **stack** is identified by an [identifier::Identifier]. Stack name, artifact prefix and document file name
//!   are pure functions of it.
//! - a **document** ([document::ConfigurationDocument]) holds a global section and one environment section per
//!   stage. Stages of one application share a document.
//! - a **template** declares parameters. Its `Parameters` block is the [contract::TemplateContract] every
//!   environment section must honor.
//! - an **override layer** ([cascade::OverrideLayer]) is a delta-only file of defaults for parameters or tags at
//!   one scope (global, per prefix, per project, each optionally per infra type).
//!
//! ### Synthesis
//!
//! see [synthesis::Synthesizer::synthesize]
//!
//! One run touches one environment section:
//!
//! ```text
//!   existing document ─┐
//!                      ├─ drift::reconcile ─ seed ─┐
//!   deployed stack ────┘                           ├─ cascade::resolve ─ prompt ─ automatic tags ─ write
//!   settings/*.json ───────────────────────────────┘
//! ```
//!
//! The deployed stack is read through a [snapshot::StackQuery]. Retrying transient failures is the reader's job,
//! not the caller's. When the document and the deployed stack disagree the run stops and asks a
//! [drift::ResolveDrift] for a decision that applies to the whole environment.
//!
//! ### Extracting the contract
//!
//! Templates use tagged expressions (`!Ref`, `!If`, `!Sub`, ...) that no generic YAML reader understands. We do
//! not model them. [contract::extract] cuts the `Parameters` block out of the text and parses only that.
//!
//! ### Writing
//!
//! [dialect] renders the document. The pair strings of `parameter_overrides` and `tags` are escaped in two layers,
//! each exactly once. Re-serializing a parsed document reproduces its bytes. The file is replaced atomically, so an
//! interrupted run leaves the previous version in place.
//!
pub mod cascade;
pub mod config;
pub mod contract;
pub mod dialect;
pub mod document;
pub mod drift;
pub mod identifier;
pub mod prompt;
pub mod settings;
pub mod snapshot;
pub mod synthesis;
pub mod tags;
mod util;
pub mod value;

use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] identifier::ValidationErrors),
    #[error(transparent)]
    Contract(#[from] contract::ContractParseError),
    #[error(transparent)]
    Template(#[from] contract::TemplateLoadError),
    #[error(transparent)]
    Layer(#[from] settings::LayerLoadError),
    #[error(transparent)]
    Snapshot(#[from] snapshot::SnapshotError),
    #[error(transparent)]
    Drift(#[from] drift::DriftAborted),
    #[error(transparent)]
    Dialect(#[from] dialect::DialectParseError),
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Prompt(#[from] prompt::PromptError),
    #[error("unable to read {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to write {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no template given for {0} and none recorded")]
    NoTemplate(String),
    #[error("stack {0} does not exist")]
    StackNotFound(String),
    #[error("no stack query available")]
    NoStackQuery,
}
