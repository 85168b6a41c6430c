//! Parameter value collection
//!
//! The engine does no terminal I/O. It asks a [ParameterPrompt] for every parameter the template declares and
//! checks the answer against the declared constraints, asking again when the answer is rejected.
use crate::contract::{ConstraintViolation, ParameterSpec};

/// Answer to one question
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Use this value; the current value when it is what was offered
    Accept(String),
    /// Store an empty value
    Clear,
    /// Show the description and ask again
    Help,
    /// Stop the run; nothing is written
    Abort,
}

pub trait ParameterPrompt {
    /// `current` is the value resolved from the cascade, or the template default
    fn ask(&mut self, spec: &ParameterSpec, current: &str) -> Decision;

    fn help(&mut self, _spec: &ParameterSpec) {}

    fn rejected(&mut self, _spec: &ParameterSpec, _value: &str, _violation: &ConstraintViolation) {}
}

/// Non-interactive: every question is answered with the current value
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptDefaults;

impl ParameterPrompt for AcceptDefaults {
    fn ask(&mut self, _spec: &ParameterSpec, current: &str) -> Decision {
        Decision::Accept(current.to_string())
    }

    fn rejected(&mut self, spec: &ParameterSpec, value: &str, violation: &ConstraintViolation) {
        tracing::warn!(parameter=%spec.name, %value, %violation, "default value rejected");
    }
}

/// Questions per parameter before giving up
pub const MAX_ATTEMPTS: usize = 5;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PromptError {
    #[error("aborted while asking for {parameter}")]
    Aborted { parameter: String },
    #[error("no acceptable value for {parameter} after {} attempts (last: {value:?})", MAX_ATTEMPTS)]
    Rejected {
        parameter: String,
        value: String,
        #[source]
        violation: ConstraintViolation,
    },
    #[error("no answer for {parameter} after {} questions", MAX_ATTEMPTS)]
    NoAnswer { parameter: String },
}

/// Ask until an answer satisfies the parameter constraints
pub fn collect(
    prompt: &mut dyn ParameterPrompt,
    spec: &ParameterSpec,
    current: &str,
) -> Result<String, PromptError> {
    let mut last = None;

    for _ in 0..MAX_ATTEMPTS {
        let value = match prompt.ask(spec, current) {
            Decision::Accept(value) => value,
            Decision::Clear => String::new(),
            Decision::Help => {
                prompt.help(spec);
                continue;
            }
            Decision::Abort => {
                return Err(PromptError::Aborted {
                    parameter: spec.name.clone(),
                })
            }
        };

        match spec.check(&value) {
            Ok(()) => return Ok(value),
            Err(violation) => {
                prompt.rejected(spec, &value, &violation);
                last = Some((value, violation));
            }
        }
    }

    let parameter = spec.name.clone();
    Err(match last {
        Some((value, violation)) => PromptError::Rejected {
            parameter,
            value,
            violation,
        },
        None => PromptError::NoAnswer { parameter },
    })
}
