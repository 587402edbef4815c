//! Processing errors and per-message diagnostics.
//!
//! A [`ProcessingError`] describes one thing that went wrong while a message
//! was transformed. Most of them are local (one substitution, one fan-out
//! element, one action) and are collected as [`Diagnostic`]s next to the
//! result; only parse and script failures end processing for a mapping.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pipeline stage a message is in, or failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    Received,
    Normalized,
    Substituted,
    ScriptExecuted,
    Assembled,
    Dispatched,
}

impl fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Received => "received",
            Self::Normalized => "normalized",
            Self::Substituted => "substituted",
            Self::ScriptExecuted => "script_executed",
            Self::Assembled => "assembled",
            Self::Dispatched => "dispatched",
        };
        f.write_str(s)
    }
}

/// Everything that can go wrong while a single message is processed.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcessingError {
    /// Payload could not be decoded.
    #[error("Parse error: {reason}")]
    Parse { reason: String, raw_sample: String },

    /// A source path did not resolve or could not be coerced.
    #[error("Resolution error at '{path}': {reason}")]
    Resolution { path: String, reason: String },

    /// A value could not be written to its target path.
    #[error("Repair error at '{path}': {reason}")]
    Repair { path: String, reason: String },

    /// Fan-out keys had different lengths; documents were truncated.
    #[error("Fan-out mismatch {lengths:?}, truncated to {used}")]
    FanOutMismatch {
        lengths: BTreeMap<String, usize>,
        used: usize,
    },

    /// Device identity could not be resolved or created.
    #[error("Identity error for '{external_id}' ({id_type}): {reason}")]
    Identity {
        external_id: String,
        id_type: String,
        reason: String,
    },

    /// Smart Function failed, timed out or returned garbage.
    #[error("Script error: {reason}")]
    Script { reason: String },

    /// An action could not be delivered.
    #[error("Dispatch error: {reason}")]
    Dispatch { reason: String },
}

impl ProcessingError {
    /// Build a parse error keeping a printable sample of the raw payload.
    pub fn parse(reason: impl Into<String>, raw: &[u8], sample_len: usize) -> Self {
        let end = raw.len().min(sample_len);
        Self::Parse {
            reason: reason.into(),
            raw_sample: String::from_utf8_lossy(&raw[..end]).into_owned(),
        }
    }

    pub fn resolution(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Resolution {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn repair(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Repair {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn script(reason: impl Into<String>) -> Self {
        Self::Script {
            reason: reason.into(),
        }
    }

    pub fn dispatch(reason: impl Into<String>) -> Self {
        Self::Dispatch {
            reason: reason.into(),
        }
    }

    /// Stage that produced this error.
    pub fn stage(&self) -> ProcessingStage {
        match self {
            Self::Parse { .. } => ProcessingStage::Received,
            Self::Resolution { .. } => ProcessingStage::Normalized,
            Self::Script { .. } => ProcessingStage::Normalized,
            Self::Repair { .. } | Self::FanOutMismatch { .. } => ProcessingStage::Substituted,
            Self::Identity { .. } => ProcessingStage::Assembled,
            Self::Dispatch { .. } => ProcessingStage::Assembled,
        }
    }

    /// Whether this error ends processing of the message for its mapping.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Parse { .. } | Self::Script { .. })
    }

    /// Short name used for counters and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Parse { .. } => "parse",
            Self::Resolution { .. } => "resolution",
            Self::Repair { .. } => "repair",
            Self::FanOutMismatch { .. } => "fan_out_mismatch",
            Self::Identity { .. } => "identity",
            Self::Script { .. } => "script",
            Self::Dispatch { .. } => "dispatch",
        }
    }
}

/// A processing error tagged with where it happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub mapping_id: String,
    pub message_id: String,
    pub stage: ProcessingStage,
    pub error: ProcessingError,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}/{}] {}: {}",
            self.mapping_id, self.message_id, self.stage, self.error
        )
    }
}

/// Diagnostics collected for one message and one mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Diagnostics(Vec<Diagnostic>);

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, mapping_id: &str, message_id: &str, error: ProcessingError) {
        tracing::debug!(
            mapping = %mapping_id,
            message_id = %message_id,
            stage = %error.stage(),
            kind = error.kind(),
            "{}",
            error
        );
        self.0.push(Diagnostic {
            mapping_id: mapping_id.to_string(),
            message_id: message_id.to_string(),
            stage: error.stage(),
            error,
        });
    }

    pub fn extend(
        &mut self,
        mapping_id: &str,
        message_id: &str,
        errors: impl IntoIterator<Item = ProcessingError>,
    ) {
        for error in errors {
            self.push(mapping_id, message_id, error);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.0.iter()
    }

    /// Number of diagnostics of the given kind (see [`ProcessingError::kind`]).
    pub fn count(&self, kind: &str) -> usize {
        self.0.iter().filter(|d| d.error.kind() == kind).count()
    }

    pub fn into_inner(self) -> Vec<Diagnostic> {
        self.0
    }
}

impl IntoIterator for Diagnostics {
    type Item = Diagnostic;
    type IntoIter = std::vec::IntoIter<Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
