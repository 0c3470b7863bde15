use std::fmt::Display;

use serde::{Deserialize, Serialize};

use super::{
    holder::{HolderKey, HolderKind},
    sid::Sid,
};

/// Structural graph operation failures. These are rejected at insertion time.
#[derive(thiserror::Error, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum GraphError {
    #[error("Holder '{kind}' from {source_sid} to {target_sid} references device {missing} which is not in this graph")]
    DanglingEndpoint {
        source_sid: Sid,
        target_sid: Sid,
        kind: HolderKind,
        missing: Sid,
    },

    #[error("Holder '{}' from {} to {} already exists", .0.kind, .0.source, .0.target)]
    DuplicateHolder(HolderKey),

    #[error("Device {sid} not found")]
    NotFound { sid: Sid },

    #[error("Holder '{}' from {} to {} not found", .0.kind, .0.source, .0.target)]
    HolderNotFound(HolderKey),

    #[error("Device with name '{name}' not found")]
    NameNotFound { name: String },

    #[error("Subvolume with path '{path}' not found on filesystem {filesystem}")]
    SubvolumeNotFound { filesystem: Sid, path: String },

    #[error("Device {sid} is its own ancestor")]
    Cycle { sid: Sid },
}

/// The graph element a violation is reported against.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Reference {
    Device { sid: Sid, description: String },
    Holder(HolderKey),
}

impl Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Device { description, .. } => f.write_str(description),
            Self::Holder(key) => write!(f, "holder {key}"),
        }
    }
}

/// One broken structural rule.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub reference: Reference,
    pub message: String,
}

impl Violation {
    pub fn sid(&self) -> Option<Sid> {
        match self.reference {
            Reference::Device { sid, .. } => Some(sid),
            Reference::Holder(_) => None,
        }
    }
}

impl Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.reference, self.message)
    }
}

/// List of violations, displayed one per line.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct ViolationList(pub Vec<Violation>);

impl ViolationList {
    pub fn count_description(&self) -> String {
        match self.0.len() {
            1 => "1 violation".into(),
            n => format!("{n} violations"),
        }
    }
}

impl From<Vec<Violation>> for ViolationList {
    fn from(value: Vec<Violation>) -> Self {
        Self(value)
    }
}

impl Display for ViolationList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, violation) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "  - {violation}")?;
        }
        Ok(())
    }
}
