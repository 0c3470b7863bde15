use std::fmt::{Debug, Write};
use std::{borrow::Cow, panic::Location};

use serde::{ser::SerializeStruct, Deserialize, Serialize};
use strum_macros::IntoStaticStr;

use crate::storage_graph::error::{GraphError, ViolationList};

/// A device could not be inspected while building the probed graph.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeError {
    #[error("Failed to probe {what} for device '{device}' in pass {pass}")]
    ProbeFailure {
        device: String,
        pass: String,
        what: String,
    },
    #[error("Failed to query system inventory: {0}")]
    Inventory(String),
    #[error("Failed to mount '{device}' for probing")]
    EnsureMounted { device: String },
}

/// The graph violates structural rules.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationError {
    #[error("Device graph check failed with {}:\n{violations}", .violations.count_description())]
    ValidationFailure { violations: ViolationList },
}

/// No valid action sequence exists for the requested change.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum PlanningError {
    #[error("Actions depend on each other in a cycle: {cycle}")]
    UnresolvableDependency { cycle: String },
    #[error("Unsupported change to {device}: {reason}")]
    UnsupportedChange { device: String, reason: String },
}

/// An action of a commit sequence did not complete.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ActionError {
    #[error("Action '{action}' on {device} failed after {executed} of {total} actions completed")]
    ActionFailure {
        action: String,
        device: String,
        executed: usize,
        total: usize,
    },
    #[error("Action '{action}' on {device} was cancelled by the caller")]
    Cancelled { action: String, device: String },
}

/// An external tool could not be used.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionError {
    #[error("Required binary '{binary}' could not be found")]
    MissingBinary { binary: &'static str },
    #[error("Failed to execute '{binary}'")]
    CommandCouldNotExecute { binary: &'static str },
    #[error("Command '{binary}' failed: {explanation}")]
    CommandFailed {
        binary: &'static str,
        explanation: String,
    },
    #[error("Failed to parse output of '{binary}'")]
    ParseOutput { binary: &'static str },
}

/// User provided input was invalid.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum InvalidInputError {
    #[error("Failed to load configuration from '{path}'")]
    LoadConfig { path: String },
    #[error("Failed to parse configuration")]
    ParseConfig,
    #[error("Failed to load inventory snapshot from '{path}'")]
    LoadInventory { path: String },
    #[error("Failed to parse inventory snapshot")]
    ParseInventory,
    #[error("Failed to read '{path}'")]
    ReadRegistry { path: String },
    #[error("Failed to write '{path}'")]
    WriteRegistry { path: String },
}

#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum InternalError {
    #[error("Internal error: {0}")]
    Internal(&'static str),
    #[error("Device graph operation failed unexpectedly")]
    GraphInconsistency,
}

/// Each variant of `ErrorKind` corresponds to a different category of error.
#[derive(Debug, Eq, thiserror::Error, IntoStaticStr, PartialEq)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorKind {
    /// A structural graph operation was rejected.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Gathering facts about a device failed.
    #[error(transparent)]
    Probe(#[from] ProbeError),

    /// Structural rules were violated.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The commit plan could not be computed.
    #[error(transparent)]
    Planning(#[from] PlanningError),

    /// An action of the commit plan failed.
    #[error(transparent)]
    Action(#[from] ActionError),

    /// An external tool failed or was missing.
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// Configuration or inventory input was invalid.
    #[error(transparent)]
    InvalidInput(#[from] InvalidInputError),

    /// A bug was encountered.
    #[error(transparent)]
    Internal(#[from] InternalError),
}

#[derive(Debug)]
struct BlockgraphErrorInner {
    kind: ErrorKind,
    location: &'static Location<'static>,
    source: Option<anyhow::Error>,
    context: Vec<(Cow<'static, str>, &'static Location<'static>)>,
}

pub struct BlockgraphError(Box<BlockgraphErrorInner>);
impl BlockgraphError {
    #[track_caller]
    pub fn new(kind: impl Into<ErrorKind>) -> Self {
        BlockgraphError(Box::new(BlockgraphErrorInner {
            kind: kind.into(),
            location: Location::caller(),
            source: None,
            context: Vec::new(),
        }))
    }

    #[track_caller]
    pub fn with_source(kind: impl Into<ErrorKind>, source: anyhow::Error) -> Self {
        BlockgraphError(Box::new(BlockgraphErrorInner {
            kind: kind.into(),
            location: Location::caller(),
            source: Some(source),
            context: Vec::new(),
        }))
    }

    #[track_caller]
    pub fn internal(msg: &'static str) -> Self {
        Self::new(InternalError::Internal(msg))
    }

    pub fn unstructured(self, context: impl Into<Cow<'static, str>>) -> anyhow::Error {
        let mut error = match self.0.source {
            Some(source) => source.context(self.0.kind),
            None => anyhow::Error::from(self.0.kind),
        };
        for (message, _) in self.0.context {
            error = error.context(message);
        }
        error.context(context.into())
    }

    /// Returns a reference to the inner ErrorKind.
    pub fn kind(&self) -> &ErrorKind {
        &self.0.kind
    }
}

impl From<GraphError> for BlockgraphError {
    #[track_caller]
    fn from(value: GraphError) -> Self {
        BlockgraphError::new(value)
    }
}

impl From<PlanningError> for BlockgraphError {
    #[track_caller]
    fn from(value: PlanningError) -> Self {
        BlockgraphError::new(value)
    }
}

pub trait ReportError<T, K> {
    /// Convert this error into a structured BlockgraphError.
    fn structured(self, kind: K) -> Result<T, BlockgraphError>;
}

impl<T, K> ReportError<T, K> for Option<T>
where
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, BlockgraphError> {
        match self {
            Some(t) => Ok(t),
            None => Err(BlockgraphError::new(kind)),
        }
    }
}

impl<T, E, K> ReportError<T, K> for Result<T, E>
where
    E: Into<anyhow::Error>,
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, BlockgraphError> {
        match self {
            Ok(o) => Ok(o),
            Err(e) => Err(BlockgraphError::with_source(kind, e.into())),
        }
    }
}

pub trait BlockgraphResultExt<T> {
    /// Attach a context message to the error.
    fn message(self, context: impl Into<Cow<'static, str>>) -> Result<T, BlockgraphError>;

    /// Convert the error into an unstructured error.
    fn unstructured(self, context: impl Into<Cow<'static, str>>) -> Result<T, anyhow::Error>;
}

impl<T> BlockgraphResultExt<T> for Result<T, BlockgraphError> {
    #[track_caller]
    fn message(mut self, context: impl Into<Cow<'static, str>>) -> Result<T, BlockgraphError> {
        if let Err(ref mut e) = self {
            e.0.context.push((context.into(), Location::caller()));
        }
        self
    }

    fn unstructured(self, context: impl Into<Cow<'static, str>>) -> Result<T, anyhow::Error> {
        self.map_err(|e| e.unstructured(context))
    }
}

impl Serialize for BlockgraphError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("blockgraph-error", 5)?;
        state.serialize_field("message", &self.0.kind.to_string())?;
        match self.0.kind {
            ErrorKind::Graph(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Probe(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Validation(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Planning(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Action(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Execution(ref e) => state.serialize_field("error", e)?,
            ErrorKind::InvalidInput(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Internal(ref e) => state.serialize_field("error", e)?,
        }
        state.serialize_field("category", <&str>::from(&self.0.kind))?;
        state.serialize_field(
            "location",
            &format!("{}:{}", self.0.location.file(), self.0.location.line()),
        )?;
        match self.0.source {
            Some(ref e) => state.serialize_field("cause", &Some(format!("{:?}", e)))?,
            None => state.serialize_field("cause", &None::<String>)?,
        }
        state.end()
    }
}

impl Debug for BlockgraphError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} at {}:{}",
            self.0.kind,
            self.0.location.file(),
            self.0.location.line()
        )?;

        if !self.0.context.is_empty() {
            writeln!(f, "\n\nContext:")?;
            for (i, (context, location)) in self.0.context.iter().enumerate() {
                for (j, line) in context.split('\n').enumerate() {
                    if j == 0 {
                        write!(f, "{: >5}: ", i)?;
                    } else {
                        f.write_str("\n       ")?;
                    }
                    f.write_str(line)?;
                }
                writeln!(f, " at {}:{}", location.file(), location.line())?;
            }
        }

        if let Some(ref source) = self.0.source {
            writeln!(f, "\n\nCaused by:")?;
            let mut source: Option<&dyn std::error::Error> = Some(source.as_ref());
            let mut index = 0;
            while let Some(e) = source {
                for (i, line) in e.to_string().split('\n').enumerate() {
                    if i == 0 {
                        write!(f, "{: >5}: ", index)?;
                    } else {
                        f.write_str("\n       ")?;
                    }
                    f.write_str(line)?;
                }
                f.write_char('\n')?;
                source = e.source();
                index += 1;
            }
        }
        Ok(())
    }
}
