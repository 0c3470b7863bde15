use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use blockgraph_api::{
    constants::{
        AGENT_CONFIG_PATH, DEFAULT_MAX_PASSPHRASE_ATTEMPTS, DEFAULT_MOUNT_DIR, ETC_CRYPTTAB_PATH,
        ETC_FSTAB_PATH, ROOT_MOUNT_POINT_PATH,
    },
    error::{BlockgraphError, InvalidInputError, ReportError},
};

use crate::{activation::PassphrasePolicy, prober::ProbeMode};

/// Definition of the agent's configuration file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct AgentConfig {
    /// Persistent mount registry, relative to `root_prefix`.
    pub fstab_path: PathBuf,

    /// Persistent encryption registry, relative to `root_prefix`.
    pub crypttab_path: PathBuf,

    /// Directory temporary mounts are created in.
    pub mount_dir: PathBuf,

    /// Root of the system being configured. Mount points and registries are
    /// resolved below it.
    pub root_prefix: PathBuf,

    pub probe: ProbeConfig,

    pub activation: ActivationConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            fstab_path: ETC_FSTAB_PATH.into(),
            crypttab_path: ETC_CRYPTTAB_PATH.into(),
            mount_dir: DEFAULT_MOUNT_DIR.into(),
            root_prefix: ROOT_MOUNT_POINT_PATH.into(),
            probe: ProbeConfig::default(),
            activation: ActivationConfig::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct ProbeConfig {
    /// Whether a device that cannot be probed aborts the probe.
    pub mode: ProbeMode,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct ActivationConfig {
    /// How often to ask for the passphrase of one LUKS container.
    pub max_attempts: u32,

    /// Whether passphrases are kept for later activations in the same
    /// session.
    pub passphrase_policy: PassphrasePolicy,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_PASSPHRASE_ATTEMPTS,
            passphrase_policy: PassphrasePolicy::default(),
        }
    }
}

impl AgentConfig {
    /// Loads the configuration from `path`, or from the default location when
    /// no path is given. A missing file at the default location yields the
    /// default configuration.
    pub fn load(path: Option<&Path>) -> Result<Self, BlockgraphError> {
        let (path, explicit) = match path {
            Some(path) => (path, true),
            None => (Path::new(AGENT_CONFIG_PATH), false),
        };

        if !explicit && !path.exists() {
            debug!("No configuration at '{}', using defaults", path.display());
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path).structured(InvalidInputError::LoadConfig {
            path: path.display().to_string(),
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, BlockgraphError> {
        serde_yaml::from_str(contents).structured(InvalidInputError::ParseConfig)
    }

    /// Path of the mount registry below the root prefix.
    pub fn fstab(&self) -> PathBuf {
        join_relative(&self.root_prefix, &self.fstab_path)
    }

    /// Path of the encryption registry below the root prefix.
    pub fn crypttab(&self) -> PathBuf {
        join_relative(&self.root_prefix, &self.crypttab_path)
    }
}

/// Joins `path` below `root`, even when `path` is absolute.
pub fn join_relative(root: impl AsRef<Path>, path: impl AsRef<Path>) -> PathBuf {
    let relative = path
        .as_ref()
        .strip_prefix(ROOT_MOUNT_POINT_PATH)
        .unwrap_or(path.as_ref());
    root.as_ref().join(relative)
}
