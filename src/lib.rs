use std::sync::Arc;

use log::{debug, info};

use blockgraph_api::{
    error::{BlockgraphError, BlockgraphResultExt, ValidationError},
    DeviceGraph,
};
use osutils::dependencies::{CommandRunner, SystemRunner};

pub mod activation;
pub mod capabilities;
pub mod cli;
pub mod config;
pub mod executor;
pub mod inventory;
mod logging;
pub mod mounts;
pub mod planner;
pub mod prober;
pub mod registry;

pub use logging::{background_log::BackgroundLog, multilog::MultiLogger};

use activation::{ActivationCallbacks, ActivationReport, ActivationSession};
use config::AgentConfig;
use executor::{CommitCallbacks, CommitReport, Executor};
use inventory::{LiveInventory, SystemInventory};
use mounts::{MountRegistry, SystemMounter};
use planner::CommitPlan;
use prober::{ProbeOutcome, Prober};

/// Version as provided by environment variables at build time
pub const BLOCKGRAPH_VERSION: &str = match option_env!("BLOCKGRAPH_VERSION") {
    Some(v) => v,
    None => env!("CARGO_PKG_VERSION"),
};

/// Entry point to the storage agent: probes the system into a device graph,
/// checks graphs, and commits a staged graph back to the system.
///
/// One instance is one session. Automatically generated LUKS names and
/// remembered passphrases live as long as the instance.
pub struct Blockgraph {
    config: AgentConfig,
    runner: Arc<dyn CommandRunner>,
    mounts: MountRegistry,
    session: ActivationSession,
}

impl Blockgraph {
    /// Creates a session that works on the live system.
    pub fn new(config: AgentConfig) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        let mounts = MountRegistry::new(SystemMounter::new(runner.clone(), &config.mount_dir));
        Self::with_runner(config, runner, mounts)
    }

    /// Creates a session that runs commands through `runner` and mounts
    /// through `mounts`.
    pub fn with_runner(
        config: AgentConfig,
        runner: Arc<dyn CommandRunner>,
        mounts: MountRegistry,
    ) -> Self {
        Self {
            session: ActivationSession::new(&config.activation),
            config,
            runner,
            mounts,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Returns an inventory that queries the live system.
    pub fn live_inventory(&self) -> LiveInventory {
        LiveInventory::new(
            self.runner.clone(),
            self.config.fstab(),
            self.config.crypttab(),
        )
    }

    /// Builds the probed graph from `inventory`.
    pub fn probe(
        &mut self,
        inventory: &dyn SystemInventory,
    ) -> Result<ProbeOutcome, BlockgraphError> {
        Prober::new(inventory, &self.mounts)
            .with_mode(self.config.probe.mode)
            .probe(self.session.names())
    }

    /// Builds the probed graph from the live system.
    pub fn probe_live(&mut self) -> Result<ProbeOutcome, BlockgraphError> {
        let inventory = self.live_inventory();
        self.probe(&inventory)
    }

    /// Evaluates all structural rules and fails with every violation found.
    pub fn check(graph: &DeviceGraph) -> Result<(), BlockgraphError> {
        let violations = graph.check_all();
        if violations.0.is_empty() {
            return Ok(());
        }
        Err(BlockgraphError::new(ValidationError::ValidationFailure {
            violations,
        }))
    }

    /// Computes the ordered actions that turn `probed` into `staged`.
    pub fn plan(
        probed: &DeviceGraph,
        staged: &DeviceGraph,
    ) -> Result<CommitPlan, BlockgraphError> {
        CommitPlan::new(probed, staged)
    }

    /// Checks `staged`, plans the change from `probed` and executes it.
    /// Facts learned while executing are written back to `staged`.
    pub fn commit(
        &mut self,
        probed: &DeviceGraph,
        staged: &mut DeviceGraph,
        callbacks: &mut dyn CommitCallbacks,
    ) -> Result<CommitReport, BlockgraphError> {
        Self::check(staged).message("Staged device graph is invalid")?;
        let plan = Self::plan(probed, staged)?;
        if plan.is_empty() {
            info!("Nothing to commit");
            return Ok(CommitReport::default());
        }
        debug!("Commit plan:\n{}", plan.describe());

        Executor::new(self.runner.as_ref(), &self.mounts, &self.config).execute(
            &plan,
            probed,
            staged,
            self.session.passphrases(),
            callbacks,
        )
    }

    /// Assembles RAID arrays and opens every inactive LUKS container found in
    /// `inventory`.
    pub fn activate(
        &mut self,
        inventory: &dyn SystemInventory,
        callbacks: &mut dyn ActivationCallbacks,
    ) -> Result<ActivationReport, BlockgraphError> {
        self.session.activate_raid(self.runner.as_ref())?;
        self.session
            .activate_luks(self.runner.as_ref(), inventory, callbacks)
    }

    /// Closes every open LUKS container and stops every RAID array.
    pub fn deactivate(&self, inventory: &dyn SystemInventory) -> Result<(), BlockgraphError> {
        self.session
            .deactivate_all(self.runner.as_ref(), inventory)
    }
}
