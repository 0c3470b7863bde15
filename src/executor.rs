use anyhow::Error;
use log::{debug, info, warn};
use serde::Serialize;

use blockgraph_api::{
    error::{ActionError, BlockgraphError},
    primitives::secret::Secret,
    DeviceGraph,
};
use osutils::dependencies::CommandRunner;

use crate::{
    activation::PassphraseCache,
    capabilities::{ops_for, Cancelled, CommitContext},
    config::AgentConfig,
    mounts::MountRegistry,
    planner::{Action, ActionKind, CommitPlan},
    registry::{CrypttabRegistry, FstabRegistry},
};

/// Hooks the caller of a commit provides.
pub trait CommitCallbacks {
    /// Called before every action with its description.
    fn message(&mut self, _message: &str) {}

    /// Called when an action failed. Returning `true` continues with the next
    /// action.
    fn error(&mut self, _message: &str, _error: &BlockgraphError) -> bool {
        false
    }

    /// Asks for the passphrase of the encrypted volume with the given UUID.
    /// Returning `None` cancels the action.
    fn passphrase(&mut self, _uuid: &str, _attempt: u32) -> Option<Secret> {
        None
    }
}

/// Stops at the first error and never provides a passphrase.
#[derive(Debug, Default)]
pub struct DefaultCallbacks;

impl CommitCallbacks for DefaultCallbacks {}

/// Outcome of a commit that was not aborted.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct CommitReport {
    pub executed: Vec<String>,
    pub failed: Vec<String>,
    pub total: usize,
}

/// Runs commit plans against the system.
pub struct Executor<'a> {
    runner: &'a dyn CommandRunner,
    mounts: &'a MountRegistry,
    config: &'a AgentConfig,
}

impl<'a> Executor<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        mounts: &'a MountRegistry,
        config: &'a AgentConfig,
    ) -> Self {
        Self {
            runner,
            mounts,
            config,
        }
    }

    /// Executes the actions of `plan` in order. Facts learned on the way are
    /// written back to `staged`. The registries are written once at the end,
    /// also when an action failed. LUKS containers are opened with the
    /// passphrases in `passphrases` before the caller is asked.
    #[tracing::instrument(skip_all)]
    pub fn execute(
        &self,
        plan: &CommitPlan,
        probed: &DeviceGraph,
        staged: &mut DeviceGraph,
        passphrases: &mut PassphraseCache,
        callbacks: &mut dyn CommitCallbacks,
    ) -> Result<CommitReport, BlockgraphError> {
        let mut fstab = FstabRegistry::load(self.config.fstab())?;
        let mut crypttab = CrypttabRegistry::load(self.config.crypttab())?;
        let mut report = CommitReport {
            total: plan.len(),
            ..Default::default()
        };

        info!("Committing {} actions", plan.len());
        let result = self.run(
            plan,
            probed,
            staged,
            &mut fstab,
            &mut crypttab,
            passphrases,
            callbacks,
            &mut report,
        );
        let flushed = fstab.flush().and_then(|()| crypttab.flush());

        match (result, flushed) {
            (Err(e), flushed) => {
                if let Err(flush_error) = flushed {
                    warn!("Failed to write registries after failed commit: {flush_error:?}");
                }
                Err(e)
            }
            (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => {
                info!(
                    "Commit finished, {} of {} actions executed",
                    report.executed.len(),
                    report.total
                );
                Ok(report)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run(
        &self,
        plan: &CommitPlan,
        probed: &DeviceGraph,
        staged: &mut DeviceGraph,
        fstab: &mut FstabRegistry,
        crypttab: &mut CrypttabRegistry,
        passphrases: &mut PassphraseCache,
        callbacks: &mut dyn CommitCallbacks,
        report: &mut CommitReport,
    ) -> Result<(), BlockgraphError> {
        for action in plan.iter() {
            callbacks.message(&action.to_string());
            debug!("Executing '{action}'");

            let outcome = {
                let mut ctx = CommitContext {
                    probed,
                    staged: &mut *staged,
                    runner: self.runner,
                    mounts: self.mounts,
                    fstab: &mut *fstab,
                    crypttab: &mut *crypttab,
                    root_prefix: &self.config.root_prefix,
                    max_attempts: self.config.activation.max_attempts,
                    passphrases: &mut *passphrases,
                    callbacks: &mut *callbacks,
                };
                dispatch(&mut ctx, action)
            };

            let Err(e) = outcome else {
                report.executed.push(action.to_string());
                continue;
            };

            let error = action_error(action, e, report);
            report.failed.push(action.to_string());
            if callbacks.error(&format!("Action '{action}' failed"), &error) {
                warn!("Continuing after failed action '{action}'");
                continue;
            }
            return Err(error);
        }
        Ok(())
    }
}

fn dispatch(ctx: &mut CommitContext, action: &Action) -> Result<(), Error> {
    let ops = ops_for(action.device_kind);
    let sid = action.sid;
    match action.kind {
        ActionKind::Unmount => ops.unmount(ctx, sid),
        ActionKind::RemoveFromRegistry => ops.remove_from_registry(ctx, sid),
        ActionKind::Deactivate => ops.deactivate(ctx, sid),
        ActionKind::DetachMember { member } => ops.detach_member(ctx, sid, member),
        ActionKind::Shrink { size } => ops.resize(ctx, sid, size, false),
        ActionKind::Delete => ops.delete(ctx, sid),
        ActionKind::Create => ops.create(ctx, sid),
        ActionKind::AttachMember { member } => ops.attach_member(ctx, sid, member),
        ActionKind::Grow { size } => ops.resize(ctx, sid, size, true),
        ActionKind::Modify => ops.modify(ctx, sid),
        ActionKind::Activate => ops.activate(ctx, sid),
        ActionKind::Mount => ops.mount(ctx, sid),
        ActionKind::AddToRegistry => ops.add_to_registry(ctx, sid),
        ActionKind::RenameInRegistry => ops.rename_in_registry(ctx, sid),
    }
}

fn action_error(action: &Action, source: Error, report: &CommitReport) -> BlockgraphError {
    let kind = if source.downcast_ref::<Cancelled>().is_some() {
        ActionError::Cancelled {
            action: action.kind.name().into(),
            device: action.device.clone(),
        }
    } else {
        ActionError::ActionFailure {
            action: action.kind.name().into(),
            device: action.device.clone(),
            executed: report.executed.len(),
            total: report.total,
        }
    };
    BlockgraphError::with_source(kind, source)
}
