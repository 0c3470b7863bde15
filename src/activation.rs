//! Activation of storage that has to be online before it can be probed:
//! RAID arrays are assembled and LUKS containers opened, asking the caller
//! for passphrases.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use blockgraph_api::{
    constants::AUTO_CRYPT_NAME_PREFIX,
    error::{ActionError, BlockgraphError, ProbeError, ReportError},
    primitives::secret::Secret,
};
use osutils::{cryptsetup, dependencies::CommandRunner, dmsetup, mdadm, udevadm};

use crate::{
    config::ActivationConfig,
    inventory::{BlockKind, SystemInventory},
};

/// Hands out device-mapper names for LUKS containers that have none.
///
/// One sequence lives for one session. Names already in use are never handed
/// out.
#[derive(Debug, Clone, Default)]
pub struct NameSequence {
    last: u32,
    in_use: BTreeSet<String>,
}

impl NameSequence {
    pub fn new<S: Into<String>>(in_use: impl IntoIterator<Item = S>) -> Self {
        Self {
            last: 0,
            in_use: in_use.into_iter().map(Into::into).collect(),
        }
    }

    pub fn reserve(&mut self, name: &str) {
        self.in_use.insert(name.into());
    }

    /// Returns the next free `cr-auto-<N>` name.
    pub fn next_name(&mut self) -> String {
        loop {
            self.last += 1;
            let name = format!("{AUTO_CRYPT_NAME_PREFIX}{}", self.last);
            if self.in_use.insert(name.clone()) {
                return name;
            }
        }
    }
}

/// Whether a passphrase that opened a container is kept for the session.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PassphrasePolicy {
    /// Ask again on every activation run.
    #[default]
    Forget,
    /// Try the passphrase that worked last time before asking.
    RememberForSession,
}

/// Passphrases that opened a container, by LUKS UUID. Shared between
/// activation and commit within one session.
#[derive(Debug, Default)]
pub struct PassphraseCache {
    policy: PassphrasePolicy,
    remembered: BTreeMap<String, Secret>,
}

impl PassphraseCache {
    pub fn new(policy: PassphrasePolicy) -> Self {
        Self {
            policy,
            remembered: BTreeMap::new(),
        }
    }

    pub fn get(&self, uuid: &str) -> Option<&Secret> {
        self.remembered.get(uuid)
    }

    /// Records a passphrase that was accepted. Kept only under
    /// [`PassphrasePolicy::RememberForSession`].
    pub fn accepted(&mut self, uuid: &str, secret: Secret) {
        if self.policy == PassphrasePolicy::RememberForSession {
            self.remembered.insert(uuid.into(), secret);
        }
    }

    pub fn forget(&mut self, uuid: &str) {
        self.remembered.remove(uuid);
    }
}

/// Caller hooks used during activation.
pub trait ActivationCallbacks {
    fn message(&mut self, _message: &str) {}

    /// Asks for the passphrase of the LUKS container with `uuid`. `attempt`
    /// starts at 1. Returning `None` cancels the activation of this container.
    fn passphrase(&mut self, uuid: &str, attempt: u32) -> Option<Secret>;
}

#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct ActivationReport {
    /// Device-mapper names of the opened containers.
    pub activated: Vec<String>,
    /// Underlying devices whose activation the caller cancelled.
    pub cancelled: Vec<String>,
    /// Underlying devices that could not be opened.
    pub failed: Vec<String>,
}

/// State kept across activation runs of one session.
#[derive(Debug)]
pub struct ActivationSession {
    max_attempts: u32,
    names: NameSequence,
    passphrases: PassphraseCache,
}

impl ActivationSession {
    pub fn new(config: &ActivationConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            names: NameSequence::default(),
            passphrases: PassphraseCache::new(config.passphrase_policy),
        }
    }

    pub fn names(&mut self) -> &mut NameSequence {
        &mut self.names
    }

    pub fn passphrases(&mut self) -> &mut PassphraseCache {
        &mut self.passphrases
    }

    /// Assembles every RAID array found on the system.
    pub fn activate_raid(&self, runner: &dyn CommandRunner) -> Result<(), BlockgraphError> {
        info!("Assembling RAID arrays");
        mdadm::assemble_scan(runner).structured(ActionError::ActionFailure {
            action: "activate".into(),
            device: "RAID arrays".into(),
            executed: 0,
            total: 1,
        })
    }

    /// Opens every inactive LUKS container. A container whose activation is
    /// cancelled or fails does not affect the others.
    pub fn activate_luks(
        &mut self,
        runner: &dyn CommandRunner,
        inventory: &dyn SystemInventory,
        callbacks: &mut dyn ActivationCallbacks,
    ) -> Result<ActivationReport, BlockgraphError> {
        let devices = inventory
            .block_devices()
            .structured(ProbeError::Inventory("block devices".into()))?;
        let targets = dmsetup::list_crypt_targets(runner)
            .structured(ProbeError::Inventory("device-mapper targets".into()))?;
        for name in &targets {
            self.names.reserve(name);
        }
        for entry in inventory
            .crypttab()
            .structured(ProbeError::Inventory("crypttab".into()))?
        {
            self.names.reserve(&entry.name);
        }

        let mut report = ActivationReport::default();
        for facts in devices.iter().filter(|facts| facts.is_luks()) {
            let open = devices.iter().any(|child| {
                child.kind == BlockKind::Crypt && child.parents.iter().any(|p| *p == facts.name)
            });
            if open {
                debug!("LUKS container on '{}' is already active", facts.name);
                continue;
            }

            let uuid = match inventory.luks_uuid(&facts.name) {
                Ok(uuid) => uuid,
                Err(e) => {
                    warn!("Cannot activate '{}': {e:#}", facts.name);
                    report.failed.push(facts.name.clone());
                    continue;
                }
            };
            let dm_name = match inventory.crypttab_for_device(&facts.name) {
                Ok(Some(entry)) => entry.name,
                _ => self.names.next_name(),
            };

            callbacks.message(&format!(
                "Activating LUKS container on '{}' as '{dm_name}'",
                facts.name
            ));
            match self.open(runner, &facts.name, &dm_name, &uuid, callbacks) {
                Ok(true) => {
                    info!("Activated '{}' as '{dm_name}'", facts.name);
                    report.activated.push(dm_name);
                }
                Ok(false) => report.cancelled.push(facts.name.clone()),
                Err(e) => {
                    warn!("Failed to activate '{}': {e:#}", facts.name);
                    report.failed.push(facts.name.clone());
                }
            }
        }

        if !report.activated.is_empty() {
            udevadm::settle(runner).structured(ActionError::ActionFailure {
                action: "settle".into(),
                device: "udev".into(),
                executed: report.activated.len(),
                total: report.activated.len(),
            })?;
        }
        Ok(report)
    }

    /// Runs the passphrase loop for one container. Returns `Ok(false)` when the
    /// caller cancelled.
    fn open(
        &mut self,
        runner: &dyn CommandRunner,
        device: &str,
        dm_name: &str,
        uuid: &str,
        callbacks: &mut dyn ActivationCallbacks,
    ) -> Result<bool, anyhow::Error> {
        if let Some(secret) = self.passphrases.get(uuid) {
            if cryptsetup::open(runner, device, dm_name, secret)? {
                return Ok(true);
            }
            self.passphrases.forget(uuid);
        }

        for attempt in 1..=self.max_attempts {
            let Some(secret) = callbacks.passphrase(uuid, attempt) else {
                debug!("Activation of '{device}' cancelled");
                return Ok(false);
            };

            if cryptsetup::open(runner, device, dm_name, &secret)? {
                self.passphrases.accepted(uuid, secret);
                return Ok(true);
            }
            warn!(
                "Wrong passphrase for '{device}' (attempt {attempt} of {})",
                self.max_attempts
            );
        }

        anyhow::bail!("No valid passphrase after {} attempts", self.max_attempts)
    }

    /// Closes every open LUKS container and stops every RAID array.
    pub fn deactivate_all(
        &self,
        runner: &dyn CommandRunner,
        inventory: &dyn SystemInventory,
    ) -> Result<(), BlockgraphError> {
        let targets = dmsetup::list_crypt_targets(runner)
            .structured(ProbeError::Inventory("device-mapper targets".into()))?;
        let arrays = inventory
            .block_devices()
            .structured(ProbeError::Inventory("block devices".into()))?
            .iter()
            .filter(|facts| facts.kind == BlockKind::Raid)
            .map(|facts| facts.name.clone())
            .collect::<Vec<_>>();

        let total = targets.len() + arrays.len();
        let mut executed = 0;
        for name in &targets {
            info!("Closing LUKS volume '{name}'");
            cryptsetup::close(runner, name).structured(ActionError::ActionFailure {
                action: "deactivate".into(),
                device: name.clone(),
                executed,
                total,
            })?;
            executed += 1;
        }
        for name in &arrays {
            info!("Stopping RAID array '{name}'");
            mdadm::stop(runner, name).structured(ActionError::ActionFailure {
                action: "deactivate".into(),
                device: name.clone(),
                executed,
                total,
            })?;
            executed += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;

    use indoc::indoc;
    use osutils::testutils::MockRunner;

    use crate::inventory::StaticInventory;

    const TWO_CONTAINERS: &str = indoc! {r#"
        block-devices:
          - {name: /dev/vda, kind: disk, size: 8G}
          - name: /dev/vda1
            kind: partition
            parents: [/dev/vda]
            start: 1M
            number: 1
            size: 1G
            fs-type: crypto_LUKS
            uuid: aaaaaaaa-0000-4000-8000-000000000001
          - name: /dev/vda2
            kind: partition
            parents: [/dev/vda]
            start: 1025M
            number: 2
            size: 1G
            fs-type: crypto_LUKS
            uuid: aaaaaaaa-0000-4000-8000-000000000002
          - name: /dev/vda3
            kind: partition
            parents: [/dev/vda]
            start: 2049M
            number: 3
            size: 1G
            fs-type: crypto_LUKS
            uuid: aaaaaaaa-0000-4000-8000-000000000003
          - {name: /dev/mapper/open, kind: crypt, parents: [/dev/vda3], size: 1008M}
        crypttab:
          - {name: cr_home, device: /dev/vda2}
    "#};

    /// Answers passphrase requests from a script.
    #[derive(Default)]
    struct Script {
        answers: VecDeque<Option<&'static str>>,
        asked: Vec<(String, u32)>,
        messages: Vec<String>,
    }

    impl ActivationCallbacks for Script {
        fn message(&mut self, message: &str) {
            self.messages.push(message.into());
        }

        fn passphrase(&mut self, uuid: &str, attempt: u32) -> Option<Secret> {
            self.asked.push((uuid.into(), attempt));
            self.answers.pop_front().flatten().map(Secret::from)
        }
    }

    fn script(answers: &[Option<&'static str>]) -> Script {
        Script {
            answers: answers.iter().copied().collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_name_sequence() {
        let mut names = NameSequence::new(["cr-auto-1", "cr-auto-3"]);
        assert_eq!(names.next_name(), "cr-auto-2");
        names.reserve("cr-auto-4");
        assert_eq!(names.next_name(), "cr-auto-5");
        assert_eq!(NameSequence::default().next_name(), "cr-auto-1");
    }

    #[test]
    fn test_activate_luks() {
        let runner = MockRunner::new();
        runner
            .on("dmsetup", 0, "open\t(254:0)\ncr-auto-1\t(254:1)\n")
            .once("cryptsetup luksOpen --key-file - /dev/vda1", 2, "");
        let inventory = StaticInventory::from_yaml(TWO_CONTAINERS).unwrap();
        let mut session = ActivationSession::new(&ActivationConfig::default());
        let mut callbacks = script(&[Some("wrong"), Some("right"), Some("home")]);

        let report = session
            .activate_luks(&runner, &inventory, &mut callbacks)
            .unwrap();
        assert_eq!(report.activated, vec!["cr-auto-2", "cr_home"]);
        assert!(report.cancelled.is_empty() && report.failed.is_empty());
        assert_eq!(
            callbacks.asked,
            vec![
                ("aaaaaaaa-0000-4000-8000-000000000001".into(), 1),
                ("aaaaaaaa-0000-4000-8000-000000000001".into(), 2),
                ("aaaaaaaa-0000-4000-8000-000000000002".into(), 1),
            ]
        );
        assert_eq!(callbacks.messages.len(), 2);

        let opens = runner
            .calls()
            .into_iter()
            .filter(|call| call.command.starts_with("cryptsetup luksOpen"))
            .collect::<Vec<_>>();
        assert_eq!(opens.len(), 3);
        assert_eq!(
            opens[1].command,
            "cryptsetup luksOpen --key-file - /dev/vda1 cr-auto-2"
        );
        assert_eq!(opens[1].stdin.as_deref(), Some("right"));
        assert_eq!(
            opens[2].command,
            "cryptsetup luksOpen --key-file - /dev/vda2 cr_home"
        );
        assert_eq!(runner.commands_matching("udevadm settle").len(), 1);
    }

    #[test]
    fn test_cancel_and_exhaust() {
        let runner = MockRunner::new();
        runner.on("cryptsetup luksOpen --key-file - /dev/vda1", 2, "");
        let inventory = StaticInventory::from_yaml(TWO_CONTAINERS).unwrap();
        let mut session = ActivationSession::new(&ActivationConfig {
            max_attempts: 2,
            ..Default::default()
        });
        let mut callbacks = script(&[Some("a"), Some("b"), None]);

        let report = session
            .activate_luks(&runner, &inventory, &mut callbacks)
            .unwrap();
        assert_eq!(report.failed, vec!["/dev/vda1"]);
        assert_eq!(report.cancelled, vec!["/dev/vda2"]);
        assert!(report.activated.is_empty());
        assert!(runner.commands_matching("udevadm").is_empty());
    }

    fn activate_twice(policy: PassphrasePolicy) -> (Script, MockRunner) {
        let runner = MockRunner::new();
        let inventory = StaticInventory::from_yaml(indoc! {r#"
            block-devices:
              - name: /dev/vdb
                kind: disk
                size: 1G
                fs-type: crypto_LUKS
                uuid: bbbbbbbb-0000-4000-8000-000000000001
        "#})
        .unwrap();
        let mut session = ActivationSession::new(&ActivationConfig {
            passphrase_policy: policy,
            ..Default::default()
        });
        let mut callbacks = script(&[Some("secret"), Some("secret")]);

        for _ in 0..2 {
            let report = session
                .activate_luks(&runner, &inventory, &mut callbacks)
                .unwrap();
            assert_eq!(report.activated.len(), 1);
        }
        (callbacks, runner)
    }

    #[test]
    fn test_forget_policy_asks_every_time() {
        let (callbacks, _) = activate_twice(PassphrasePolicy::Forget);
        assert_eq!(callbacks.asked.len(), 2);
    }

    #[test]
    fn test_remember_policy_reuses_passphrase() {
        let (callbacks, runner) = activate_twice(PassphrasePolicy::RememberForSession);
        assert_eq!(callbacks.asked.len(), 1);

        let opens = runner.calls();
        let opens = opens
            .iter()
            .filter(|call| call.command.starts_with("cryptsetup luksOpen"))
            .collect::<Vec<_>>();
        assert_eq!(opens.len(), 2);
        assert_eq!(opens[1].stdin.as_deref(), Some("secret"));
    }

    #[test]
    fn test_deactivate_all() {
        let runner = MockRunner::new();
        runner.on("dmsetup", 0, "cr_home\t(254:0)\n");
        let inventory = StaticInventory::from_yaml(indoc! {r#"
            block-devices:
              - {name: /dev/sdb, kind: disk, size: 4G}
              - {name: /dev/sdc, kind: disk, size: 4G}
              - {name: /dev/md0, kind: raid, parents: [/dev/sdb, /dev/sdc], size: 4G}
        "#})
        .unwrap();
        let session = ActivationSession::new(&ActivationConfig::default());

        session.deactivate_all(&runner, &inventory).unwrap();
        assert_eq!(
            runner.commands(),
            vec![
                "dmsetup ls --target crypt",
                "cryptsetup close cr_home",
                "mdadm --stop /dev/md0",
            ]
        );
    }
}
