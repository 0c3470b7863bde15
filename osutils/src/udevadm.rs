use anyhow::{Context, Error};

use crate::dependencies::{CommandRunner, Dependency};

pub fn settle(runner: &dyn CommandRunner) -> Result<(), Error> {
    runner
        .run_and_check(Dependency::Udevadm.cmd().arg("settle"))
        .context("Failed settle udev setup")
}
