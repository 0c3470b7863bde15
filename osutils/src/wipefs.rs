use std::path::Path;

use anyhow::{Context, Error};

use crate::dependencies::{CommandRunner, Dependency};

pub fn all(runner: &dyn CommandRunner, device: impl AsRef<Path>) -> Result<(), Error> {
    runner
        .run_and_check(Dependency::Wipefs.cmd().arg("--all").arg(device.as_ref()))
        .with_context(|| format!("Failed to wipe device '{}'", device.as_ref().display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testutils::MockRunner;

    #[test]
    fn test_all() {
        let runner = MockRunner::new();
        runner.once("wipefs", 1, "");
        assert_eq!(
            all(&runner, "/dev/sdb1").unwrap_err().to_string(),
            "Failed to wipe device '/dev/sdb1'"
        );
        all(&runner, "/dev/sdb1").unwrap();
        assert_eq!(runner.commands_matching("wipefs --all /dev/sdb1").len(), 2);
    }
}
