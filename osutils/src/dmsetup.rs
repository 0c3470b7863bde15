use anyhow::{Context, Error};

use crate::dependencies::{CommandRunner, Dependency};

/// Output dmsetup prints when no target matches.
const NO_DEVICES: &str = "No devices found";

/// Lists the names of all device-mapper targets of type `crypt`.
pub fn list_crypt_targets(runner: &dyn CommandRunner) -> Result<Vec<String>, Error> {
    let output = runner
        .output_and_check(
            Dependency::Dmsetup
                .cmd()
                .arg("ls")
                .arg("--target")
                .arg("crypt"),
        )
        .context("Failed to list device-mapper crypt targets")?;

    Ok(parse_ls(&output))
}

fn parse_ls(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && *line != NO_DEVICES)
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testutils::MockRunner;

    #[test]
    fn test_parse_ls() {
        assert_eq!(
            parse_ls("cr-auto-1\t(253:0)\ncr_home\t(253:1)\n"),
            vec!["cr-auto-1", "cr_home"]
        );
        assert!(parse_ls("No devices found\n").is_empty());
    }

    #[test]
    fn test_list_crypt_targets() {
        let runner = MockRunner::new();
        runner.on("dmsetup ls", 0, "cr-auto-2\t(253:0)\n");
        assert_eq!(list_crypt_targets(&runner).unwrap(), vec!["cr-auto-2"]);
        assert_eq!(runner.commands(), vec!["dmsetup ls --target crypt"]);
    }
}
