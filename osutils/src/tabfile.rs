use std::{
    fmt::Display,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Error};

/// A representation of a fstab-like file: `/etc/fstab` or `/proc/mounts`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TabFile {
    pub entries: Vec<TabFileEntry>,
}

/// A representation of a single entry in a tab file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabFileEntry {
    pub device: TabDevice,
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub options: Vec<String>,
    pub dump: u32,
    pub pass: u32,
}

/// How an entry refers to its device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TabDevice {
    Path(PathBuf),
    Uuid(String),
    Label(String),
}

/// A representation of `/etc/crypttab`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CryptTab {
    pub entries: Vec<CryptTabEntry>,
}

/// A single line of `/etc/crypttab`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptTabEntry {
    /// Device-mapper name of the opened volume.
    pub name: String,
    pub device: TabDevice,
    /// Key file, `None` when the passphrase is asked for.
    pub key_file: Option<String>,
    pub options: Vec<String>,
}

impl TabDevice {
    pub fn parse(spec: &str) -> Self {
        if let Some(uuid) = spec.strip_prefix("UUID=") {
            Self::Uuid(uuid.to_owned())
        } else if let Some(label) = spec.strip_prefix("LABEL=") {
            Self::Label(label.to_owned())
        } else {
            Self::Path(PathBuf::from(spec))
        }
    }

    pub fn render(&self) -> String {
        match self {
            Self::Path(path) => escape(&path.to_string_lossy()),
            Self::Uuid(uuid) => format!("UUID={uuid}"),
            Self::Label(label) => format!("LABEL={}", escape(label)),
        }
    }
}

impl Display for TabDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

/// Splits non-comment lines into unescaped whitespace separated fields.
fn split_lines(contents: &str) -> impl Iterator<Item = (usize, Vec<String>)> + '_ {
    contents
        .lines()
        .enumerate()
        .map(|(index, line)| (index + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(number, line)| (number, line.split_whitespace().map(unescape).collect()))
}

/// Decodes the octal escapes (`\040` for a space) tab files use.
fn unescape(field: &str) -> String {
    let mut result = String::with_capacity(field.len());
    let mut rest = field;
    while let Some(pos) = rest.find('\\') {
        result.push_str(&rest[..pos]);
        let code = rest
            .get(pos + 1..pos + 4)
            .and_then(|digits| u8::from_str_radix(digits, 8).ok());
        match code {
            Some(code) => {
                result.push(code as char);
                rest = &rest[pos + 4..];
            }
            None => {
                result.push('\\');
                rest = &rest[pos + 1..];
            }
        }
    }
    result.push_str(rest);
    result
}

fn escape(field: &str) -> String {
    field
        .chars()
        .map(|c| match c {
            ' ' => "\\040".to_owned(),
            '\t' => "\\011".to_owned(),
            '\n' => "\\012".to_owned(),
            '\\' => "\\134".to_owned(),
            c => c.to_string(),
        })
        .collect()
}

fn split_options(field: Option<&String>) -> Vec<String> {
    match field.map(String::as_str) {
        None | Some("defaults") | Some("none") | Some("") => Vec::new(),
        Some(options) => options.split(',').map(str::to_owned).collect(),
    }
}

fn render_options(options: &[String]) -> String {
    if options.is_empty() {
        "defaults".into()
    } else {
        options.join(",")
    }
}

impl TabFile {
    pub fn parse(contents: &str) -> Result<Self, Error> {
        let entries = split_lines(contents)
            .map(|(number, fields)| {
                if fields.len() < 3 {
                    bail!("Line {number} has {} fields, expected at least 3", fields.len());
                }
                let parse_number = |index: usize| -> Result<u32, Error> {
                    fields.get(index).map_or(Ok(0), |field| {
                        field
                            .parse()
                            .with_context(|| format!("Invalid number '{field}' on line {number}"))
                    })
                };

                Ok(TabFileEntry {
                    device: TabDevice::parse(&fields[0]),
                    mount_point: PathBuf::from(&fields[1]),
                    fs_type: fields[2].clone(),
                    options: split_options(fields.get(3)),
                    dump: parse_number(4)?,
                    pass: parse_number(5)?,
                })
            })
            .collect::<Result<_, Error>>()?;

        Ok(Self { entries })
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read {}", path.as_ref().display()))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse {}", path.as_ref().display()))
    }

    /// Write this tab file to disk at location `tab_file_path`.
    pub fn write(&self, tab_file_path: impl AsRef<Path>) -> Result<(), Error> {
        std::fs::write(tab_file_path.as_ref(), self.render().as_bytes())
            .with_context(|| format!("Failed to write new {}", tab_file_path.as_ref().display()))
    }

    /// Render this tab file as a string.
    pub fn render(&self) -> String {
        self.entries.iter().map(|entry| entry.render()).collect()
    }
}

impl TabFileEntry {
    pub fn new(
        device: TabDevice,
        mount_point: impl Into<PathBuf>,
        fs_type: impl Into<String>,
    ) -> Self {
        Self {
            device,
            mount_point: mount_point.into(),
            fs_type: fs_type.into(),
            options: Vec::new(),
            dump: 0,
            pass: 0,
        }
    }

    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.options = options;
        self
    }

    /// Returns the value of a `key=value` option.
    pub fn option_value(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find_map(|option| option.strip_prefix(key)?.strip_prefix('='))
    }

    /// Render this entry as a single line.
    pub fn render(&self) -> String {
        format!(
            "{} {} {} {} {} {}\n",
            self.device.render(),
            escape(&self.mount_point.to_string_lossy()),
            self.fs_type,
            render_options(&self.options),
            self.dump,
            self.pass
        )
    }
}

impl CryptTab {
    pub fn parse(contents: &str) -> Result<Self, Error> {
        let entries = split_lines(contents)
            .map(|(number, fields)| {
                if fields.len() < 2 {
                    bail!("Line {number} has {} fields, expected at least 2", fields.len());
                }
                Ok(CryptTabEntry {
                    name: fields[0].clone(),
                    device: TabDevice::parse(&fields[1]),
                    key_file: fields
                        .get(2)
                        .filter(|key| !matches!(key.as_str(), "none" | "-"))
                        .cloned(),
                    options: split_options(fields.get(3)),
                })
            })
            .collect::<Result<_, Error>>()?;

        Ok(Self { entries })
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read {}", path.as_ref().display()))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse {}", path.as_ref().display()))
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        std::fs::write(path.as_ref(), self.render().as_bytes())
            .with_context(|| format!("Failed to write new {}", path.as_ref().display()))
    }

    pub fn render(&self) -> String {
        self.entries.iter().map(|entry| entry.render()).collect()
    }
}

impl CryptTabEntry {
    pub fn new(name: impl Into<String>, device: TabDevice) -> Self {
        Self {
            name: name.into(),
            device,
            key_file: None,
            options: Vec::new(),
        }
    }

    pub fn render(&self) -> String {
        let mut line = format!(
            "{} {} {}",
            self.name,
            self.device.render(),
            self.key_file.as_deref().unwrap_or("none")
        );
        if !self.options.is_empty() {
            line.push(' ');
            line.push_str(&self.options.join(","));
        }
        line.push('\n');
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use indoc::indoc;

    #[test]
    fn test_parse_fstab() {
        let contents = indoc! {r"
            # /etc/fstab
            UUID=0f6a1c3e-8b9d-4e2f-a1b3-c5d7e9f1a2b4 / btrfs defaults 0 0
            UUID=0f6a1c3e-8b9d-4e2f-a1b3-c5d7e9f1a2b4 /home btrfs subvol=/@/home,compress=zstd 0 0
            LABEL=EFI /boot/efi vfat umask=0077 0 2

            /dev/mapper/cr-swap none swap
            /dev/sdc1 /srv/my\040data ext4 defaults 0 2
        "};

        let tab = TabFile::parse(contents).unwrap();
        assert_eq!(tab.entries.len(), 5);
        assert_eq!(
            tab.entries[0].device,
            TabDevice::Uuid("0f6a1c3e-8b9d-4e2f-a1b3-c5d7e9f1a2b4".into())
        );
        assert!(tab.entries[0].options.is_empty());
        assert_eq!(tab.entries[1].option_value("subvol"), Some("/@/home"));
        assert_eq!(tab.entries[1].option_value("compress"), Some("zstd"));
        assert_eq!(tab.entries[2].device, TabDevice::Label("EFI".into()));
        assert_eq!(tab.entries[2].pass, 2);
        assert_eq!(tab.entries[3].fs_type, "swap");
        assert_eq!(tab.entries[3].dump, 0);
        assert_eq!(tab.entries[4].mount_point, PathBuf::from("/srv/my data"));

        assert_eq!(
            tab.entries[4].render(),
            "/dev/sdc1 /srv/my\\040data ext4 defaults 0 2\n"
        );
        assert_eq!(TabFile::parse(&tab.render()).unwrap(), tab);
    }

    #[test]
    fn test_parse_fstab_errors() {
        assert!(TabFile::parse("/dev/sda1 /\n").is_err());
        assert!(TabFile::parse("/dev/sda1 / ext4 defaults x 0\n").is_err());
    }

    #[test]
    fn test_crypttab() {
        let contents = indoc! {"
            cr_home UUID=c8f1f2a4-6e7d-4a8b-9d0e-1f2a3b4c5d6e none luks,discard
            cr_swap /dev/sda3 /etc/keys/swap.key
        "};

        let tab = CryptTab::parse(contents).unwrap();
        assert_eq!(tab.entries[0].name, "cr_home");
        assert_eq!(tab.entries[0].key_file, None);
        assert_eq!(tab.entries[0].options, vec!["luks", "discard"]);
        assert_eq!(
            tab.entries[1].device,
            TabDevice::Path("/dev/sda3".into())
        );
        assert_eq!(tab.entries[1].key_file.as_deref(), Some("/etc/keys/swap.key"));
        assert_eq!(tab.render(), contents);

        assert!(CryptTab::parse("cr_home\n").is_err());
    }

    #[test]
    fn test_read_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fstab");
        let mut tab = TabFile::default();
        tab.entries.push(
            TabFileEntry::new(TabDevice::Path("/dev/sda2".into()), "/", "ext4")
                .with_options(vec!["noatime".into()]),
        );
        tab.write(&path).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "/dev/sda2 / ext4 noatime 0 0\n"
        );
        assert_eq!(TabFile::read(&path).unwrap(), tab);
        assert!(TabFile::read(dir.path().join("missing")).is_err());
    }
}
