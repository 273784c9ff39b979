use std::path::{Path, PathBuf};

use anyhow::{Context, Error};

/// One line of a `/proc/mounts`-formatted table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: PathBuf,
    pub fstype: String,
    pub options: String,
}

/// The kernel mount table, in the order the kernel reports it (oldest first).
#[derive(Debug, Default, Clone)]
pub struct MountTable {
    entries: Vec<MountEntry>,
}

impl MountTable {
    pub fn read(path: impl AsRef<Path>) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path.as_ref()).context(format!(
            "Failed to read mount table '{}'",
            path.as_ref().display()
        ))?;
        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        let entries = content
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                Some(MountEntry {
                    source: unescape(fields.next()?),
                    target: PathBuf::from(unescape(fields.next()?)),
                    fstype: fields.next()?.to_string(),
                    options: fields.next().unwrap_or_default().to_string(),
                })
            })
            .collect();
        Self { entries }
    }

    /// The entry currently visible at `target`. When several mounts are stacked on the same
    /// directory the last one wins.
    pub fn find(&self, target: impl AsRef<Path>) -> Option<&MountEntry> {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.target == target.as_ref())
    }

    pub fn is_mounted(&self, target: impl AsRef<Path>) -> bool {
        self.find(target).is_some()
    }

    /// Mounts at or below `target`, innermost first.
    pub fn submounts(&self, target: impl AsRef<Path>) -> Vec<&MountEntry> {
        let mut mounts = self
            .entries
            .iter()
            .filter(|entry| entry.target.starts_with(target.as_ref()))
            .collect::<Vec<_>>();
        mounts.reverse();
        mounts
    }
}

/// Undoes the octal escaping the kernel applies to spaces, tabs, newlines and backslashes.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && is_octal_escape(&bytes[i + 1..i + 4]) {
            let value = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, digit| acc * 8 + u32::from(digit - b'0'));
            out.push(value as u8);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn is_octal_escape(digits: &[u8]) -> bool {
    digits.len() == 3
        && digits.iter().all(|d| (b'0'..=b'7').contains(d))
        && digits[0] <= b'3'
}
