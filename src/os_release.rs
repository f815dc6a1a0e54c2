//! os-release parsing.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

/// Key carrying the release shown in boot entries and artifact names.
pub const RELEASE_KEY: &str = "KAIROS_RELEASE";

/// Path of os-release relative to a rootfs.
pub const OS_RELEASE_PATH: &str = "etc/os-release";

/// Every double-quoted value assigned to `key` in os-release formatted `content`.
///
/// Only `KEY="value"` lines starting at column zero count.
pub fn quoted_values<'a>(content: &'a str, key: &str) -> Vec<&'a str> {
    content
        .lines()
        .filter_map(|line| {
            let rest = line.strip_prefix(key)?.strip_prefix("=\"")?;
            rest.strip_suffix('"')
        })
        .collect()
}

/// Read the release version from `<rootfs>/etc/os-release`.
///
/// Exactly one `KAIROS_RELEASE="..."` line must be present.
pub fn find_release(rootfs: &Path) -> Result<String> {
    let path = rootfs.join(OS_RELEASE_PATH);
    let content = fs::read_to_string(&path)
        .with_context(|| format!("reading os-release file {}", path.display()))?;

    match quoted_values(&content, RELEASE_KEY).as_slice() {
        [v] if !v.is_empty() => Ok(v.to_string()),
        [_] => bail!("{} is empty in {}", RELEASE_KEY, path.display()),
        found => bail!(
            "expected one {}=\"...\" line in {}, found {}",
            RELEASE_KEY,
            path.display(),
            found.len()
        ),
    }
}
