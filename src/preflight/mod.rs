//! Preflight checks for build validation.
//!
//! Everything a build needs from the host or the caller is checked here,
//! before the first byte is written: host tools, the signing key directory,
//! the rootfs and the architecture support files.
//!
//! # Example
//!
//! ```rust,ignore
//! use enki::preflight::check_required_tools;
//!
//! let tools = &[("xorriso", "xorriso"), ("mcopy", "mtools")];
//! check_required_tools(tools)?;
//! ```

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::error::BuildError;
use crate::process;

/// Files that must be present in the key directory for `build-uki`.
pub const REQUIRED_KEY_FILES: &[&str] = &[
    "PK.der",
    "PK.auth",
    "KEK.der",
    "KEK.auth",
    "db.der",
    "db.auth",
    "db.key",
    "db.pem",
    "tpm2-pcr-private.pem",
];

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    process::exists(cmd)
}

/// Check that specific tools are available.
///
/// Each tuple is (command, package). Returns the first missing tool as
/// [`BuildError::MissingTool`].
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if let Some((tool, package)) = missing.first() {
        if missing.len() > 1 {
            for (t, p) in &missing[1..] {
                log::error!("also missing: {} (install: {})", t, p);
            }
        }
        return Err(BuildError::MissingTool {
            tool: tool.to_string(),
            package: package.to_string(),
        }
        .into());
    }

    Ok(())
}

/// Every key file `build-uki` consumes must be present in `keys_dir`.
pub fn check_key_dir(keys_dir: &Path) -> Result<()> {
    if !keys_dir.is_dir() {
        return Err(BuildError::MissingInput {
            path: keys_dir.to_path_buf(),
        }
        .into());
    }
    for name in REQUIRED_KEY_FILES {
        let path = keys_dir.join(name);
        if !path.is_file() {
            return Err(BuildError::MissingKeyFile { path }.into());
        }
    }
    Ok(())
}

/// `path` must exist (file or directory).
pub fn check_input(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(BuildError::MissingInput {
            path: PathBuf::from(path),
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::build_error;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_command_exists() {
        // 'ls' should exist on any Unix system
        assert!(command_exists("ls"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_check_required_tools_success() {
        let tools = &[("ls", "coreutils"), ("cat", "coreutils")];
        assert!(check_required_tools(tools).is_ok());
    }

    #[test]
    fn test_check_required_tools_failure() {
        let tools = &[("ls", "coreutils"), ("nonexistent_command_xyz", "fake-package")];
        let err = check_required_tools(tools).unwrap_err();
        match build_error(&err) {
            Some(BuildError::MissingTool { tool, package }) => {
                assert_eq!(tool, "nonexistent_command_xyz");
                assert_eq!(package, "fake-package");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_check_key_dir() {
        let temp = TempDir::new().unwrap();
        for name in REQUIRED_KEY_FILES {
            fs::write(temp.path().join(name), b"x").unwrap();
        }
        check_key_dir(temp.path()).unwrap();

        fs::remove_file(temp.path().join("tpm2-pcr-private.pem")).unwrap();
        let err = check_key_dir(temp.path()).unwrap_err();
        assert!(matches!(
            build_error(&err),
            Some(BuildError::MissingKeyFile { path }) if path.ends_with("tpm2-pcr-private.pem")
        ));
    }

    #[test]
    fn test_check_key_dir_missing_dir() {
        let err = check_key_dir(Path::new("/nonexistent/keys")).unwrap_err();
        assert!(matches!(
            build_error(&err),
            Some(BuildError::MissingInput { .. })
        ));
    }
}
