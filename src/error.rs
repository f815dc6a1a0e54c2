//! Error taxonomy for builds and key generation.
//!
//! Everything in this crate returns `anyhow::Result`. Failures that callers
//! need to tell apart are raised as a [`BuildError`] inside the `anyhow::Error`,
//! so they can be recovered with `err.downcast_ref::<BuildError>()`.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    /// A host tool needed by the selected toolchain is not in PATH.
    #[error("required tool '{tool}' not found (install: {package})")]
    MissingTool { tool: String, package: String },

    /// An architecture specific support file (EFI stub, boot loader) is absent.
    #[error("required support file for {arch} not found: {}", path.display())]
    MissingSupportFile { arch: String, path: PathBuf },

    /// A file expected in the signing key directory is absent.
    #[error("required key file not found: {}", path.display())]
    MissingKeyFile { path: PathBuf },

    /// An input file or directory supplied by the caller is absent.
    #[error("input not found: {}", path.display())]
    MissingInput { path: PathBuf },

    #[error("unsupported architecture '{0}' (supported: x86_64/amd64, aarch64/arm64)")]
    UnsupportedArch(String),

    /// An external tool ran and exited unsuccessfully.
    #[error("{context} ('{tool}' exit code {code}){}", format_output(output))]
    ToolFailed {
        tool: String,
        context: String,
        code: i32,
        output: String,
    },

    /// An external tool did not finish in time and was killed.
    #[error("'{tool}' did not finish within {}s and was killed", timeout.as_secs())]
    ToolTimeout { tool: String, timeout: Duration },

    #[error("build cancelled")]
    Cancelled,
}

impl BuildError {
    /// Precondition errors are raised before anything is written.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            BuildError::MissingTool { .. }
                | BuildError::MissingSupportFile { .. }
                | BuildError::MissingKeyFile { .. }
                | BuildError::MissingInput { .. }
                | BuildError::UnsupportedArch(_)
        )
    }
}

fn format_output(output: &str) -> String {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(":\n{}", trimmed)
    }
}

/// Find a [`BuildError`] anywhere in an error chain.
pub fn build_error(err: &anyhow::Error) -> Option<&BuildError> {
    err.chain().find_map(|cause| cause.downcast_ref::<BuildError>())
}
