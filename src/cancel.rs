//! Structured cancellation.
//!
//! A [`Cancellation`] token is handed to every stage. Stages call
//! [`Cancellation::checkpoint`] between units of work and [`crate::process::Cmd`]
//! polls it while a tool runs, so an interrupt unwinds through the normal error
//! path and the cleanup stack still runs.

use std::ffi::c_int;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::warn;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::error::BuildError;

static SIGNALLED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
    follow_signals: bool,
}

impl Cancellation {
    /// A token that is only cancelled explicitly.
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that is also cancelled by SIGINT/SIGTERM.
    ///
    /// Installs the process signal handlers; call once from `main`.
    pub fn from_signals() -> Self {
        if let Err(err) = install_signal_handlers() {
            warn!("[cancel] interrupts will not stop the build cleanly: {:#}", err);
        }
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            follow_signals: true,
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || (self.follow_signals && SIGNALLED.load(Ordering::SeqCst))
    }

    /// Return `BuildError::Cancelled` if the build should stop.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(BuildError::Cancelled.into());
        }
        Ok(())
    }
}

extern "C" fn on_signal(_signum: c_int) {
    SIGNALLED.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() -> Result<()> {
    let action = SigAction::new(SigHandler::Handler(on_signal), SaFlags::SA_RESTART, SigSet::empty());
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
        unsafe { sigaction(signal, &action) }
            .with_context(|| format!("installing {} handler", signal))?;
    }
    Ok(())
}
