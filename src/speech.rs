//! Speech output service
//!
//! Turns question text into audible speech and reports completion. Some
//! platforms never deliver a reliable end-of-utterance event, so completion
//! is decided by a watchdog: a short-interval poll of the synthesizer's
//! "currently speaking" flag raced against a hard ceiling. Whichever fires
//! first posts the single `SpeechFinished` event; the loser is cancelled
//! with it.

use crate::error::{Result, SessionError};
use crate::events::SessionEvent;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Capability interface over a platform speech synthesizer.
///
/// Implementations must ensure only one utterance is audible at a time:
/// `begin` cancels any prior utterance before starting the new one.
pub trait SpeechSynthesizer: Send + Sync {
    /// Start speaking `text`, cancelling any prior utterance first.
    fn begin(&self, text: &str) -> Result<()>;
    /// Stop the current utterance if one is audible. Idempotent.
    fn cancel(&self);
    /// Whether an utterance is currently audible.
    fn is_speaking(&self) -> bool;
}

/// Drives a synthesizer and owns the completion watchdog.
pub struct SpeechService {
    synth: Arc<dyn SpeechSynthesizer>,
    watchdog: Option<JoinHandle<()>>,
}

impl SpeechService {
    pub fn new(synth: Arc<dyn SpeechSynthesizer>) -> Self {
        Self {
            synth,
            watchdog: None,
        }
    }

    /// Speak `text` and post exactly one `SpeechFinished` when it ends,
    /// whether the poll observes silence or the ceiling forces completion.
    pub fn speak(
        &mut self,
        text: &str,
        poll: Duration,
        ceiling: Duration,
        events: UnboundedSender<SessionEvent>,
    ) {
        self.cancel();

        if let Err(e) = self.synth.begin(text) {
            // SpeechUnsupported degrades by skipping straight to the think
            // phase; other start failures do the same for this turn.
            warn!("speech output failed to start: {}", e);
            let _ = events.send(SessionEvent::SpeechFailed(e.to_string()));
            return;
        }

        let _ = events.send(SessionEvent::SpeechStarted);

        let synth = self.synth.clone();
        self.watchdog = Some(tokio::spawn(async move {
            tokio::select! {
                _ = poll_until_silent(synth, poll) => {
                    debug!("speech end detected by poll");
                }
                _ = tokio::time::sleep(ceiling) => {
                    warn!("speech ceiling reached, forcing completion");
                }
            }
            let _ = events.send(SessionEvent::SpeechFinished);
        }));
    }

    /// Cancel the current utterance and its watchdog. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.watchdog.take() {
            handle.abort();
        }
        self.synth.cancel();
    }

    /// Whether speech output is audible right now. Recording-start guards
    /// read this through the service, never a captured snapshot.
    pub fn is_speaking(&self) -> bool {
        self.synth.is_speaking()
    }
}

impl Drop for SpeechService {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn poll_until_silent(synth: Arc<dyn SpeechSynthesizer>, poll: Duration) {
    // One full interval of grace before the first check, so a synthesizer
    // that is still warming up is not read as already silent.
    tokio::time::sleep(poll).await;
    while synth.is_speaking() {
        tokio::time::sleep(poll).await;
    }
}

/// Speech backend that runs an external TTS command per utterance
/// (e.g. `espeak`). The child's lifetime is the utterance: kill = cancel,
/// exit = no longer speaking.
pub struct CommandSynthesizer {
    program: String,
    args: Vec<String>,
    child: Mutex<Option<Child>>,
}

impl CommandSynthesizer {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            child: Mutex::new(None),
        }
    }
}

impl SpeechSynthesizer for CommandSynthesizer {
    fn begin(&self, text: &str) -> Result<()> {
        let mut guard = self.child.lock().expect("speech child lock");
        if let Some(prev) = guard.as_mut() {
            let _ = prev.start_kill();
        }

        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(text)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    SessionError::SpeechUnsupported(format!("{} not found", self.program))
                } else {
                    SessionError::SpeechUnsupported(e.to_string())
                }
            })?;

        *guard = Some(child);
        Ok(())
    }

    fn cancel(&self) {
        let mut guard = self.child.lock().expect("speech child lock");
        if let Some(child) = guard.as_mut() {
            let _ = child.start_kill();
        }
        *guard = None;
    }

    fn is_speaking(&self) -> bool {
        let mut guard = self.child.lock().expect("speech child lock");
        match guard.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                _ => false,
            },
            None => false,
        }
    }
}

/// Backend for platforms with no speech output at all: reports silence so
/// the watchdog's first poll ends the phase immediately.
pub struct NullSynthesizer;

impl SpeechSynthesizer for NullSynthesizer {
    fn begin(&self, _text: &str) -> Result<()> {
        Ok(())
    }

    fn cancel(&self) {}

    fn is_speaking(&self) -> bool {
        false
    }
}
