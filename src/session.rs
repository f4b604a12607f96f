//! Session runner
//!
//! Drives one interview session: owns the single event queue, the turn
//! state machine, and every supporting service (speech output, think
//! timer, audio capture, transmission channel). All asynchronous
//! collaborators post onto the queue; only this runner mutates session
//! state, so stale callbacks can never corrupt a turn.

use crate::api::InterviewBackend;
use crate::capture::{start_recording, AudioSource, RecordingHandle, RetryPolicy};
use crate::channel::{ChannelManager, ChannelState, DuplexConnector};
use crate::config::SessionConfig;
use crate::encoder::encode_answer;
use crate::error::{Result, SessionError};
use crate::events::SessionEvent;
use crate::protocol::{is_unusable_transcript, ChannelMessage};
use crate::speech::{SpeechService, SpeechSynthesizer};
use crate::timer::ThinkTimer;
use crate::turn::{Action, FsmEvent, Turn, TurnMachine, TurnState};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How answers reach the evaluator for this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Persistent duplex channel.
    Duplex,
    /// Single-shot request/response per answer.
    Fallback,
}

pub struct SessionRunner<B, C> {
    session_id: String,
    config: SessionConfig,
    machine: TurnMachine,
    events_tx: UnboundedSender<SessionEvent>,
    events_rx: UnboundedReceiver<SessionEvent>,
    speech: SpeechService,
    timer: ThinkTimer,
    channel: ChannelManager<C>,
    backend: B,
    source: Arc<dyn AudioSource>,
    mode: ConnectionMode,
    recording: Option<RecordingHandle>,
    start_deferral: Option<JoinHandle<()>>,
}

impl<B, C> SessionRunner<B, C>
where
    B: InterviewBackend,
    C: DuplexConnector,
{
    pub fn new(
        session_id: impl Into<String>,
        config: SessionConfig,
        backend: B,
        connector: C,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        source: Arc<dyn AudioSource>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            session_id: session_id.into(),
            config,
            machine: TurnMachine::new(),
            events_tx,
            events_rx,
            speech: SpeechService::new(synthesizer),
            timer: ThinkTimer::new(),
            channel: ChannelManager::new(connector),
            backend,
            source,
            mode: ConnectionMode::Fallback,
            recording: None,
            start_deferral: None,
        }
    }

    /// Sender half of the session queue, for the embedding layer (user
    /// stop requests, manual answers, shutdown).
    pub fn events_handle(&self) -> UnboundedSender<SessionEvent> {
        self.events_tx.clone()
    }

    pub fn connection_mode(&self) -> ConnectionMode {
        self.mode
    }

    /// Run the session to completion, starting from the bootstrap
    /// question. Returns the finished turns.
    pub async fn run(mut self, first_question: String) -> Result<Vec<Turn>> {
        let ws_url = self.config.ws_endpoint(&self.session_id);
        match self
            .channel
            .connect(&ws_url, self.config.heartbeat_interval, self.events_tx.clone())
            .await
        {
            Ok(()) => {
                self.mode = ConnectionMode::Duplex;
            }
            Err(e) => {
                warn!("duplex unavailable, using fallback path: {}", e);
                self.mode = ConnectionMode::Fallback;
            }
        }

        let _ = self.events_tx.send(SessionEvent::Question {
            text: Some(first_question),
            evaluation: None,
        });

        let outcome = loop {
            let Some(event) = self.events_rx.recv().await else {
                break Err(SessionError::ChannelClosed);
            };
            match self.dispatch(event).await {
                Ok(true) => break Ok(()),
                Ok(false) => {}
                Err(e) => break Err(e),
            }
        };

        self.teardown();
        outcome.map(|_| self.machine.take_turns())
    }

    /// Handle one event from the queue; `Ok(true)` ends the session.
    async fn dispatch(&mut self, event: SessionEvent) -> Result<bool> {
        match event {
            SessionEvent::Question { text, evaluation } => {
                self.machine.on_event(FsmEvent::Question { text, evaluation });
            }
            SessionEvent::SpeechStarted => {
                debug!("speech output started");
            }
            SessionEvent::SpeechFinished => {
                self.machine.on_event(FsmEvent::SpeechFinished);
            }
            SessionEvent::SpeechFailed(reason) => {
                // Degrade to the think phase rather than losing the turn.
                warn!("speech output failed ({}), skipping to think phase", reason);
                self.machine.on_event(FsmEvent::SpeechFinished);
            }
            SessionEvent::ThinkTick { remaining_secs } => {
                info!("⏳ think: {}s remaining", remaining_secs);
            }
            SessionEvent::ThinkExpired => {
                self.machine.on_event(FsmEvent::ThinkExpired);
            }
            SessionEvent::TryStartRecording => {
                self.try_start_recording();
            }
            SessionEvent::Loudness(level) => {
                debug!("input level: {}", level);
            }
            SessionEvent::CaptureFailed(reason) => {
                // The capture task is already gone; drop its handle so the
                // next turn can open a fresh recording.
                if let Some(handle) = self.recording.take() {
                    handle.cancel();
                }
                self.machine
                    .on_event(FsmEvent::TurnFailed(format!("capture device: {}", reason)));
            }
            SessionEvent::RecordingCeiling => {
                // Converges with the explicit stop on the same transition.
                self.machine.on_event(FsmEvent::StopRecording);
            }
            SessionEvent::UserLine(line) => {
                if self.machine.awaiting_manual() {
                    self.machine.on_event(FsmEvent::ManualAnswer(line));
                } else if self.machine.state() == TurnState::Recording {
                    self.machine.on_event(FsmEvent::StopRecording);
                } else {
                    debug!("ignoring user input in state {:?}", self.machine.state());
                }
            }
            SessionEvent::ChannelDown(reason) => {
                self.channel.mark_lost();
                if self.mode == ConnectionMode::Duplex {
                    error!("duplex channel lost: {}", reason);
                    return Err(SessionError::ChannelLost);
                }
                debug!("channel down before establishment: {}", reason);
            }
            SessionEvent::Shutdown => {
                info!("session shutdown requested");
                return Ok(true);
            }
        }

        self.run_actions().await
    }

    /// Execute everything the machine queued, including actions produced
    /// by events posted while executing.
    async fn run_actions(&mut self) -> Result<bool> {
        let mut finished = false;
        loop {
            let actions = self.machine.drain_actions();
            if actions.is_empty() {
                break;
            }
            for action in actions {
                match action {
                    Action::Speak(text) => {
                        self.speech.speak(
                            &text,
                            self.config.speech_poll,
                            self.config.speech_ceiling,
                            self.events_tx.clone(),
                        );
                    }
                    Action::StartThink => {
                        self.timer.start(
                            self.config.think_duration,
                            self.config.think_tick,
                            self.events_tx.clone(),
                        );
                    }
                    Action::StartRecording => {
                        // The think timer must be idle before the device
                        // opens.
                        self.timer.cancel();
                        self.try_start_recording();
                    }
                    Action::StopAndSubmit => {
                        self.stop_and_submit().await;
                    }
                    Action::RequestManualInput => {
                        // Cosmetic typing indicator; a real loss surfaces
                        // through the channel's own close signal.
                        if self.channel.is_connected() {
                            let _ = self.channel.send(ChannelMessage::typing());
                        }
                        info!("transcription unusable; type the answer to continue");
                    }
                    Action::RelayAnswer(text) => {
                        self.relay_answer(text).await?;
                    }
                    Action::ReportFailure(reason) => {
                        // The failed turn's services must not leak into the
                        // next turn.
                        self.timer.cancel();
                        self.speech.cancel();
                        error!("turn failed (retryable): {}", reason);
                    }
                    Action::Finish => {
                        finished = true;
                    }
                }
            }
        }
        Ok(finished)
    }

    /// Open the capture device, unless speech output is still audible, in
    /// which case re-check after a short deferral instead of racing.
    fn try_start_recording(&mut self) {
        if self.machine.state() != TurnState::Recording {
            debug!("stale recording-start request ignored");
            return;
        }
        if self.recording.is_some() {
            debug!("recording already open");
            return;
        }
        if self.speech.is_speaking() {
            debug!("speech still audible, deferring recording start");
            if let Some(prev) = self.start_deferral.take() {
                prev.abort();
            }
            let events = self.events_tx.clone();
            let delay = self.config.recording_defer;
            self.start_deferral = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = events.send(SessionEvent::TryStartRecording);
            }));
            return;
        }

        self.recording = Some(start_recording(
            self.source.clone(),
            RetryPolicy {
                attempts: self.config.device_retry_attempts,
                delay: self.config.device_retry_delay,
            },
            self.config.recording_ceiling,
            self.events_tx.clone(),
        ));
    }

    /// Finalize the recording, encode it, and run transcription. Both stop
    /// paths arrive here through the single Recording -> Submitting
    /// transition, so at most one encode happens per recording.
    async fn stop_and_submit(&mut self) {
        let Some(handle) = self.recording.take() else {
            self.machine
                .on_event(FsmEvent::TurnFailed("no active recording".into()));
            return;
        };

        let buffer = match handle.stop().await {
            Ok(buffer) => buffer,
            Err(e) => {
                self.machine.on_event(FsmEvent::TurnFailed(e.to_string()));
                return;
            }
        };

        let answer = encode_answer(buffer);
        info!(
            "📤 submitting {} ({} bytes) for transcription",
            answer.file_name(),
            answer.byte_len()
        );

        match self.backend.transcribe(&self.session_id, &answer).await {
            Ok(text) if is_unusable_transcript(&text) => {
                self.machine.on_event(FsmEvent::TranscriptUnusable);
            }
            Ok(text) => {
                self.machine.on_event(FsmEvent::TranscriptReady(text));
            }
            Err(e) => {
                self.machine
                    .on_event(FsmEvent::TurnFailed(format!("transcription call: {}", e)));
            }
        }
    }

    /// Deliver the final answer text: duplex publish when connected, the
    /// single-shot fallback otherwise. A lost channel rejects the send.
    async fn relay_answer(&mut self, text: String) -> Result<()> {
        match self.channel.state() {
            ChannelState::Connected => {
                self.channel.send(ChannelMessage::answer(text))?;
                // The next question (or sentinel) arrives through the pump.
                Ok(())
            }
            ChannelState::Lost => Err(SessionError::ChannelLost),
            _ => {
                match self.backend.send_answer(&self.session_id, &text).await {
                    Ok(resp) if !resp.success => {
                        // An unsuccessful response with no question is a
                        // server-side retry request, not completion.
                        self.machine
                            .on_event(FsmEvent::TurnFailed("backend rejected the answer".into()));
                        Ok(())
                    }
                    Ok(resp) => {
                        let _ = self.events_tx.send(SessionEvent::Question {
                            text: resp.next_question_text().map(str::to_string),
                            evaluation: resp.evaluation.clone(),
                        });
                        Ok(())
                    }
                    Err(e) => {
                        // Fallback network errors fail the turn, not the
                        // session.
                        self.machine
                            .on_event(FsmEvent::TurnFailed(format!("fallback call: {}", e)));
                        Ok(())
                    }
                }
            }
        }
    }

    /// Cancel everything, in dependency order: timers, speech watchdogs,
    /// scheduled capture-start retries, the open recording, the channel.
    /// Every step is a no-op when already stopped.
    fn teardown(&mut self) {
        self.timer.cancel();
        self.speech.cancel();
        if let Some(deferral) = self.start_deferral.take() {
            deferral.abort();
        }
        if let Some(recording) = self.recording.take() {
            recording.cancel();
        }
        self.channel.shutdown();
        debug!("session torn down");
    }
}
