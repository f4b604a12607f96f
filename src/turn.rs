//! Turn state machine
//!
//! The orchestration core: one synchronous machine sequencing
//! `AwaitingQuestion -> Speaking -> Thinking -> Recording -> Submitting`
//! per turn, looping until the evaluator sends the completion sentinel.
//! Events come in from the session queue, actions queue up and are drained
//! by the async runner, so every transition is testable without a runtime.
//!
//! Duplicate questions are deduplicated here, by comparing incoming text
//! to the last accepted question: redundant network events must never
//! re-enter a turn.

use crate::protocol::Evaluation;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

/// States of the active turn (and of the machine between turns).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    AwaitingQuestion,
    Speaking,
    Thinking,
    Recording,
    Submitting,
    /// The evaluator signalled end-of-interview. Terminal.
    Completed,
}

/// One question/answer cycle within a session.
#[derive(Debug, Clone)]
pub struct Turn {
    pub seq: u32,
    pub question: String,
    pub started_at: DateTime<Utc>,
    pub answer: Option<String>,
    /// Backend evaluation of the answer, carried verbatim, never
    /// interpreted here.
    pub evaluation: Option<Evaluation>,
}

/// Events the machine consumes, distilled from the session queue.
#[derive(Debug, Clone)]
pub enum FsmEvent {
    /// A question (or `None`, the completion sentinel) plus any evaluation
    /// of the previous answer.
    Question {
        text: Option<String>,
        evaluation: Option<Evaluation>,
    },
    /// Speech output finished (first of poll-detected end or ceiling).
    SpeechFinished,
    /// Think-phase countdown reached zero.
    ThinkExpired,
    /// Recording should stop: explicit user action or the automatic
    /// ceiling, already converged by the runner.
    StopRecording,
    /// A usable transcript came back for the submitted answer.
    TranscriptReady(String),
    /// The transcript was the service's unusable placeholder.
    TranscriptUnusable,
    /// Manually typed substitute for an unusable transcript.
    ManualAnswer(String),
    /// The turn failed (device, network, ...); retryable, session lives.
    TurnFailed(String),
}

/// Commands for the runner, drained after each event.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Speak(String),
    StartThink,
    StartRecording,
    /// Finalize the recording, encode, transcribe.
    StopAndSubmit,
    /// Ask for a typed substitute answer.
    RequestManualInput,
    /// Deliver the final answer text to the evaluator.
    RelayAnswer(String),
    ReportFailure(String),
    /// Interview complete; tear the session down.
    Finish,
}

pub struct TurnMachine {
    state: TurnState,
    turns: Vec<Turn>,
    last_question: Option<String>,
    awaiting_manual: bool,
    actions: Vec<Action>,
}

impl TurnMachine {
    pub fn new() -> Self {
        Self {
            state: TurnState::AwaitingQuestion,
            turns: Vec::new(),
            last_question: None,
            awaiting_manual: false,
            actions: Vec::new(),
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn is_completed(&self) -> bool {
        self.state == TurnState::Completed
    }

    /// Whether a manual substitute answer is currently expected.
    pub fn awaiting_manual(&self) -> bool {
        self.awaiting_manual
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Move the turn history out (session end).
    pub fn take_turns(&mut self) -> Vec<Turn> {
        std::mem::take(&mut self.turns)
    }

    /// Drain all actions produced since the last call.
    pub fn drain_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    pub fn on_event(&mut self, event: FsmEvent) {
        match (self.state, event) {
            // Completion sentinel ends the interview from any state.
            (state, FsmEvent::Question { text: None, evaluation }) => {
                if state == TurnState::Completed {
                    return;
                }
                self.attach_evaluation(evaluation);
                info!("✅ interview complete after {} turns", self.turns.len());
                self.state = TurnState::Completed;
                self.actions.push(Action::Finish);
            }

            // A new question starts the next turn, but only between turns
            // and only when its text differs from the previous question.
            (
                TurnState::AwaitingQuestion | TurnState::Submitting,
                FsmEvent::Question {
                    text: Some(text),
                    evaluation,
                },
            ) => {
                if self.last_question.as_deref() == Some(text.as_str()) {
                    debug!("ignoring duplicate question event");
                    return;
                }
                self.attach_evaluation(evaluation);

                let seq = self.turns.len() as u32 + 1;
                info!("🎤 turn {} starting: {}", seq, text);
                self.turns.push(Turn {
                    seq,
                    question: text.clone(),
                    started_at: Utc::now(),
                    answer: None,
                    evaluation: None,
                });
                // Assigned once per accepted question; every later duplicate
                // event compares against this.
                self.last_question = Some(text.clone());
                self.awaiting_manual = false;
                self.state = TurnState::Speaking;
                self.actions.push(Action::Speak(text));
            }

            // No two turns run concurrently: a question arriving while one
            // is mid-flight is a redundant or out-of-order event.
            (_, FsmEvent::Question { text: Some(text), .. }) => {
                if self.last_question.as_deref() == Some(text.as_str()) {
                    debug!("ignoring duplicate question event mid-turn");
                } else {
                    warn!("ignoring question while a turn is in flight: {}", text);
                }
            }

            (TurnState::Speaking, FsmEvent::SpeechFinished) => {
                debug!("speech finished, entering think phase");
                self.state = TurnState::Thinking;
                self.actions.push(Action::StartThink);
            }

            (TurnState::Thinking, FsmEvent::ThinkExpired) => {
                // The visible think phase ends now even if the device open
                // is still retrying.
                debug!("think phase over, starting recording");
                self.state = TurnState::Recording;
                self.actions.push(Action::StartRecording);
            }

            (TurnState::Recording, FsmEvent::StopRecording) => {
                debug!("recording stopped, submitting");
                self.state = TurnState::Submitting;
                self.actions.push(Action::StopAndSubmit);
            }

            (TurnState::Submitting, FsmEvent::TranscriptReady(text)) => {
                if self.current_answered() {
                    debug!("transcript after answer already relayed; ignoring");
                    return;
                }
                self.record_answer(&text);
                self.actions.push(Action::RelayAnswer(text));
            }

            (TurnState::Submitting, FsmEvent::TranscriptUnusable) => {
                if self.current_answered() || self.awaiting_manual {
                    return;
                }
                info!("transcript unusable, requesting manual substitute");
                self.awaiting_manual = true;
                self.actions.push(Action::RequestManualInput);
            }

            (TurnState::Submitting, FsmEvent::ManualAnswer(text)) => {
                if !self.awaiting_manual || self.current_answered() {
                    return;
                }
                self.awaiting_manual = false;
                self.record_answer(&text);
                // From here the turn proceeds exactly as if transcription
                // had succeeded.
                self.actions.push(Action::RelayAnswer(text));
            }

            (state, FsmEvent::TurnFailed(reason)) if state != TurnState::Completed => {
                warn!("turn failed: {}", reason);
                // Retryable: forget the failed question so the evaluator may
                // resend the same text.
                self.last_question = None;
                self.awaiting_manual = false;
                self.state = TurnState::AwaitingQuestion;
                self.actions.push(Action::ReportFailure(reason));
            }

            // Stale or out-of-order events are ignored, never allowed to
            // re-enter a state.
            (state, event) => {
                debug!("ignoring {:?} in state {:?}", event, state);
            }
        }
    }

    fn current_answered(&self) -> bool {
        self.turns
            .last()
            .map(|t| t.answer.is_some())
            .unwrap_or(false)
    }

    fn record_answer(&mut self, text: &str) {
        if let Some(turn) = self.turns.last_mut() {
            turn.answer = Some(text.to_string());
        }
    }

    fn attach_evaluation(&mut self, evaluation: Option<Evaluation>) {
        if let (Some(eval), Some(turn)) = (evaluation, self.turns.last_mut()) {
            turn.evaluation = Some(eval);
        }
    }
}

impl Default for TurnMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn question(text: &str) -> FsmEvent {
        FsmEvent::Question {
            text: Some(text.to_string()),
            evaluation: None,
        }
    }

    fn sentinel() -> FsmEvent {
        FsmEvent::Question {
            text: None,
            evaluation: None,
        }
    }

    #[test]
    fn duplicate_questions_create_at_most_one_turn() {
        let mut fsm = TurnMachine::new();
        fsm.on_event(question("What is your name?"));
        fsm.on_event(question("What is your name?"));
        fsm.on_event(question("What is your name?"));

        assert_eq!(fsm.turns().len(), 1);
        assert_eq!(
            fsm.drain_actions(),
            vec![Action::Speak("What is your name?".to_string())]
        );
    }

    #[test]
    fn full_turn_cycle() {
        let mut fsm = TurnMachine::new();

        fsm.on_event(question("What is your name?"));
        assert_eq!(fsm.state(), TurnState::Speaking);

        fsm.on_event(FsmEvent::SpeechFinished);
        assert_eq!(fsm.state(), TurnState::Thinking);

        fsm.on_event(FsmEvent::ThinkExpired);
        assert_eq!(fsm.state(), TurnState::Recording);

        fsm.on_event(FsmEvent::StopRecording);
        assert_eq!(fsm.state(), TurnState::Submitting);

        fsm.on_event(FsmEvent::TranscriptReady("I am Ada.".to_string()));

        let actions = fsm.drain_actions();
        assert_eq!(
            actions,
            vec![
                Action::Speak("What is your name?".to_string()),
                Action::StartThink,
                Action::StartRecording,
                Action::StopAndSubmit,
                Action::RelayAnswer("I am Ada.".to_string()),
            ]
        );
        assert_eq!(fsm.turns()[0].answer.as_deref(), Some("I am Ada."));

        // Response with the next question starts turn two.
        fsm.on_event(FsmEvent::Question {
            text: Some("What do you build?".to_string()),
            evaluation: Some(Evaluation {
                score: Some(80.0),
                feedback: Some("good".to_string()),
            }),
        });
        assert_eq!(fsm.state(), TurnState::Speaking);
        assert_eq!(fsm.turns().len(), 2);
        // The evaluation landed on the finished turn, not the new one.
        assert!(fsm.turns()[0].evaluation.is_some());
        assert!(fsm.turns()[1].evaluation.is_none());

        fsm.on_event(sentinel());
        assert!(fsm.is_completed());
        assert!(fsm.drain_actions().contains(&Action::Finish));
    }

    #[test]
    fn unusable_transcript_takes_manual_substitute() {
        let mut fsm = TurnMachine::new();
        fsm.on_event(question("What is your name?"));
        fsm.on_event(FsmEvent::SpeechFinished);
        fsm.on_event(FsmEvent::ThinkExpired);
        fsm.on_event(FsmEvent::StopRecording);
        fsm.drain_actions();

        fsm.on_event(FsmEvent::TranscriptUnusable);
        assert!(fsm.awaiting_manual());
        assert_eq!(fsm.drain_actions(), vec![Action::RequestManualInput]);

        fsm.on_event(FsmEvent::ManualAnswer("My name is Ada".to_string()));
        assert!(!fsm.awaiting_manual());
        assert_eq!(
            fsm.drain_actions(),
            vec![Action::RelayAnswer("My name is Ada".to_string())]
        );
        // The placeholder never became the answer.
        assert_eq!(fsm.turns()[0].answer.as_deref(), Some("My name is Ada"));
    }

    #[test]
    fn manual_answer_without_request_is_ignored() {
        let mut fsm = TurnMachine::new();
        fsm.on_event(question("Q"));
        fsm.on_event(FsmEvent::SpeechFinished);
        fsm.on_event(FsmEvent::ThinkExpired);
        fsm.on_event(FsmEvent::StopRecording);
        fsm.drain_actions();

        fsm.on_event(FsmEvent::ManualAnswer("stray".to_string()));
        assert!(fsm.drain_actions().is_empty());
        assert!(fsm.turns()[0].answer.is_none());
    }

    #[test]
    fn out_of_order_events_never_reenter_states() {
        let mut fsm = TurnMachine::new();
        fsm.on_event(question("Q"));
        fsm.drain_actions();

        // None of these are valid while Speaking.
        fsm.on_event(FsmEvent::ThinkExpired);
        fsm.on_event(FsmEvent::StopRecording);
        fsm.on_event(FsmEvent::TranscriptReady("early".to_string()));
        assert_eq!(fsm.state(), TurnState::Speaking);
        assert!(fsm.drain_actions().is_empty());

        fsm.on_event(FsmEvent::SpeechFinished);
        fsm.on_event(FsmEvent::ThinkExpired);
        fsm.on_event(FsmEvent::ThinkExpired); // stale second expiry
        fsm.drain_actions();
        assert_eq!(fsm.state(), TurnState::Recording);

        fsm.on_event(FsmEvent::StopRecording);
        fsm.on_event(FsmEvent::StopRecording); // ceiling after user stop
        assert_eq!(
            fsm.drain_actions(),
            vec![Action::StopAndSubmit] // exactly one submit
        );
    }

    #[test]
    fn question_mid_turn_does_not_start_a_second_turn() {
        let mut fsm = TurnMachine::new();
        fsm.on_event(question("Q1"));
        fsm.on_event(FsmEvent::SpeechFinished);
        fsm.on_event(question("Q2"));
        assert_eq!(fsm.turns().len(), 1);
        assert_eq!(fsm.state(), TurnState::Thinking);
    }

    #[test]
    fn completion_sentinel_works_from_any_state() {
        for advance in 0..4 {
            let mut fsm = TurnMachine::new();
            fsm.on_event(question("Q"));
            let steps = [
                FsmEvent::SpeechFinished,
                FsmEvent::ThinkExpired,
                FsmEvent::StopRecording,
            ];
            for step in steps.iter().take(advance) {
                fsm.on_event(step.clone());
            }
            fsm.on_event(sentinel());
            assert!(fsm.is_completed());
        }
    }

    #[test]
    fn failed_turn_is_retryable_with_the_same_question() {
        let mut fsm = TurnMachine::new();
        fsm.on_event(question("Q"));
        fsm.on_event(FsmEvent::SpeechFinished);
        fsm.on_event(FsmEvent::ThinkExpired);
        fsm.drain_actions();

        fsm.on_event(FsmEvent::TurnFailed("device unavailable".to_string()));
        assert_eq!(fsm.state(), TurnState::AwaitingQuestion);
        assert_eq!(
            fsm.drain_actions(),
            vec![Action::ReportFailure("device unavailable".to_string())]
        );

        // The evaluator resends the same text; it must be accepted now.
        fsm.on_event(question("Q"));
        assert_eq!(fsm.state(), TurnState::Speaking);
        assert_eq!(fsm.turns().len(), 2);
    }

    #[test]
    fn duplicate_transcript_relays_only_once() {
        let mut fsm = TurnMachine::new();
        fsm.on_event(question("Q"));
        fsm.on_event(FsmEvent::SpeechFinished);
        fsm.on_event(FsmEvent::ThinkExpired);
        fsm.on_event(FsmEvent::StopRecording);
        fsm.drain_actions();

        fsm.on_event(FsmEvent::TranscriptReady("answer".to_string()));
        fsm.on_event(FsmEvent::TranscriptReady("answer".to_string()));
        assert_eq!(
            fsm.drain_actions(),
            vec![Action::RelayAnswer("answer".to_string())]
        );
    }
}
