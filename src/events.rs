//! Events dispatched onto the session's single logical queue.
//!
//! Every asynchronous collaborator (speech watchdog, think timer, capture
//! task, channel pump, user input) posts here; only the session runner
//! consumes, so no callback ever mutates session state directly.

use crate::protocol::Evaluation;

#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A question arrived from the evaluator. `None` is the completion
    /// sentinel.
    Question {
        text: Option<String>,
        evaluation: Option<Evaluation>,
    },
    /// Speech output became audible.
    SpeechStarted,
    /// Speech output finished: first of poll-detected end or hard ceiling.
    SpeechFinished,
    /// Speech output failed to start; the turn degrades to the think phase.
    SpeechFailed(String),
    /// Think-phase countdown tick with whole seconds remaining.
    ThinkTick { remaining_secs: u64 },
    /// Think-phase countdown reached zero.
    ThinkExpired,
    /// Recording-start guard deferral elapsed; re-check the speech flag.
    TryStartRecording,
    /// Capture device produced a relative loudness sample (0-100). Cosmetic.
    Loudness(u8),
    /// The capture device never became available within the retry window.
    CaptureFailed(String),
    /// The active recording hit its automatic ceiling.
    RecordingCeiling,
    /// A line of user input (stop request while recording, or the manual
    /// substitute answer while one is pending).
    UserLine(String),
    /// The duplex connection closed or errored after being established.
    ChannelDown(String),
    /// Respondent exit; tear the session down.
    Shutdown,
}
