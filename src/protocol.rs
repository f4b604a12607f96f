//! Wire contract with the interview backend
//!
//! Covers the duplex chat channel, the single-shot fallback call, the
//! transcription upload, and the session bootstrap. The duplex channel is a
//! tagged-union message; `data.question == null` on a `question` message is
//! the end-of-interview sentinel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Payload of a `question` message. A `null` question ends the interview.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionPayload {
    pub question: Option<String>,
}

/// One message on the duplex channel, tagged by its `type` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChannelMessage {
    /// Server → client: the next question, or the completion sentinel.
    Question {
        #[serde(default)]
        data: Option<QuestionPayload>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
    /// Client → server: the respondent's answer text for the active turn.
    Answer {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
    /// Client → server: a manual substitute answer is being typed.
    Typing {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
    /// Server → client: processing error for the last message.
    Error {
        #[serde(default, alias = "error")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
    /// Server → client: heartbeat reply, `ts` in epoch milliseconds.
    Pong {
        #[serde(default)]
        ts: Option<i64>,
    },
    /// Client → server: heartbeat probe.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
    /// Server → client: unknown message type was received. Logged, ignored.
    Warning {
        #[serde(default)]
        message: Option<String>,
    },
}

impl ChannelMessage {
    pub fn answer(text: impl Into<String>) -> Self {
        ChannelMessage::Answer {
            message: text.into(),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn typing() -> Self {
        ChannelMessage::Typing {
            timestamp: Some(Utc::now()),
        }
    }

    pub fn ping() -> Self {
        ChannelMessage::Ping {
            timestamp: Some(Utc::now()),
        }
    }
}

/// Evaluation payload the backend attaches to each processed answer. Carried
/// on the completed turn verbatim; this client never interprets it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Evaluation {
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub feedback: Option<String>,
}

/// `next_question` object in the fallback response.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct NextQuestion {
    pub question: String,
}

/// Response of `POST /api/send-message` (the fallback path).
#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub next_question: Option<NextQuestion>,
    /// Legacy flat field kept by the backend for older callers.
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub evaluation: Option<Evaluation>,
}

impl SendMessageResponse {
    /// The next question, preferring the structured field over the legacy
    /// flat one. `None` signals end of interview.
    pub fn next_question_text(&self) -> Option<&str> {
        self.next_question
            .as_ref()
            .map(|n| n.question.as_str())
            .or(self.question.as_deref())
    }
}

/// Response of `POST /api/start-interview`.
#[derive(Debug, Clone, Deserialize)]
pub struct StartInterviewResponse {
    #[serde(default)]
    pub success: bool,
    pub session_id: String,
    pub question: String,
}

/// Response of `POST /api/transcribe`.
#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptionResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub text: String,
}

/// Whether a transcript is the backend's "unusable" placeholder, e.g.
/// `[Audio received ~42 KB; transcription unavailable]`. Matched loosely so
/// the embedded size does not matter.
pub fn is_unusable_transcript(text: &str) -> bool {
    let t = text.trim();
    t.starts_with("[Audio received") && t.contains("transcription unavailable")
}
