//! Session configuration
//!
//! Every timing constant of the turn pipeline lives here so tests can
//! compress them and deployments can tune them without code changes.

use std::time::Duration;

/// Configuration for one interview session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base URL of the interview backend, e.g. `http://localhost:8000`.
    pub api_base: String,
    /// WebSocket URL template; `{session_id}` is substituted at connect time.
    pub ws_url: String,

    /// Think-phase countdown between question delivery and recording start.
    pub think_duration: Duration,
    /// Granularity of the think-phase countdown ticks.
    pub think_tick: Duration,

    /// Watchdog poll interval for the "currently speaking" flag.
    pub speech_poll: Duration,
    /// Hard ceiling on a single utterance if polling never resolves.
    pub speech_ceiling: Duration,

    /// Delay between capture-device open attempts while permission resolves.
    pub device_retry_delay: Duration,
    /// Maximum number of capture-device open attempts.
    pub device_retry_attempts: u32,
    /// Deferral before re-checking the speech-active flag when recording is
    /// requested while speech output is still audible.
    pub recording_defer: Duration,
    /// Automatic stop ceiling on a recording, kept under the transcription
    /// service's 58 s input cap.
    pub recording_ceiling: Duration,

    /// Heartbeat interval on the duplex channel while connected.
    pub heartbeat_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:8000".to_string(),
            ws_url: "ws://localhost:8000/api/ws/chat/{session_id}".to_string(),
            think_duration: Duration::from_secs(3),
            think_tick: Duration::from_secs(1),
            speech_poll: Duration::from_millis(150),
            speech_ceiling: Duration::from_secs(30),
            device_retry_delay: Duration::from_millis(300),
            device_retry_attempts: 20,
            recording_defer: Duration::from_millis(100),
            recording_ceiling: Duration::from_secs(55),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

impl SessionConfig {
    /// Resolve the duplex endpoint for a session id.
    pub fn ws_endpoint(&self, session_id: &str) -> String {
        self.ws_url.replace("{session_id}", session_id)
    }
}
