//! Vivavoce - turn-taking engine for spoken interviews
//!
//! Conducts an interview one turn at a time: speaks the question, runs a
//! bounded think countdown, records the spoken answer, encodes it to the
//! transcription contract (WAV, mono, 16-bit, 16 kHz), ships it for
//! transcription, and relays the text to the evaluator over a duplex
//! WebSocket, falling back to single-shot HTTP when the link is
//! unavailable.
//!
//! Devices and transports sit behind capability traits
//! ([`speech::SpeechSynthesizer`], [`capture::AudioSource`],
//! [`channel::DuplexConnector`], [`api::InterviewBackend`]) so the
//! orchestrator runs identically against hardware and test fakes.

#![forbid(unsafe_code)]

/// HTTP contracts: bootstrap, transcription upload, fallback path
pub mod api;
/// Audio capture capability and the recording lifecycle
pub mod capture;
/// Duplex channel state machine and WebSocket transport
pub mod channel;
/// Session tunables
pub mod config;
/// Answer normalization into the WAV contract
pub mod encoder;
/// Error taxonomy
pub mod error;
/// The session's single event queue
pub mod events;
/// Wire message types
pub mod protocol;
/// PulseAudio capture backend
pub mod pulse;
/// Session runner: composes the services around the turn machine
pub mod session;
/// Speech output service with completion watchdog
pub mod speech;
/// Think-phase countdown
pub mod timer;
/// The turn state machine
pub mod turn;

pub use config::SessionConfig;
pub use error::{Result, SessionError};
pub use session::{ConnectionMode, SessionRunner};
pub use turn::{Turn, TurnState};
