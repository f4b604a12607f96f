//! Vivavoce - spoken interview client
//!
//! Binary entry point: bootstraps a session against the interview backend,
//! wires the real device and transport backends to the session runner, and
//! bridges terminal input (Enter stops a recording; a typed line answers a
//! manual-input request) onto the session queue.

use anyhow::Context;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tracing::{error, info, warn};
use vivavoce::api::ApiClient;
use vivavoce::capture::CaptureSpec;
use vivavoce::channel::WsConnector;
use vivavoce::events::SessionEvent;
use vivavoce::pulse::PulseSource;
use vivavoce::speech::CommandSynthesizer;
use vivavoce::{SessionConfig, SessionError, SessionRunner};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    info!("starting vivavoce");

    let mut args = std::env::args().skip(1);
    let candidate = args.next().unwrap_or_else(|| "Candidate".to_string());
    let job_title = args.next().unwrap_or_else(|| "Software Engineer".to_string());

    let mut config = SessionConfig::default();
    if let Ok(base) = std::env::var("VIVAVOCE_API_BASE") {
        config.ws_url = format!(
            "{}/api/ws/chat/{{session_id}}",
            base.replacen("http", "ws", 1).trim_end_matches('/')
        );
        config.api_base = base;
    }

    let api = ApiClient::new(config.api_base.clone())?;
    let start = api
        .start_interview(&candidate, &job_title)
        .await
        .context("interview bootstrap failed")?;
    info!("session {} started", start.session_id);

    let tts_program = std::env::var("VIVAVOCE_TTS").unwrap_or_else(|_| "espeak".to_string());
    let synthesizer = Arc::new(CommandSynthesizer::new(tts_program, Vec::new()));

    let source = Arc::new(PulseSource::new(
        "vivavoce",
        CaptureSpec {
            sample_rate: 48_000,
            channels: 1,
        },
    ));

    let runner = SessionRunner::new(
        start.session_id,
        config,
        api,
        WsConnector,
        synthesizer,
        source,
    );
    let events = runner.events_handle();

    // Terminal bridge: Enter stops the active recording, a typed line is
    // the manual substitute answer when one was requested.
    let line_events = events.clone();
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line_events.send(SessionEvent::UserLine(line)).is_err() {
                break;
            }
        }
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = events.send(SessionEvent::Shutdown);
        }
    });

    match runner.run(start.question).await {
        Ok(turns) => {
            info!("interview finished: {} turns", turns.len());
            for turn in &turns {
                info!(
                    "  {}. {} -> {}",
                    turn.seq,
                    turn.question,
                    turn.answer.as_deref().unwrap_or("(no answer)")
                );
            }
        }
        Err(SessionError::ChannelLost) => {
            error!("connection to the evaluator was lost; restart the session to continue");
            std::process::exit(1);
        }
        Err(e) => {
            warn!("session ended with error: {}", e);
            return Err(e.into());
        }
    }

    Ok(())
}
