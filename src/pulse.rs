//! PulseAudio capture backend
//!
//! Records from the default PulseAudio source on a dedicated OS thread
//! using the simple blocking API, feeding interleaved `i16` chunks into an
//! mpsc channel. The stream captures at the configured native spec; the
//! encoder owns all normalization down to the 16 kHz mono contract.

use crate::capture::{AudioSource, CaptureSpec, CaptureStream};
use crate::error::{Result, SessionError};
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

pub struct PulseSource {
    app_name: String,
    device_name: Option<String>,
    spec: CaptureSpec,
}

impl PulseSource {
    /// Capture from the default source at `spec`.
    pub fn new(app_name: &str, spec: CaptureSpec) -> Self {
        Self {
            app_name: app_name.to_string(),
            device_name: None,
            spec,
        }
    }

    /// Capture from a specific PulseAudio source.
    pub fn with_device(app_name: &str, device_name: &str, spec: CaptureSpec) -> Self {
        Self {
            app_name: app_name.to_string(),
            device_name: Some(device_name.to_string()),
            spec,
        }
    }
}

impl AudioSource for PulseSource {
    fn spec(&self) -> CaptureSpec {
        self.spec
    }

    fn open(&self) -> Result<CaptureStream> {
        let (tx, rx) = mpsc::channel::<Vec<i16>>(32);
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();

        let app_name = self.app_name.clone();
        let device_name = self.device_name.clone();
        let spec = self.spec;

        // The Simple handle is created and used entirely on the capture
        // thread; open success is reported back synchronously.
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<std::result::Result<(), String>>();

        std::thread::spawn(move || {
            let pulse_spec = Spec {
                format: Format::S16le,
                channels: spec.channels as u8,
                rate: spec.sample_rate,
            };

            let simple = match Simple::new(
                None,      // default server
                &app_name, // application name
                Direction::Record,
                device_name.as_deref(),
                "answer-capture", // stream description
                &pulse_spec,
                None, // default channel map
                None, // default buffering
            ) {
                Ok(simple) => {
                    let _ = ready_tx.send(Ok(()));
                    simple
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(format!("{}", e)));
                    return;
                }
            };

            info!(
                "pulse capture opened: {} Hz x{}",
                spec.sample_rate, spec.channels
            );

            // 100 ms of interleaved S16LE per read.
            let chunk_samples = (spec.sample_rate as usize / 10) * spec.channels as usize;
            let mut buf = vec![0u8; chunk_samples * 2];

            loop {
                if shutdown_thread.load(Ordering::Relaxed) {
                    debug!("pulse capture thread shutting down");
                    break;
                }
                if let Err(e) = simple.read(&mut buf) {
                    error!("pulse read error: {}", e);
                    break;
                }
                let samples: Vec<i16> = buf
                    .chunks_exact(2)
                    .map(|b| i16::from_le_bytes([b[0], b[1]]))
                    .collect();
                if tx.blocking_send(samples).is_err() {
                    // Receiver dropped; recording is over.
                    break;
                }
            }
        });

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(CaptureStream::new(rx, shutdown)),
            Ok(Err(e)) => Err(SessionError::DeviceUnavailable(e)),
            Err(_) => Err(SessionError::DeviceUnavailable(
                "capture thread died before opening".into(),
            )),
        }
    }
}
