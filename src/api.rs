//! HTTP client for the interview backend
//!
//! Carries the three request/response contracts the engine needs: the
//! session bootstrap, the transcription upload, and the single-shot
//! fallback used when no duplex channel is available.

use crate::encoder::EncodedAnswer;
use crate::error::{Result, SessionError};
use crate::protocol::{SendMessageResponse, StartInterviewResponse, TranscriptionResponse};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

/// Capability interface over the backend's request/response contracts, so
/// the session runner is testable without a server.
pub trait InterviewBackend: Send + Sync {
    /// Submit an encoded answer for transcription; returns the transcript
    /// text (possibly the backend's "unusable" placeholder).
    fn transcribe(
        &self,
        session_id: &str,
        answer: &EncodedAnswer,
    ) -> impl std::future::Future<Output = Result<String>> + Send;

    /// Fallback path: submit answer text, synchronously receive the next
    /// question (or completion).
    fn send_answer(
        &self,
        session_id: &str,
        text: &str,
    ) -> impl std::future::Future<Output = Result<SendMessageResponse>> + Send;
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Bootstrap a session: returns the session id and the first question.
    pub async fn start_interview(
        &self,
        candidate_name: &str,
        job_title: &str,
    ) -> Result<StartInterviewResponse> {
        info!("starting interview for {} ({})", candidate_name, job_title);
        let resp = self
            .client
            .post(self.url("/api/start-interview"))
            .json(&json!({
                "candidate_name": candidate_name,
                "job_title": job_title,
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json::<StartInterviewResponse>().await?)
    }
}

impl InterviewBackend for ApiClient {
    async fn transcribe(&self, session_id: &str, answer: &EncodedAnswer) -> Result<String> {
        debug!(
            "uploading {} ({} bytes) for transcription",
            answer.file_name(),
            answer.byte_len()
        );

        let part = reqwest::multipart::Part::bytes(answer.bytes.clone())
            .file_name(answer.file_name())
            .mime_str(answer.mime_type())
            .map_err(|e| SessionError::Other(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("session_id", session_id.to_string());

        let resp = self
            .client
            .post(self.url("/api/transcribe"))
            .multipart(form)
            .send()
            .await?
            .error_for_status()?;

        let body = resp.json::<TranscriptionResponse>().await?;
        debug!("transcript received: {} chars", body.text.len());
        Ok(body.text)
    }

    async fn send_answer(&self, session_id: &str, text: &str) -> Result<SendMessageResponse> {
        debug!("submitting answer over fallback path ({} chars)", text.len());
        let resp = self
            .client
            .post(self.url("/api/send-message"))
            .json(&json!({
                "session_id": session_id,
                "message": text,
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json::<SendMessageResponse>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_without_double_slash() {
        let api = ApiClient::new("http://localhost:8000/").unwrap();
        assert_eq!(api.url("/api/transcribe"), "http://localhost:8000/api/transcribe");
    }
}
