//! Paced delivery target: config discovery and per-message invocation.
//!
//! A target is an HTTP endpoint processing one message per request.
//! `GET {base}/config` describes it (its dead letter queue and per-delivery
//! timeout); `POST {base}/invocations` delivers a message body, either
//! fire-and-forget (`event`) or synchronously (`request-response`), in which
//! case the response carries the handler's output and, on handler failure,
//! an `x-handler-error` marker.

use std::time::Duration;

use serde::Deserialize;
use snafu::{ResultExt, Snafu};

use crate::queue::Message;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TargetError {
    /// Transport-level failure talking to the target.
    #[snafu(display("target transport error: {source}"))]
    Transport { source: reqwest::Error },

    /// The delivery did not complete within the target's timeout budget.
    #[snafu(display("target request timed out"))]
    Timeout,

    /// The target answered with a non-success status.
    #[snafu(display("target responded with status {status}: {body}"))]
    Status { status: u16, body: String },

    /// The config response did not match the expected shape.
    #[snafu(display("could not decode target config: {source}"))]
    Decode { source: reqwest::Error },

    /// The target's config names no dead letter queue to drain.
    #[snafu(display("no dead letter queue on target '{url}'"))]
    NoDeadLetterQueue { url: String },
}

/// Delivery configuration advertised by a target endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    #[serde(default)]
    pub dead_letter_queue_url: Option<String>,
    /// Per-delivery processing timeout, milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// How a message is handed to the target.
#[derive(Clone, Copy, Debug)]
pub enum InvocationMode {
    /// Fire-and-forget; the target acknowledges before processing.
    Event,
    /// Synchronous; the response carries the handler's output.
    RequestResponse,
}

impl InvocationMode {
    const fn header_value(self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::RequestResponse => "request-response",
        }
    }
}

/// Outcome of one accepted delivery.
#[derive(Debug)]
pub struct Delivery {
    /// Failure marker reported by the target's handler, when the target
    /// accepted the message but its handler failed on it.
    pub handler_error: Option<String>,
    /// Response payload; empty for event-mode deliveries.
    pub payload: String,
}

#[derive(Clone, Debug)]
pub struct TargetClient {
    http: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl TargetClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http,
            base_url,
            request_timeout: Duration::from_secs(11),
        }
    }

    /// Cap each delivery request at `timeout`, normally the target's own
    /// processing timeout plus headroom.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub async fn config(&self) -> Result<TargetConfig, TargetError> {
        let response = self
            .http
            .get(format!("{}/config", self.base_url))
            .send()
            .await
            .map_err(classify)?;
        check(response).await?.json().await.context(DecodeSnafu)
    }

    /// Deliver one message. A non-success status is an error (and will be
    /// retried by the pacing layer); an accepted delivery may still carry a
    /// handler failure marker, which the caller must not acknowledge.
    pub async fn deliver(
        &self,
        message: &Message,
        mode: InvocationMode,
    ) -> Result<Delivery, TargetError> {
        let response = self
            .http
            .post(format!("{}/invocations", self.base_url))
            .header("x-invocation-type", mode.header_value())
            .timeout(self.request_timeout)
            .body(message.body.clone())
            .send()
            .await
            .map_err(classify)?;
        let response = check(response).await?;
        let handler_error = response
            .headers()
            .get("x-handler-error")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let payload = response.text().await.unwrap_or_default();
        Ok(Delivery {
            handler_error,
            payload,
        })
    }
}

/// Write the synchronous delivery record for one message under `prefix`.
pub async fn write_delivery_log(
    prefix: &str,
    message: &Message,
    delivery: &Delivery,
) -> Result<(), std::io::Error> {
    let marker = delivery.handler_error.as_deref().unwrap_or("Success");
    let contents = format!("{}\n{marker}\n{}", message.message_id, delivery.payload);
    tokio::fs::write(format!("{prefix}{}.log", message.message_id), contents).await
}

/// Write the forwarding record for one message redriven to a queue.
pub async fn write_forward_log(
    prefix: &str,
    message: &Message,
    forwarded_id: &str,
) -> Result<(), std::io::Error> {
    tokio::fs::write(
        format!("{prefix}{}.log", message.message_id),
        format!("Redrive\n{forwarded_id}"),
    )
    .await
}

fn classify(error: reqwest::Error) -> TargetError {
    if error.is_timeout() {
        warn!(message = "Target request timed out.", %error);
        TargetError::Timeout
    } else {
        error!(message = "Target transport error.", %error);
        TargetError::Transport { source: error }
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, TargetError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "could not read error body".to_string());
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        warn!(message = "Target refused delivery.", status = %status, body = %body);
    } else {
        error!(message = "Target rejected delivery.", status = %status, body = %body);
    }
    Err(TargetError::Status {
        status: status.as_u16(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_parses_with_defaults() {
        let config: TargetConfig = serde_json::from_str("{}").unwrap();
        assert!(config.dead_letter_queue_url.is_none());
        assert!(config.timeout_ms.is_none());

        let config: TargetConfig = serde_json::from_str(
            r#"{"dead_letter_queue_url":"https://queues.example.com/orders-dlq","timeout_ms":30000}"#,
        )
        .unwrap();
        assert_eq!(
            config.dead_letter_queue_url.as_deref(),
            Some("https://queues.example.com/orders-dlq")
        );
        assert_eq!(config.timeout_ms, Some(30_000));
    }

    #[tokio::test]
    async fn delivery_logs_record_the_handler_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = format!("{}/run-", dir.path().display());
        let message = Message {
            message_id: "m-9".to_string(),
            body: "{}".to_string(),
            receipt_handle: None,
            attributes: serde_json::Map::new(),
        };

        let delivery = Delivery {
            handler_error: Some("Unhandled".to_string()),
            payload: "stack trace".to_string(),
        };
        write_delivery_log(&prefix, &message, &delivery).await.unwrap();
        let written = std::fs::read_to_string(format!("{prefix}m-9.log")).unwrap();
        assert_eq!(written, "m-9\nUnhandled\nstack trace");

        write_forward_log(&prefix, &message, "m-forwarded").await.unwrap();
        let written = std::fs::read_to_string(format!("{prefix}m-9.log")).unwrap();
        assert_eq!(written, "Redrive\nm-forwarded");
    }
}
