//! JSON-over-HTTP queue collaborator.
//!
//! The queue speaks a small JSON protocol rooted at a base URL:
//! `POST {base}/messages/receive` long-polls for a page of messages,
//! `POST {base}/messages/delete` acknowledges one message,
//! `POST {base}/messages/send` enqueues one, and `GET {base}/attributes`
//! describes the queue, including the redrive policy naming its dead letter
//! queue. Delivery is at-least-once; anything pulled but not deleted before
//! its visibility timeout comes back.

use std::time::Duration;

use async_trait::async_trait;
use redrive_core::source::PageFetch;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

/// One message as carried by the queue protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_handle: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum QueueError {
    /// Transport-level failure talking to the queue.
    #[snafu(display("queue transport error: {source}"))]
    Transport { source: reqwest::Error },

    /// The request did not complete within the client-side cap.
    #[snafu(display("queue request timed out"))]
    Timeout,

    /// The queue answered with a non-success status.
    #[snafu(display("queue responded with status {status}: {body}"))]
    Status { status: u16, body: String },

    /// The response body did not match the protocol shape.
    #[snafu(display("could not decode queue response: {source}"))]
    Decode { source: reqwest::Error },

    /// The queue has no redrive policy to discover a dead letter queue from.
    #[snafu(display("no redrive policy on queue '{url}'"))]
    NoRedrivePolicy { url: String },

    /// The redrive policy names no dead letter target.
    #[snafu(display("no dead letter target on queue '{url}'"))]
    NoDeadLetterTarget { url: String },
}

#[derive(Debug, Serialize)]
struct ReceiveRequest {
    max_messages: usize,
    wait_time_ms: u64,
    visibility_timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
struct ReceiveResponse {
    #[serde(default)]
    messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
struct DeleteRequest<'a> {
    receipt_handle: &'a str,
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    body: &'a str,
    attributes: &'a serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    message_id: String,
}

/// Queue attributes returned by `GET {base}/attributes`.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueAttributes {
    #[serde(default)]
    pub redrive_policy: Option<RedrivePolicy>,
    #[serde(default)]
    pub default_visibility_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedrivePolicy {
    #[serde(default)]
    pub dead_letter_target_url: Option<String>,
}

/// Client for one queue base URL. Cloning shares the underlying pool.
#[derive(Clone, Debug)]
pub struct QueueClient {
    http: reqwest::Client,
    base_url: String,
}

impl QueueClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    pub fn url(&self) -> &str {
        &self.base_url
    }

    /// Long-poll for up to `max_messages` messages, waiting at most
    /// `max_wait` server-side.
    pub async fn receive(
        &self,
        max_messages: usize,
        max_wait: Duration,
        visibility_timeout: Duration,
    ) -> Result<Vec<Message>, QueueError> {
        let request = ReceiveRequest {
            max_messages,
            wait_time_ms: max_wait.as_millis() as u64,
            visibility_timeout_ms: visibility_timeout.as_millis() as u64,
        };
        // The server holds the request for the full wait; pad the client cap
        // so the long poll is never cut off locally.
        let response: ReceiveResponse = self
            .post_json(
                "/messages/receive",
                &request,
                Some(max_wait + Duration::from_secs(5)),
            )
            .await?;
        Ok(response.messages)
    }

    /// Acknowledge one message so it is never delivered again.
    pub async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.post("/messages/delete", &DeleteRequest { receipt_handle }, None)
            .await?;
        Ok(())
    }

    /// Enqueue `message`'s body and attributes, returning the new message id.
    pub async fn send(&self, message: &Message) -> Result<String, QueueError> {
        let request = SendRequest {
            body: &message.body,
            attributes: &message.attributes,
        };
        let response: SendResponse = self.post_json("/messages/send", &request, None).await?;
        Ok(response.message_id)
    }

    pub async fn attributes(&self) -> Result<QueueAttributes, QueueError> {
        let response = self
            .http
            .get(format!("{}/attributes", self.base_url))
            .send()
            .await
            .map_err(classify)?;
        check(response).await?.json().await.context(DecodeSnafu)
    }

    async fn post(
        &self,
        path: &str,
        payload: &impl Serialize,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response, QueueError> {
        let mut request = self
            .http
            .post(format!("{}{path}", self.base_url))
            .json(payload);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request.send().await.map_err(classify)?;
        check(response).await
    }

    async fn post_json<R: DeserializeOwned>(
        &self,
        path: &str,
        payload: &impl Serialize,
        timeout: Option<Duration>,
    ) -> Result<R, QueueError> {
        self.post(path, payload, timeout)
            .await?
            .json()
            .await
            .context(DecodeSnafu)
    }
}

/// One receive cursor over a dead letter queue.
///
/// A cursor keeps exactly one receive in flight, so a campaign runs many
/// cursors against the same queue to overlap round trips.
pub struct QueueCursor {
    client: QueueClient,
    visibility_timeout: Duration,
}

impl QueueCursor {
    pub fn new(client: QueueClient, visibility_timeout: Duration) -> Self {
        Self {
            client,
            visibility_timeout,
        }
    }
}

#[async_trait]
impl PageFetch for QueueCursor {
    type Item = Message;

    async fn fetch(
        &mut self,
        max_items: usize,
        max_wait: Duration,
    ) -> Result<Vec<Message>, redrive_core::Error> {
        let page = self
            .client
            .receive(max_items, max_wait, self.visibility_timeout)
            .await?;
        Ok(page)
    }
}

fn classify(error: reqwest::Error) -> QueueError {
    if error.is_timeout() {
        warn!(message = "Queue request timed out.", %error);
        QueueError::Timeout
    } else {
        error!(message = "Queue transport error.", %error);
        QueueError::Transport { source: error }
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, QueueError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "could not read error body".to_string());
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        warn!(message = "Queue server error.", status = %status, body = %body);
    } else {
        error!(message = "Queue request rejected.", status = %status, body = %body);
    }
    Err(QueueError::Status {
        status: status.as_u16(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receive_response_tolerates_missing_fields() {
        let response: ReceiveResponse = serde_json::from_str("{}").unwrap();
        assert!(response.messages.is_empty());

        let response: ReceiveResponse = serde_json::from_str(
            r#"{"messages":[{"message_id":"m-1","body":"{\"order\":17}"}]}"#,
        )
        .unwrap();
        assert_eq!(response.messages.len(), 1);
        assert_eq!(response.messages[0].message_id, "m-1");
        assert!(response.messages[0].receipt_handle.is_none());
    }

    #[test]
    fn message_serialization_omits_empty_fields() {
        let message = Message {
            message_id: "m-1".to_string(),
            body: "{}".to_string(),
            receipt_handle: None,
            attributes: serde_json::Map::new(),
        };
        assert_eq!(
            serde_json::to_string(&message).unwrap(),
            r#"{"message_id":"m-1","body":"{}"}"#
        );
    }

    #[test]
    fn attributes_parse_with_and_without_redrive_policy() {
        let attributes: QueueAttributes = serde_json::from_str("{}").unwrap();
        assert!(attributes.redrive_policy.is_none());

        let attributes: QueueAttributes = serde_json::from_str(
            r#"{"redrive_policy":{"dead_letter_target_url":"https://queues.example.com/orders-dlq"},
                "default_visibility_timeout_ms":30000}"#,
        )
        .unwrap();
        let policy = attributes.redrive_policy.unwrap();
        assert_eq!(
            policy.dead_letter_target_url.as_deref(),
            Some("https://queues.example.com/orders-dlq")
        );
        assert_eq!(attributes.default_visibility_timeout_ms, Some(30_000));
    }

    #[test]
    fn base_url_is_normalized() {
        let client = QueueClient::new(reqwest::Client::new(), "https://queues.example.com/dlq/");
        assert_eq!(client.url(), "https://queues.example.com/dlq");
    }
}
