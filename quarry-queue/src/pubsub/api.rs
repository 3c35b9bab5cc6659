//! Pub/Sub REST endpoints and wire types

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{QueueError, Result};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SubscriptionList {
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionInfo>,

    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SubscriptionInfo {
    /// Fully qualified, `projects/<project>/subscriptions/<name>`
    pub name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    max_messages: usize,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PullResponse {
    #[serde(default)]
    pub received_messages: Vec<ReceivedMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ReceivedMessage {
    pub ack_id: String,
    pub message: PubsubMessage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PubsubMessage {
    #[serde(default)]
    pub data: String,

    #[serde(default)]
    pub message_id: String,
}

impl PubsubMessage {
    pub fn decode(&self) -> Result<Bytes> {
        STANDARD
            .decode(&self.data)
            .map(Bytes::from)
            .map_err(|e| QueueError::Decode {
                what: "message data",
                message: e.to_string(),
            })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AcknowledgeRequest<'a> {
    ack_ids: &'a [String],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModifyAckDeadlineRequest<'a> {
    ack_ids: &'a [String],
    ack_deadline_seconds: u64,
}

#[derive(Debug, Serialize)]
struct PublishRequest {
    messages: Vec<OutgoingMessage>,
}

#[derive(Debug, Serialize)]
struct OutgoingMessage {
    data: String,

    #[serde(skip_serializing_if = "HashMap::is_empty")]
    attributes: HashMap<String, String>,
}

/// Thin REST client for one project
#[derive(Debug, Clone)]
pub(crate) struct PubSubClient {
    base_url: String,
    project: String,
    token: Option<String>,
    client: Client,
}

impl PubSubClient {
    pub fn new(base_url: &str, project: &str, token: Option<String>, client: Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            project: project.to_string(),
            token,
            client,
        }
    }

    pub fn subscription_path(&self, name: &str) -> String {
        format!("projects/{}/subscriptions/{}", self.project, name)
    }

    pub fn topic_path(&self, name: &str) -> String {
        format!("projects/{}/topics/{}", self.project, name)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(
        &self,
        operation: &'static str,
        target: &str,
        request: RequestBuilder,
    ) -> Result<Response> {
        self.authorize(request)
            .send()
            .await
            .map_err(|source| QueueError::Transport {
                operation,
                target: target.to_string(),
                source,
            })
    }

    /// Lists one page of subscriptions
    pub async fn list_subscriptions(&self, page_token: Option<&str>) -> Result<SubscriptionList> {
        let target = format!("projects/{}/subscriptions", self.project);
        let mut request = self.client.get(self.url(&target));
        if let Some(page_token) = page_token {
            request = request.query(&[("pageToken", page_token)]);
        }
        let response = self.send("refresh", &target, request).await?;
        handle_response("refresh", &target, response).await
    }

    /// Whether the subscription exists
    pub async fn subscription_exists(&self, name: &str) -> Result<bool> {
        let target = self.subscription_path(name);
        let response = self
            .send("exists", &target, self.client.get(self.url(&target)))
            .await?;
        exists_from(response.status(), "exists", &target, response).await
    }

    pub async fn topic_exists(&self, name: &str) -> Result<bool> {
        let target = self.topic_path(name);
        let response = self
            .send("responder", &target, self.client.get(self.url(&target)))
            .await?;
        exists_from(response.status(), "responder", &target, response).await
    }

    /// Long-polls for up to `max` messages, waiting at most `wait`
    pub async fn pull(&self, subscription: &str, max: usize, wait: Duration) -> Result<PullResponse> {
        let target = self.subscription_path(subscription);
        let request = self
            .client
            .post(self.url(&format!("{}:pull", target)))
            .timeout(wait)
            .json(&PullRequest { max_messages: max });
        let response = self.send("pull", &target, request).await?;
        handle_response("pull", &target, response).await
    }

    pub async fn acknowledge(&self, subscription: &str, ack_ids: &[String]) -> Result<()> {
        let target = self.subscription_path(subscription);
        let request = self
            .client
            .post(self.url(&format!("{}:acknowledge", target)))
            .json(&AcknowledgeRequest { ack_ids });
        let response = self.send("ack", &target, request).await?;
        handle_empty_response("ack", &target, response).await
    }

    /// Sets a new lease on the messages; a deadline of zero returns them immediately
    pub async fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_ids: &[String],
        seconds: u64,
    ) -> Result<()> {
        let target = self.subscription_path(subscription);
        let request = self
            .client
            .post(self.url(&format!("{}:modifyAckDeadline", target)))
            .json(&ModifyAckDeadlineRequest {
                ack_ids,
                ack_deadline_seconds: seconds,
            });
        let response = self.send("modifyAckDeadline", &target, request).await?;
        handle_empty_response("modifyAckDeadline", &target, response).await
    }

    pub async fn publish(&self, topic: &str, data: &[u8]) -> Result<()> {
        let target = self.topic_path(topic);
        let request = self
            .client
            .post(self.url(&format!("{}:publish", target)))
            .json(&publish_body(data));
        let response = self.send("publish", &target, request).await?;
        handle_empty_response("publish", &target, response).await
    }
}

fn publish_body(data: &[u8]) -> PublishRequest {
    PublishRequest {
        messages: vec![OutgoingMessage {
            data: STANDARD.encode(data),
            attributes: HashMap::new(),
        }],
    }
}

async fn exists_from(
    status: StatusCode,
    operation: &'static str,
    target: &str,
    response: Response,
) -> Result<bool> {
    if status == StatusCode::NOT_FOUND {
        return Ok(false);
    }
    handle_empty_response(operation, target, response).await?;
    Ok(true)
}

async fn api_error(operation: &'static str, target: &str, response: Response) -> QueueError {
    let status = response.status().as_u16();
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    QueueError::Api {
        operation,
        target: target.to_string(),
        status,
        message: error_message(&message),
    }
}

/// Extracts `error.message` from a Google API error body, falling back to the raw text
fn error_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct Envelope {
        error: Detail,
    }

    #[derive(Deserialize)]
    struct Detail {
        message: String,
    }

    serde_json::from_str::<Envelope>(body)
        .map(|envelope| envelope.error.message)
        .unwrap_or_else(|_| body.trim().to_string())
}

async fn handle_response<T: DeserializeOwned>(
    operation: &'static str,
    target: &str,
    response: Response,
) -> Result<T> {
    if !response.status().is_success() {
        return Err(api_error(operation, target, response).await);
    }

    let body = response.bytes().await.map_err(|source| QueueError::Transport {
        operation,
        target: target.to_string(),
        source,
    })?;
    serde_json::from_slice(&body).map_err(|e| QueueError::Decode {
        what: "response body",
        message: format!("{} for {}: {}", operation, target, e),
    })
}

async fn handle_empty_response(
    operation: &'static str,
    target: &str,
    response: Response,
) -> Result<()> {
    if !response.status().is_success() {
        return Err(api_error(operation, target, response).await);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> PubSubClient {
        PubSubClient::new(
            "http://localhost:8085/v1/",
            "proj",
            None,
            Client::new(),
        )
    }

    #[test]
    fn test_resource_paths() {
        let client = client();
        assert_eq!(client.subscription_path("train"), "projects/proj/subscriptions/train");
        assert_eq!(client.topic_path("train_response"), "projects/proj/topics/train_response");
        assert_eq!(
            client.url(&client.subscription_path("train")),
            "http://localhost:8085/v1/projects/proj/subscriptions/train"
        );
    }

    #[test]
    fn test_pull_response_parsing() {
        let body = r#"{
            "receivedMessages": [
                {
                    "ackId": "ack-1",
                    "message": {
                        "data": "aGVsbG8=",
                        "messageId": "42",
                        "publishTime": "2024-01-01T00:00:00Z"
                    }
                }
            ]
        }"#;
        let parsed: PullResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.received_messages.len(), 1);
        let received = &parsed.received_messages[0];
        assert_eq!(received.ack_id, "ack-1");
        assert_eq!(received.message.message_id, "42");
        assert_eq!(received.message.decode().unwrap().as_ref(), b"hello");

        let empty: PullResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.received_messages.is_empty());
    }

    #[test]
    fn test_invalid_base64_is_decode_error() {
        let message = PubsubMessage {
            data: "!!not base64!!".to_string(),
            message_id: "1".to_string(),
        };
        assert!(matches!(
            message.decode(),
            Err(QueueError::Decode { what: "message data", .. })
        ));
    }

    #[test]
    fn test_subscription_list_parsing() {
        let body = r#"{
            "subscriptions": [
                {"name": "projects/proj/subscriptions/a", "topic": "projects/proj/topics/a"},
                {"name": "projects/proj/subscriptions/b"}
            ],
            "nextPageToken": "page-2"
        }"#;
        let parsed: SubscriptionList = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.subscriptions.len(), 2);
        assert_eq!(parsed.next_page_token.as_deref(), Some("page-2"));
    }

    #[test]
    fn test_request_bodies() {
        let ids = vec!["a".to_string(), "b".to_string()];
        let body = serde_json::to_value(ModifyAckDeadlineRequest {
            ack_ids: &ids,
            ack_deadline_seconds: 0,
        })
        .unwrap();
        assert_eq!(body["ackIds"][1], "b");
        assert_eq!(body["ackDeadlineSeconds"], 0);

        let body = serde_json::to_value(publish_body(b"hello")).unwrap();
        assert_eq!(body["messages"][0]["data"], "aGVsbG8=");
        assert!(body["messages"][0].get("attributes").is_none());
    }

    #[test]
    fn test_error_message_extraction() {
        let body = r#"{"error": {"code": 404, "message": "Resource not found", "status": "NOT_FOUND"}}"#;
        assert_eq!(error_message(body), "Resource not found");
        assert_eq!(error_message("  upstream timeout\n"), "upstream timeout");
    }
}
