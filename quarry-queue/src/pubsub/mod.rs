//! Google Cloud Pub/Sub backend over the REST API
//!
//! A fresh client is built for every call from the configured credential
//! reference, so a rotated token file is picked up without restarting.

mod api;

use async_trait::async_trait;
use bytes::Bytes;
use quarry_core::{PayloadWrapper, QueueType, Report, TaskEnvelope, short_name};
use regex::Regex;
use reqwest::Client;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch;
use crate::error::{QueueError, Result};
use crate::queue::{TaskQueue, WorkOutcome, WorkSettings, bounded, matches_filters};
use crate::receive::{Delivery, MessageSource};
use crate::responder::{encode_report, spawn_forwarder};
use api::PubSubClient;

/// Production REST endpoint
pub const DEFAULT_ENDPOINT: &str = "https://pubsub.googleapis.com/v1";

/// Topic suffix reports for a subscription are published to
pub const RESPONSE_SUFFIX: &str = "_response";

/// Longest a single pull waits for messages
const PULL_WAIT: Duration = Duration::from_secs(10);

/// Lease bounds accepted by `modifyAckDeadline`
const MIN_LEASE_SECS: u64 = 10;
const MAX_LEASE_SECS: u64 = 600;

#[derive(Debug, Clone)]
pub struct PubSubConfig {
    /// REST base URL, `http://<emulator>/v1` when running against the emulator
    pub endpoint: String,

    /// Bound applied to discovery calls
    pub op_timeout: Duration,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            op_timeout: Duration::from_secs(5),
        }
    }
}

/// `TaskQueue` over one Pub/Sub project
pub struct PubSub {
    project: String,
    credentials: String,
    config: PubSubConfig,
    http: Client,
}

impl PubSub {
    pub fn new(project: &str, credentials: &str, config: PubSubConfig) -> Self {
        Self {
            project: project.to_string(),
            credentials: credentials.to_string(),
            config,
            http: Client::new(),
        }
    }

    async fn connect(&self) -> Result<PubSubClient> {
        let token = load_token(&self.credentials)
            .await
            .map_err(|message| QueueError::Connect {
                project: self.project.clone(),
                message,
            })?;
        Ok(PubSubClient::new(
            &self.config.endpoint,
            &self.project,
            token,
            self.http.clone(),
        ))
    }
}

/// Reads the bearer token a credential reference points at
///
/// An empty reference means unauthenticated access.
async fn load_token(credentials: &str) -> std::result::Result<Option<String>, String> {
    if credentials.is_empty() {
        return Ok(None);
    }
    let raw = tokio::fs::read_to_string(Path::new(credentials))
        .await
        .map_err(|e| format!("failed to read credentials {}: {}", credentials, e))?;
    let token = raw.trim();
    if token.is_empty() {
        return Err(format!("credentials file {} is empty", credentials));
    }
    Ok(Some(token.to_string()))
}

/// Clamps a lease to what the service accepts
fn lease_seconds(lease: Duration) -> u64 {
    lease.as_secs().clamp(MIN_LEASE_SECS, MAX_LEASE_SECS)
}

#[async_trait]
impl TaskQueue for PubSub {
    fn queue_type(&self) -> QueueType {
        QueueType::PubSub
    }

    async fn refresh(
        &self,
        ctx: &CancellationToken,
        matcher: Option<&Regex>,
        mismatcher: Option<&Regex>,
    ) -> Result<BTreeSet<String>> {
        let client = self.connect().await?;
        bounded(ctx, self.config.op_timeout, "refresh", async {
            let mut known = BTreeSet::new();
            let mut page_token: Option<String> = None;
            loop {
                let page = client.list_subscriptions(page_token.as_deref()).await?;
                for subscription in page.subscriptions {
                    let name = short_name(&subscription.name);
                    if matches_filters(name, matcher, mismatcher) {
                        known.insert(name.to_string());
                    }
                }
                match page.next_page_token {
                    Some(next) if !next.is_empty() => page_token = Some(next),
                    _ => break,
                }
            }
            Ok::<_, QueueError>(known)
        })
        .await
    }

    async fn exists(&self, ctx: &CancellationToken, subscription: &str) -> Result<bool> {
        let client = self.connect().await?;
        let name = short_name(subscription);
        bounded(
            ctx,
            self.config.op_timeout,
            "exists",
            client.subscription_exists(name),
        )
        .await
    }

    async fn has_work(&self, _ctx: &CancellationToken, _subscription: &str) -> Result<bool> {
        // No peek primitive; let `work` find out
        Ok(true)
    }

    async fn work(
        &self,
        ctx: &CancellationToken,
        settings: &WorkSettings,
        task: &TaskEnvelope,
    ) -> Result<WorkOutcome> {
        let client = self.connect().await?;
        let subscription = short_name(&task.subscription).to_string();

        let found = bounded(
            ctx,
            self.config.op_timeout,
            "work",
            client.subscription_exists(&subscription),
        )
        .await?;
        if !found {
            return Err(QueueError::discovery(
                "work",
                client.subscription_path(&subscription),
                "subscription does not exist",
            ));
        }

        debug!(project = %self.project, subscription = %subscription, "Receiving from Pub/Sub");

        let source = PubSubSource {
            client: Arc::new(client),
            subscription,
        };
        dispatch::work(&source, ctx, settings, task).await
    }

    async fn responder(
        &self,
        ctx: &CancellationToken,
        subscription: &str,
        wrapper: Option<Arc<dyn PayloadWrapper>>,
    ) -> Result<mpsc::Sender<Report>> {
        let client = self.connect().await?;
        let topic = format!("{}{}", short_name(subscription), RESPONSE_SUFFIX);

        let found = bounded(
            ctx,
            self.config.op_timeout,
            "responder",
            client.topic_exists(&topic),
        )
        .await?;
        if !found {
            return Err(QueueError::discovery(
                "responder",
                client.topic_path(&topic),
                "response topic does not exist",
            ));
        }

        info!(topic = %client.topic_path(&topic), "Opened Pub/Sub responder");
        let client = Arc::new(client);
        Ok(spawn_forwarder(subscription.to_string(), move |report| {
            let client = Arc::clone(&client);
            let topic = topic.clone();
            let wrapper = wrapper.clone();
            async move {
                let body = encode_report(&report, wrapper.as_deref())?;
                client.publish(&topic, &body).await
            }
        }))
    }
}

struct PubSubSource {
    client: Arc<PubSubClient>,
    subscription: String,
}

#[async_trait]
impl MessageSource for PubSubSource {
    async fn pull(&self, max: usize) -> Result<Vec<Box<dyn Delivery>>> {
        let response = match self.client.pull(&self.subscription, max, PULL_WAIT).await {
            Ok(response) => response,
            // An expired long poll found nothing to deliver
            Err(QueueError::Transport { source, .. }) if source.is_timeout() => {
                debug!(subscription = %self.subscription, "Pull wait elapsed");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let mut batch: Vec<Box<dyn Delivery>> = Vec::with_capacity(response.received_messages.len());
        for received in response.received_messages {
            let data = match received.message.decode() {
                Ok(data) => data,
                Err(e) => {
                    warn!(
                        subscription = %self.subscription,
                        message_id = %received.message.message_id,
                        error = %e,
                        "Undecodable message, returning it"
                    );
                    let ack_ids = [received.ack_id];
                    if let Err(e) = self
                        .client
                        .modify_ack_deadline(&self.subscription, &ack_ids, 0)
                        .await
                    {
                        warn!(error = %e, "Failed to return undecodable message");
                    }
                    continue;
                }
            };

            batch.push(Box::new(PubSubDelivery {
                client: Arc::clone(&self.client),
                subscription: self.subscription.clone(),
                ack_ids: vec![received.ack_id],
                id: received.message.message_id,
                data,
            }));
        }
        Ok(batch)
    }
}

struct PubSubDelivery {
    client: Arc<PubSubClient>,
    subscription: String,
    ack_ids: Vec<String>,
    id: String,
    data: Bytes,
}

#[async_trait]
impl Delivery for PubSubDelivery {
    fn id(&self) -> &str {
        &self.id
    }

    fn data(&self) -> &Bytes {
        &self.data
    }

    async fn ack(&self) -> Result<()> {
        self.client.acknowledge(&self.subscription, &self.ack_ids).await
    }

    async fn nack(&self) -> Result<()> {
        self.client
            .modify_ack_deadline(&self.subscription, &self.ack_ids, 0)
            .await
    }

    async fn extend(&self, lease: Duration) -> Result<()> {
        self.client
            .modify_ack_deadline(&self.subscription, &self.ack_ids, lease_seconds(lease))
            .await
    }
}
