use crate::config::NatsConfig;
use crate::correlator::{ResultFeed, ResultSource};
use crate::dispatch::TaskQueue;
use crate::health::HeartbeatSource;
use anyhow::{anyhow, Context, Result};
use async_nats::jetstream::{self, consumer, kv, stream};
use async_nats::Client;
use futures::stream::{StreamExt, TryStreamExt};
use std::time::Duration;
use tracing::{debug, info};

/// Upper bound on backlog entries fetched per request
const BACKLOG_BATCH: usize = 256;

/// NATS connection serving the queue backend
///
/// - task log: JetStream work-queue stream holding at most `max_stream_len`
///   unconsumed tasks
/// - result topics: core subjects `<prefix>.<session>`, captured by a
///   JetStream stream that doubles as the replay backlog
/// - worker heartbeats: key-value bucket whose entries expire
pub struct NatsClient {
    client: Client,
    jetstream: jetstream::Context,
    heartbeats: kv::Store,
    config: NatsConfig,
}

impl NatsClient {
    /// Connect to NATS and make sure streams and buckets exist
    pub async fn connect(config: &NatsConfig) -> Result<Self> {
        info!("Connecting to NATS at {}", config.url);

        let client = async_nats::connect(config.url.as_str())
            .await
            .context("Failed to connect to NATS")?;
        let jetstream = jetstream::new(client.clone());

        jetstream
            .get_or_create_stream(stream::Config {
                name: config.task_stream.clone(),
                subjects: vec![config.task_subject.clone()],
                // Consumed tasks leave the stream, so depth counts pending work.
                // A full stream refuses new tasks instead of evicting old ones.
                retention: stream::RetentionPolicy::WorkQueue,
                max_messages: config.max_stream_len,
                discard: stream::DiscardPolicy::New,
                ..Default::default()
            })
            .await
            .context("Failed to create task stream")?;

        jetstream
            .get_or_create_stream(stream::Config {
                name: config.result_stream.clone(),
                subjects: vec![format!("{}.>", config.result_subject_prefix)],
                max_age: Duration::from_secs(config.result_retention_secs),
                ..Default::default()
            })
            .await
            .context("Failed to create result stream")?;

        let heartbeats = match jetstream.get_key_value(config.heartbeat_bucket.clone()).await {
            Ok(store) => store,
            Err(_) => jetstream
                .create_key_value(kv::Config {
                    bucket: config.heartbeat_bucket.clone(),
                    history: 1,
                    max_age: Duration::from_secs(config.heartbeat_ttl_secs),
                    ..Default::default()
                })
                .await
                .context("Failed to create heartbeat bucket")?,
        };

        info!("Connected to NATS successfully");

        Ok(Self {
            client,
            jetstream,
            heartbeats,
            config: config.clone(),
        })
    }

    /// Subject carrying the results of one session
    pub fn result_subject(&self, session_id: &str) -> String {
        format!(
            "{}.{}",
            self.config.result_subject_prefix,
            subject_token(session_id)
        )
    }
}

/// Turn a session ID into a single subject token
pub fn subject_token(session_id: &str) -> String {
    let token: String = session_id
        .chars()
        .map(|c| match c {
            '.' | '*' | '>' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect();

    if token.is_empty() {
        "_".to_string()
    } else {
        token
    }
}

#[async_trait::async_trait]
impl TaskQueue for NatsClient {
    async fn depth(&self) -> Result<u64> {
        let mut stream = self
            .jetstream
            .get_stream(&self.config.task_stream)
            .await
            .context("Failed to look up task stream")?;
        let info = stream.info().await.context("Failed to read task stream info")?;
        Ok(info.state.messages)
    }

    async fn append(&self, payload: Vec<u8>) -> Result<()> {
        self.jetstream
            .publish(self.config.task_subject.clone(), payload.into())
            .await
            .context("Failed to publish task")?
            .await
            .context("Task was not acknowledged")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ResultSource for NatsClient {
    async fn live(&self, session_id: &str) -> Result<ResultFeed> {
        let subject = self.result_subject(session_id);
        let subscriber = self
            .client
            .subscribe(subject.clone())
            .await
            .context("Failed to subscribe to results")?;

        debug!("Subscribed to {}", subject);

        Ok(subscriber.map(|msg| msg.payload.to_vec()).boxed())
    }

    async fn backlog(&self, session_id: &str) -> Result<Vec<Vec<u8>>> {
        let stream = self
            .jetstream
            .get_stream(&self.config.result_stream)
            .await
            .context("Failed to look up result stream")?;

        let consumer = stream
            .create_consumer(consumer::pull::Config {
                filter_subject: self.result_subject(session_id),
                deliver_policy: consumer::DeliverPolicy::All,
                ack_policy: consumer::AckPolicy::None,
                inactive_threshold: Duration::from_secs(30),
                ..Default::default()
            })
            .await
            .context("Failed to create backlog consumer")?;

        let mut remaining = consumer.cached_info().num_pending as usize;
        let mut entries = Vec::with_capacity(remaining);

        while remaining > 0 {
            let mut batch = consumer
                .fetch()
                .max_messages(remaining.min(BACKLOG_BATCH))
                .messages()
                .await
                .map_err(|e| anyhow!("Failed to fetch stored results: {}", e))?;

            let mut fetched = 0;
            while let Some(msg) = batch.next().await {
                let msg = msg.map_err(|e| anyhow!("Failed to read stored result: {}", e))?;
                entries.push(msg.message.payload.to_vec());
                fetched += 1;
            }

            if fetched == 0 {
                break;
            }
            remaining = remaining.saturating_sub(fetched);
        }

        let name = consumer.cached_info().name.clone();
        if let Err(e) = stream.delete_consumer(&name).await {
            debug!("Failed to delete backlog consumer {}: {}", name, e);
        }

        Ok(entries)
    }
}

#[async_trait::async_trait]
impl HeartbeatSource for NatsClient {
    async fn live_workers(&self) -> Result<usize> {
        let keys: Vec<String> = self
            .heartbeats
            .keys()
            .await
            .context("Failed to list worker heartbeats")?
            .try_collect()
            .await
            .context("Failed to read worker heartbeats")?;
        Ok(keys.len())
    }
}
