use anyhow::{Context as _, Result};
use async_nats::jetstream;
use chrono::Utc;
use deadpool_postgres::Pool;
use std::time::Duration;
use uuid::Uuid;

use flotilla_common::events::{EventType, ResourceEvent, headers, platform_type};

use crate::metrics;

/// Publishes lifecycle events onto the shared fan-out subject and appends
/// each one to the audit log.
///
/// Publishing is best-effort from the caller's perspective: failures are
/// logged and swallowed, never propagated into the originating request.
/// Controllers tolerate the resulting at-least-once, unordered delivery.
#[derive(Clone)]
pub struct Emitter {
    jetstream: jetstream::Context,
    pool: Pool,
    subject: String,
    publish_timeout: Duration,
}

impl Emitter {
    /// Connect the emitter, creating the underlying stream if needed.
    pub async fn new(
        client: async_nats::Client,
        pool: Pool,
        stream_name: &str,
        subject: &str,
        publish_timeout: Duration,
    ) -> Result<Self> {
        let jetstream = jetstream::new(client);

        let _stream = jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: stream_name.to_string(),
                subjects: vec![subject.to_string()],
                ..Default::default()
            })
            .await
            .context("failed to get or create event stream")?;
        tracing::info!(stream = %stream_name, subject = %subject, "connected to event stream");

        Ok(Emitter {
            jetstream,
            pool,
            subject: subject.to_string(),
            publish_timeout,
        })
    }

    /// Emit one lifecycle event carrying the resource's full current state.
    /// `spec` feeds the self-filtering attributes; `reason` is only set by
    /// the scheduler.
    pub async fn emit(
        &self,
        event_type: EventType,
        resource_id: Uuid,
        generation: i64,
        reason: Option<&str>,
        resource: serde_json::Value,
        spec: &serde_json::Value,
    ) {
        let event = ResourceEvent {
            event_type,
            resource_id,
            generation,
            emitted_at: Utc::now(),
            reason: reason.map(str::to_string),
            resource,
        };

        let payload = match serde_json::to_value(&event) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(%resource_id, "failed to serialize event: {e}");
                return;
            }
        };

        self.append_audit(&event, &payload).await;

        let mut header_map = async_nats::HeaderMap::new();
        header_map.insert(headers::EVENT_TYPE, event_type.as_str());
        header_map.insert(headers::RESOURCE_ID, resource_id.to_string().as_str());
        header_map.insert(headers::GENERATION, generation.to_string().as_str());
        if let Some(platform) = platform_type(spec) {
            header_map.insert(headers::PLATFORM_TYPE, platform);
        }

        let bytes: bytes::Bytes = payload.to_string().into_bytes().into();
        let publish = async {
            let ack = self
                .jetstream
                .publish_with_headers(self.subject.clone(), header_map, bytes)
                .await
                .context("failed to publish event")?;
            ack.await.context("failed to get publish ack")?;
            anyhow::Ok(())
        };

        match tokio::time::timeout(self.publish_timeout, publish).await {
            Ok(Ok(())) => {
                metrics::event_emitted(event_type.as_str());
                tracing::debug!(event = %event_type, %resource_id, generation, "event published");
            }
            Ok(Err(e)) => {
                metrics::publish_failed(event_type.as_str());
                tracing::warn!(event = %event_type, %resource_id, "publish failed: {e:#}");
            }
            Err(_) => {
                metrics::publish_failed(event_type.as_str());
                tracing::warn!(event = %event_type, %resource_id, "publish timed out");
            }
        }
    }

    /// Append the event to the `cluster_events` audit table. Same swallow
    /// policy as publishing.
    async fn append_audit(&self, event: &ResourceEvent, payload: &serde_json::Value) {
        let result = async {
            let client = self
                .pool
                .get()
                .await
                .context("failed to get db connection")?;
            client
                .execute(
                    r#"
                    INSERT INTO cluster_events (event_type, resource_id, generation, payload, emitted_at)
                    VALUES ($1, $2, $3, $4, $5)
                    "#,
                    &[
                        &event.event_type.as_str(),
                        &event.resource_id,
                        &event.generation,
                        payload,
                        &event.emitted_at,
                    ],
                )
                .await
                .context("failed to insert audit row")?;
            anyhow::Ok(())
        }
        .await;

        if let Err(e) = result {
            metrics::db_error("append_audit");
            tracing::warn!(resource_id = %event.resource_id, "audit append failed: {e:#}");
        }
    }
}
