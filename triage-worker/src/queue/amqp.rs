//! RabbitMQ backend for the job queue.
//!
//! Jobs are persistent JSON messages on the durable `email-processing` queue.
//! Completion and failure events go to the `email-processing.events` fanout
//! exchange; every subscriber binds its own exclusive queue to it.
//!
//! Unacknowledged deliveries are requeued by the broker when a worker's
//! channel closes, which is what makes delivery at-least-once.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{error, info, warn};

use super::types::{Job, JobEvent, JobId, JobPayload, EVENTS_EXCHANGE, JOB_QUEUE};
use super::{ClaimedJob, Disposition, JobQueue, Receipt, RedeliveryPolicy, Subscription};
use crate::error::QueueError;

/// RabbitMQ-backed [`JobQueue`] with connection management.
///
/// Keeps one persistent connection and channel, reconnecting on demand.
#[derive(Clone)]
pub struct AmqpQueue {
    inner: Arc<AmqpInner>,
}

struct AmqpInner {
    url: String,
    prefetch: u16,
    policy: RedeliveryPolicy,
    connection: RwLock<Option<Connection>>,
    channel: RwLock<Option<Channel>>,
    consumer: Mutex<Option<Consumer>>,
}

fn unavailable(context: &'static str) -> impl FnOnce(lapin::Error) -> QueueError {
    move |e| QueueError::Unavailable(format!("{context}: {e}"))
}

impl AmqpQueue {
    /// Create a queue client for the given RabbitMQ URL.
    ///
    /// `prefetch` bounds how many unacknowledged jobs this process holds.
    pub fn new(url: String, prefetch: u16, policy: RedeliveryPolicy) -> Self {
        Self {
            inner: Arc::new(AmqpInner {
                url,
                prefetch: prefetch.max(1),
                policy,
                connection: RwLock::new(None),
                channel: RwLock::new(None),
                consumer: Mutex::new(None),
            }),
        }
    }

    /// Close the connection gracefully.
    pub async fn close(&self) {
        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        if let Some(ch) = channel.take() {
            if let Err(e) = ch.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_channel_close_error");
            }
        }

        if let Some(conn) = connection.take() {
            if let Err(e) = conn.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_connection_close_error");
            }
        }

        info!("rabbitmq_queue_closed");
    }
}

impl AmqpInner {
    /// Ensure we have a valid connection and channel.
    async fn ensure_connected(&self) -> Result<Channel, QueueError> {
        {
            let channel = self.channel.read().await;
            if let Some(ch) = channel.as_ref() {
                if ch.status().connected() {
                    return Ok(ch.clone());
                }
            }
        }

        let mut connection = self.connection.write().await;
        let mut channel = self.channel.write().await;

        // Double-check after acquiring write lock
        if let Some(ch) = channel.as_ref() {
            if ch.status().connected() {
                return Ok(ch.clone());
            }
        }

        info!("rabbitmq_connecting");

        let conn = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(unavailable("Failed to connect to RabbitMQ"))?;

        info!("rabbitmq_connected");

        let ch = conn
            .create_channel()
            .await
            .map_err(unavailable("Failed to create channel"))?;

        ch.confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(unavailable("Failed to enable publisher confirms"))?;

        ch.basic_qos(self.prefetch, BasicQosOptions::default())
            .await
            .map_err(unavailable("Failed to set QoS"))?;

        // Declarations are idempotent
        ch.queue_declare(
            JOB_QUEUE,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(unavailable("Failed to declare job queue"))?;

        ch.exchange_declare(
            EVENTS_EXCHANGE,
            ExchangeKind::Fanout,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(unavailable("Failed to declare events exchange"))?;

        info!(
            job_queue = JOB_QUEUE,
            events_exchange = EVENTS_EXCHANGE,
            prefetch_count = self.prefetch,
            "rabbitmq_topology_declared"
        );

        *connection = Some(conn);
        *channel = Some(ch.clone());

        Ok(ch)
    }

    /// Publish a persistent JSON message and wait for the broker's confirm.
    async fn publish<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        message_id: &str,
        value: &T,
    ) -> Result<(), QueueError> {
        let channel = self.ensure_connected().await?;
        let body = serde_json::to_vec(value)?;

        let confirmation = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default()
                    .with_delivery_mode(2) // Persistent
                    .with_content_type("application/json".into())
                    .with_message_id(message_id.to_string().into()),
            )
            .await
            .map_err(unavailable("Failed to publish"))?
            .await
            .map_err(unavailable("Failed to confirm publish"))?;

        if confirmation.is_nack() {
            return Err(QueueError::Unavailable(format!(
                "broker rejected message {message_id}"
            )));
        }

        Ok(())
    }

    async fn publish_job(&self, job: &Job) -> Result<(), QueueError> {
        self.publish("", JOB_QUEUE, job.id.as_str(), job).await
    }

    async fn publish_event(&self, event: &JobEvent) -> Result<(), QueueError> {
        self.publish(EVENTS_EXCHANGE, "", event.job_id.as_str(), event)
            .await?;

        info!(
            job_id = %event.job_id,
            status = ?event.status,
            "rabbitmq_event_published"
        );
        Ok(())
    }

    /// Publish `event` and acknowledge the delivery.
    ///
    /// Events are advisory: a failed event publish is logged and the
    /// delivery is acked anyway so it does not pin a prefetch slot.
    async fn settle(&self, receipt: Receipt, event: JobEvent) -> Result<(), QueueError> {
        if let Err(e) = self.publish_event(&event).await {
            warn!(
                job_id = %event.job_id,
                status = ?event.status,
                error = %e,
                "rabbitmq_event_publish_failed"
            );
        }
        ack(receipt).await
    }

    /// Republish `next` and settle the delivery it replaces.
    ///
    /// When the republish fails the original delivery goes back to the queue
    /// unchanged instead of staying unacked.
    async fn redeliver(&self, next: &Job, receipt: Receipt) -> Settlement {
        match self.publish_job(next).await {
            Ok(()) => {
                if let Err(e) = ack(receipt).await {
                    error!(job_id = %next.id, error = %e, "rabbitmq_ack_failed");
                }
                Settlement::Acked
            }
            Err(e) => {
                error!(job_id = %next.id, error = %e, "rabbitmq_redelivery_publish_failed");
                if let Err(e) = requeue(receipt).await {
                    error!(job_id = %next.id, error = %e, "rabbitmq_requeue_failed");
                }
                Settlement::Requeued
            }
        }
    }
}

/// What happened to a delivery after a scheduled retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    /// The retry was published and the original acked
    Acked,
    /// The retry could not be published; the original was requeued
    Requeued,
}

async fn ack(receipt: Receipt) -> Result<(), QueueError> {
    match receipt {
        Receipt::Amqp(acker) => acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(unavailable("Failed to ack delivery")),
        Receipt::Memory => Ok(()),
    }
}

async fn requeue(receipt: Receipt) -> Result<(), QueueError> {
    match receipt {
        Receipt::Amqp(acker) => acker
            .nack(BasicNackOptions {
                requeue: true,
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(unavailable("Failed to requeue delivery")),
        Receipt::Memory => Ok(()),
    }
}

/// Error for a consumer whose delivery stream ended.
///
/// The broker cancels consumers on restart or queue deletion; reporting it as
/// unavailable makes the next claim start a fresh consumer.
fn consumer_ended() -> QueueError {
    QueueError::Unavailable("consumer stream ended".to_string())
}

#[async_trait]
impl JobQueue for AmqpQueue {
    async fn enqueue(&self, kind: &str, payload: JobPayload) -> Result<JobId, QueueError> {
        let job = Job::new(kind, payload);
        self.inner.publish_job(&job).await?;

        info!(
            queue = JOB_QUEUE,
            job_id = %job.id,
            kind = kind,
            has_source_message = job.payload.source_message_id.is_some(),
            "rabbitmq_job_published"
        );

        Ok(job.id)
    }

    async fn claim(&self) -> Result<Option<ClaimedJob>, QueueError> {
        loop {
            let channel = self.inner.ensure_connected().await?;
            let mut consumer = self.inner.consumer.lock().await;

            if consumer.is_none() {
                let created = channel
                    .basic_consume(
                        JOB_QUEUE,
                        "triage-worker",
                        BasicConsumeOptions::default(),
                        FieldTable::default(),
                    )
                    .await
                    .map_err(unavailable("Failed to start consumer"))?;
                info!(queue = JOB_QUEUE, "rabbitmq_consumer_started");
                *consumer = Some(created);
            }

            let Some(stream) = consumer.as_mut() else {
                continue;
            };

            match stream.next().await {
                Some(Ok(delivery)) => match serde_json::from_slice::<Job>(&delivery.data) {
                    Ok(job) => {
                        info!(
                            queue = JOB_QUEUE,
                            job_id = %job.id,
                            attempt = job.attempt,
                            redelivered = delivery.redelivered,
                            "rabbitmq_job_received"
                        );
                        return Ok(Some(ClaimedJob {
                            job,
                            receipt: Receipt::Amqp(delivery.acker),
                        }));
                    }
                    Err(e) => {
                        error!(
                            error = %e,
                            body_preview = %String::from_utf8_lossy(
                                &delivery.data[..delivery.data.len().min(500)]
                            ),
                            "rabbitmq_job_parse_failed"
                        );

                        // Malformed jobs can never succeed; drop them
                        if let Err(nack_err) = delivery
                            .acker
                            .nack(BasicNackOptions {
                                requeue: false,
                                ..Default::default()
                            })
                            .await
                        {
                            error!(error = %nack_err, "rabbitmq_nack_failed");
                        }
                    }
                },
                Some(Err(e)) => {
                    // The stream ends with its channel; a fresh consumer is
                    // created on the next claim.
                    consumer.take();
                    return Err(QueueError::Unavailable(format!("delivery error: {e}")));
                }
                None => {
                    warn!("rabbitmq_consumer_closed");
                    consumer.take();
                    return Err(consumer_ended());
                }
            }
        }
    }

    async fn complete(&self, claim: ClaimedJob) -> Result<(), QueueError> {
        // Event first, then ack: a crash in between yields a duplicate
        // event and a redelivery rather than a lost completion.
        let event = JobEvent::completed(claim.job.id.clone());
        self.inner.settle(claim.receipt, event).await
    }

    async fn fail(&self, claim: ClaimedJob, reason: String) -> Result<Disposition, QueueError> {
        let ClaimedJob { job, receipt } = claim;
        let policy = self.inner.policy;

        if policy.should_retry(job.attempt) {
            let next = job.redelivery();
            let attempt = next.attempt;
            let delay = policy.delay_for(job.attempt);

            warn!(
                job_id = %job.id,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                reason = %reason,
                "rabbitmq_job_redelivery_scheduled"
            );

            // The original delivery stays unacked until the retry is
            // published, so a crash during the backoff still redelivers it.
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                inner.redeliver(&next, receipt).await;
            });

            return Ok(Disposition::Redelivered { attempt, delay });
        }

        self.inner
            .settle(receipt, JobEvent::failed(job.id, reason))
            .await?;
        Ok(Disposition::Failed)
    }

    async fn subscribe(&self) -> Result<Subscription, QueueError> {
        self.inner.ensure_connected().await?;

        let channel = {
            let connection = self.inner.connection.read().await;
            let conn = connection.as_ref().ok_or(QueueError::Closed)?;
            conn.create_channel()
                .await
                .map_err(unavailable("Failed to create subscriber channel"))?
        };

        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(unavailable("Failed to declare subscriber queue"))?;

        channel
            .queue_bind(
                queue.name().as_str(),
                EVENTS_EXCHANGE,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(unavailable("Failed to bind subscriber queue"))?;

        let mut consumer = channel
            .basic_consume(
                queue.name().as_str(),
                "triage-events",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(unavailable("Failed to start event consumer"))?;

        info!(queue = queue.name().as_str(), "rabbitmq_events_subscribed");

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        error!(error = %e, "rabbitmq_event_delivery_error");
                        break;
                    }
                };

                match serde_json::from_slice::<JobEvent>(&delivery.data) {
                    Ok(event) => {
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "rabbitmq_event_parse_failed"),
                }

                if let Err(e) = delivery.acker.ack(BasicAckOptions::default()).await {
                    error!(error = %e, "rabbitmq_event_ack_failed");
                }
            }

            if let Err(e) = channel.close(200, "Subscription ended").await {
                warn!(error = %e, "rabbitmq_channel_close_error");
            }
        });

        Ok(Subscription::new(rx, task))
    }
}
