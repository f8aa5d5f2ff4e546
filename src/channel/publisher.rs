//! Publisher channel: owns one AMQP channel, serializes publishes, and
//! drains the publishing cache on recovery (§4.D).

use std::sync::Arc;
use std::time::{Duration, Instant};

use lapin::options::BasicPublishOptions;
use lapin::{BasicProperties, Channel};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::{DeliveryMode, Priority, PublishingCache, PublishingRecord};
use crate::channel::ChannelState;
use crate::error::{RabbitMqError, Result};

/// Caller-supplied publish options (§6). Everything else on a
/// [`PublishingRecord`] (`mandatory`, `immediate`, `message_id`,
/// `timestamp`) is filled in by this module, never by the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishOptions {
    /// Publish priority, `0..=9`. Defaults to `Priority::Medium` (5).
    pub priority: Option<Priority>,
    /// Delivery mode. Defaults to `DeliveryMode::Persistent`.
    pub delivery_mode: Option<DeliveryMode>,
}

enum Work {
    Publish {
        exchange: String,
        routing_key: String,
        body: Vec<u8>,
        content_type: String,
        opts: PublishOptions,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Owns one AMQP channel used only for publishing. See §4.D for the publish
/// call path and cache-drain contract.
pub struct PublisherChannel {
    state: Arc<RwLock<ChannelState>>,
    max_retry: u32,
    work_tx: mpsc::Sender<Work>,
    cancel: CancellationToken,
    task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl PublisherChannel {
    /// Creates the channel and spawns its actor, which owns both the AMQP
    /// channel handle and the publishing cache so that publish and
    /// cache-drain are serialized on a single queue (§5, §9).
    pub(crate) fn spawn(
        transport: Arc<RwLock<Option<lapin::Connection>>>,
        ready_notify: Arc<Notify>,
        retry_delay: Duration,
        max_retry: u32,
        cache_size: usize,
        cache_ttl: Duration,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let state = Arc::new(RwLock::new(ChannelState::Init));
        let (work_tx, work_rx) = mpsc::channel(256);

        let this = Arc::new(Self {
            state: Arc::clone(&state),
            max_retry,
            work_tx,
            cancel: cancel.clone(),
            task: AsyncMutex::new(None),
        });

        let actor = Actor {
            state,
            channel: None,
            cache: PublishingCache::new(cache_size, cache_ttl),
            max_retry,
            transport,
            ready_notify,
            retry_delay,
            cancel,
        };
        let handle = tokio::spawn(actor.run(work_rx));
        if let Ok(mut guard) = this.task.try_lock() {
            *guard = Some(handle);
        }
        this
    }

    /// Publishes one message. See §4.D for the call path: caches
    /// immediately if the channel isn't active, otherwise attempts a live
    /// publish and falls back to the cache on transport failure.
    pub async fn publish(
        &self,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        body: Vec<u8>,
        content_type: impl Into<String>,
        opts: PublishOptions,
    ) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let work = Work::Publish {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            body,
            content_type: content_type.into(),
            opts,
            reply: reply_tx,
        };
        self.work_tx
            .send(work)
            .await
            .map_err(|_| RabbitMqError::ConnectionClosed)?;
        reply_rx.await.map_err(|_| RabbitMqError::ConnectionClosed)?
    }

    /// Whether this channel counts as healthy for `Connection::healthy`.
    pub async fn healthy(&self) -> bool {
        self.state.read().await.is_healthy()
    }

    /// Closes the channel: cancels the actor and waits for it to exit.
    pub async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        *self.state.write().await = ChannelState::Closed;
        log::info!("component=publisher_channel state=closed event=close");
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
        Ok(())
    }
}

/// The single-writer actor that owns the AMQP channel handle and the
/// publishing cache. Every publish and every cache-drain flows through
/// `run`'s event loop, so the two can never race (§5, §9).
struct Actor {
    state: Arc<RwLock<ChannelState>>,
    channel: Option<Channel>,
    cache: PublishingCache,
    max_retry: u32,
    transport: Arc<RwLock<Option<lapin::Connection>>>,
    ready_notify: Arc<Notify>,
    retry_delay: Duration,
    cancel: CancellationToken,
}

impl Actor {
    async fn run(mut self, mut work_rx: mpsc::Receiver<Work>) {
        loop {
            let need_channel = self.channel.is_none();
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    *self.state.write().await = ChannelState::Closed;
                    return;
                }
                work = work_rx.recv() => {
                    match work {
                        Some(Work::Publish { exchange, routing_key, body, content_type, opts, reply }) => {
                            let result = self.handle_publish(exchange, routing_key, body, content_type, opts).await;
                            let _ = reply.send(result);
                        }
                        None => {
                            *self.state.write().await = ChannelState::Closed;
                            return;
                        }
                    }
                }
                _ = self.ready_notify.notified(), if need_channel => {
                    self.try_open_and_drain().await;
                }
                _ = tokio::time::sleep(self.retry_delay), if need_channel => {
                    self.try_open_and_drain().await;
                }
            }
        }
    }

    async fn handle_publish(
        &mut self,
        exchange: String,
        routing_key: String,
        body: Vec<u8>,
        content_type: String,
        opts: PublishOptions,
    ) -> Result<()> {
        let record = PublishingRecord {
            exchange,
            routing_key,
            mandatory: false,
            immediate: false,
            body,
            content_type,
            priority: opts.priority.unwrap_or_default(),
            delivery_mode: opts.delivery_mode.unwrap_or_default(),
            message_id: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            attempts_remaining: self.max_retry,
        };

        if self.channel.is_none() {
            if self.max_retry == 0 {
                log::warn!(
                    "component=publisher_channel message_id={} event=publish_while_down max_retry=0 action=reject",
                    record.message_id
                );
                return Err(RabbitMqError::ChannelUnavailable(
                    "channel down and max_retry is 0".into(),
                ));
            }
            log::debug!(
                "component=publisher_channel message_id={} event=publish_while_down action=cache",
                record.message_id
            );
            self.cache.put(record);
            return Ok(());
        }

        match self.publish_once(&record).await {
            Ok(()) => Ok(()),
            Err(e) => {
                log::warn!(
                    "component=publisher_channel message_id={} event=publish_failed err={}",
                    record.message_id, e
                );
                *self.state.write().await = ChannelState::Degraded;
                self.channel = None;

                if self.max_retry == 0 {
                    return Err(RabbitMqError::PublishExhausted(record.message_id.to_string()));
                }

                let mut record = record;
                record.attempts_remaining = record.attempts_remaining.saturating_sub(1);
                if record.attempts_remaining == 0 {
                    log::error!(
                        "component=publisher_channel message_id={} event=publish_exhausted",
                        record.message_id
                    );
                    return Err(RabbitMqError::PublishExhausted(record.message_id.to_string()));
                }
                self.cache.put(record);
                Ok(())
            }
        }
    }

    async fn publish_once(&self, record: &PublishingRecord) -> Result<()> {
        let channel = self
            .channel
            .as_ref()
            .ok_or_else(|| RabbitMqError::ChannelUnavailable("no live channel".into()))?;

        let props = BasicProperties::default()
            .with_content_type(record.content_type.clone().into())
            .with_priority(record.priority.value())
            .with_delivery_mode(record.delivery_mode.value())
            .with_message_id(record.message_id.to_string().into())
            .with_timestamp(record.timestamp.timestamp() as u64);

        channel
            .basic_publish(
                &record.exchange,
                &record.routing_key,
                BasicPublishOptions {
                    mandatory: record.mandatory,
                    immediate: record.immediate,
                },
                &record.body,
                props,
            )
            .await?
            .await?;

        Ok(())
    }

    async fn try_open_and_drain(&mut self) {
        *self.state.write().await = ChannelState::Opening;
        log::info!("component=publisher_channel state=opening");

        let channel = {
            let guard = self.transport.read().await;
            let Some(conn) = guard.as_ref() else {
                *self.state.write().await = ChannelState::Reopening;
                return;
            };
            match conn.create_channel().await {
                Ok(c) => c,
                Err(e) => {
                    log::warn!(
                        "component=publisher_channel state=reopening event=open_failed err={}",
                        e
                    );
                    *self.state.write().await = ChannelState::Reopening;
                    return;
                }
            }
        };

        self.channel = Some(channel);
        *self.state.write().await = ChannelState::Active;
        log::info!("component=publisher_channel state=active");
        self.drain().await;
    }

    async fn drain(&mut self) {
        let expired = self.cache.prune(Instant::now());
        for rec in &expired {
            log::warn!(
                "component=publisher_channel message_id={} event=cache_entry_expired",
                rec.message_id
            );
        }

        let pending: Vec<PublishingRecord> = self.cache.iter().cloned().collect();
        for mut rec in pending {
            if self.channel.is_none() {
                // Lost the channel mid-drain; stop, the outer loop will retry.
                break;
            }
            match self.publish_once(&rec).await {
                Ok(()) => {
                    self.cache.remove(&rec.message_id);
                    log::debug!(
                        "component=publisher_channel message_id={} event=drain_replayed",
                        rec.message_id
                    );
                }
                Err(e) => {
                    log::warn!(
                        "component=publisher_channel message_id={} event=drain_publish_failed err={}",
                        rec.message_id, e
                    );
                    *self.state.write().await = ChannelState::Degraded;
                    self.channel = None;

                    rec.attempts_remaining = rec.attempts_remaining.saturating_sub(1);
                    if rec.attempts_remaining == 0 {
                        self.cache.remove(&rec.message_id);
                        log::error!(
                            "component=publisher_channel message_id={} event=publish_exhausted",
                            rec.message_id
                        );
                    } else {
                        self.cache.put(rec);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn down_transport() -> Arc<RwLock<Option<lapin::Connection>>> {
        Arc::new(RwLock::new(None))
    }

    #[test]
    fn publish_options_default_has_no_overrides() {
        let opts = PublishOptions::default();
        assert!(opts.priority.is_none());
        assert!(opts.delivery_mode.is_none());
    }

    #[tokio::test]
    async fn publish_while_down_with_zero_max_retry_fails_fast() {
        let channel = PublisherChannel::spawn(
            down_transport(),
            Arc::new(Notify::new()),
            Duration::from_millis(20),
            0,
            10,
            Duration::from_secs(60),
            CancellationToken::new(),
        );

        let result = channel
            .publish("ex", "rk", b"body".to_vec(), "application/json", PublishOptions::default())
            .await;
        assert!(matches!(result, Err(RabbitMqError::ChannelUnavailable(_))));
        channel.close().await.unwrap();
    }

    #[tokio::test]
    async fn publish_while_down_with_retries_remaining_is_cached_not_failed() {
        let channel = PublisherChannel::spawn(
            down_transport(),
            Arc::new(Notify::new()),
            Duration::from_millis(20),
            3,
            10,
            Duration::from_secs(60),
            CancellationToken::new(),
        );

        let result = channel
            .publish("ex", "rk", b"body".to_vec(), "application/json", PublishOptions::default())
            .await;
        assert!(result.is_ok());
        channel.close().await.unwrap();
    }

    #[tokio::test]
    async fn channel_is_not_healthy_while_transport_is_absent() {
        let channel = PublisherChannel::spawn(
            down_transport(),
            Arc::new(Notify::new()),
            Duration::from_secs(60),
            5,
            10,
            Duration::from_secs(60),
            CancellationToken::new(),
        );
        assert!(!channel.healthy().await);
        channel.close().await.unwrap();
    }
}
