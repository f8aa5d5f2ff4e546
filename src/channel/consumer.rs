//! Consumer channel: owns one AMQP channel, subscribes a consumer, dispatches
//! deliveries to handlers (§4.C).

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    QueueBindOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel};
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex as AsyncMutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::ChannelState;
use crate::error::{HandlerOutcome, RabbitMqError, Result};
use crate::handler::ConsumerDescriptor;

/// Header carrying the number of times a delivery has been republished to
/// the retry exchange after a `HandlerTransient` outcome. Only present when
/// `ConsumerDescriptor::max_redeliveries` bounds redelivery.
const RETRY_COUNT_HEADER: &str = "x-retry-count";

/// Prefix used to derive a per-queue retry exchange name: `<prefix><queue>`.
const RETRY_EXCHANGE_PREFIX: &str = "retry.";

/// An inbound delivery plus its metadata, decoupled from `lapin::message::Delivery`
/// so that handler code in `crate::handler` doesn't need a `lapin` dependency
/// of its own.
#[derive(Debug, Clone)]
pub struct Message {
    /// Raw message body.
    pub body: Vec<u8>,
    /// Routing key the message was published with.
    pub routing_key: String,
    /// Exchange the message was published to.
    pub exchange: String,
    /// Content-type property, if the publisher set one.
    pub content_type: Option<String>,
    /// Publisher-supplied timestamp property, if set.
    pub timestamp: Option<u64>,
    /// Delivery tag, used internally for ack/nack ordering.
    pub delivery_tag: u64,
    /// Whether the broker has redelivered this message before.
    pub redelivered: bool,
}

impl Message {
    /// Decodes the body as JSON into `T`. Decoding is the caller's concern
    /// (§4.A); this is a convenience, not part of the codec contract.
    pub fn unmarshal_to<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }
}

fn retry_count_from_headers(headers: &Option<FieldTable>) -> u32 {
    let Some(table) = headers.as_ref() else {
        return 0;
    };
    match table.inner().get(RETRY_COUNT_HEADER) {
        Some(AMQPValue::LongUInt(n)) => *n,
        Some(AMQPValue::LongInt(n)) => (*n).try_into().unwrap_or(0),
        _ => 0,
    }
}

fn with_retry_count(mut props: BasicProperties, next: u32) -> BasicProperties {
    let mut headers = props.headers().clone().unwrap_or_default();
    headers.insert(RETRY_COUNT_HEADER.into(), AMQPValue::LongUInt(next));
    props = props.with_headers(headers);
    props
}

/// Owns one AMQP channel bound to a single consumer descriptor. See §4.C for
/// the state machine and acknowledgement policy.
pub struct ConsumerChannel {
    descriptor: ConsumerDescriptor,
    state: RwLock<ChannelState>,
    transport: Arc<RwLock<Option<lapin::Connection>>>,
    ready_notify: Arc<Notify>,
    retry_delay: Duration,
    cancel: CancellationToken,
    task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl ConsumerChannel {
    /// Creates the channel and spawns its delivery loop as a child of
    /// `cancel`. `transport` is the connection's shared, possibly-empty
    /// transport handle; `ready_notify` wakes the loop as soon as a new
    /// transport becomes available instead of waiting out `retry_delay`.
    pub(crate) fn spawn(
        descriptor: ConsumerDescriptor,
        transport: Arc<RwLock<Option<lapin::Connection>>>,
        ready_notify: Arc<Notify>,
        retry_delay: Duration,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            descriptor,
            state: RwLock::new(ChannelState::Init),
            transport,
            ready_notify,
            retry_delay,
            cancel,
            task: AsyncMutex::new(None),
        });

        let runner = Arc::clone(&this);
        let handle = tokio::spawn(async move { runner.run().await });
        // No concurrent spawn can race this: `spawn` runs once, synchronously,
        // before any caller can observe `this`.
        if let Ok(mut guard) = this.task.try_lock() {
            *guard = Some(handle);
        }
        this
    }

    /// The queue this channel consumes from.
    pub fn queue(&self) -> &str {
        &self.descriptor.queue
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ChannelState {
        *self.state.read().await
    }

    /// Whether this channel counts as healthy for `Connection::healthy`.
    pub async fn healthy(&self) -> bool {
        self.state.read().await.is_healthy()
    }

    /// Closes the channel: latches explicit-close, cancels the delivery
    /// loop, and waits for it to exit. Does not touch the parent connection.
    pub async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        *self.state.write().await = ChannelState::Closed;
        log::info!(
            "component=consumer_channel queue={} state=closed event=close",
            self.descriptor.queue
        );
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
        Ok(())
    }

    async fn run(self: Arc<Self>) {
        loop {
            if self.cancel.is_cancelled() {
                *self.state.write().await = ChannelState::Closed;
                return;
            }

            *self.state.write().await = ChannelState::Opening;
            log::info!(
                "component=consumer_channel queue={} state=opening",
                self.descriptor.queue
            );

            match self.open_and_subscribe().await {
                Ok((channel, consumer)) => {
                    let mut stream = consumer.into_stream();
                    *self.state.write().await = ChannelState::Active;
                    log::info!(
                        "component=consumer_channel queue={} state=active",
                        self.descriptor.queue
                    );

                    loop {
                        tokio::select! {
                            _ = self.cancel.cancelled() => {
                                *self.state.write().await = ChannelState::Closed;
                                return;
                            }
                            next = stream.next() => {
                                match next {
                                    Some(Ok(delivery)) => {
                                        self.dispatch(&channel, delivery).await;
                                    }
                                    Some(Err(e)) => {
                                        log::warn!(
                                            "component=consumer_channel queue={} state=degraded event=delivery_error err={}",
                                            self.descriptor.queue, e
                                        );
                                        *self.state.write().await = ChannelState::Degraded;
                                        break;
                                    }
                                    None => {
                                        log::warn!(
                                            "component=consumer_channel queue={} state=degraded event=stream_ended",
                                            self.descriptor.queue
                                        );
                                        *self.state.write().await = ChannelState::Degraded;
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    log::warn!(
                        "component=consumer_channel queue={} state=reopening event=open_failed err={}",
                        self.descriptor.queue, e
                    );
                    *self.state.write().await = ChannelState::Reopening;
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    *self.state.write().await = ChannelState::Closed;
                    return;
                }
                _ = tokio::time::sleep(self.retry_delay) => {}
                _ = self.ready_notify.notified() => {}
            }
        }
    }

    async fn open_and_subscribe(&self) -> Result<(Channel, lapin::Consumer)> {
        let guard = self.transport.read().await;
        let Some(conn) = guard.as_ref() else {
            return Err(RabbitMqError::ChannelUnavailable(
                "no live transport".into(),
            ));
        };

        let channel = conn.create_channel().await?;
        channel
            .basic_qos(self.descriptor.prefetch, BasicQosOptions::default())
            .await?;

        if let Some(exchange) = &self.descriptor.exchange {
            for routing_key in self.descriptor.handlers.keys() {
                channel
                    .queue_bind(
                        &self.descriptor.queue,
                        exchange,
                        routing_key,
                        QueueBindOptions::default(),
                        FieldTable::default(),
                    )
                    .await?;
            }
        }

        let consumer = channel
            .basic_consume(
                &self.descriptor.queue,
                &self.descriptor.name,
                BasicConsumeOptions {
                    no_ack: self.descriptor.auto_ack,
                    exclusive: self.descriptor.exclusive,
                    no_local: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await?;

        Ok((channel, consumer))
    }

    async fn dispatch(&self, channel: &Channel, delivery: lapin::message::Delivery) {
        let routing_key = delivery.routing_key.to_string();
        let delivery_tag = delivery.delivery_tag;
        let message = Message {
            body: delivery.data.clone(),
            routing_key: routing_key.clone(),
            exchange: delivery.exchange.to_string(),
            content_type: delivery.properties.content_type().as_ref().map(|s| s.to_string()),
            timestamp: delivery.properties.timestamp().as_ref().copied(),
            delivery_tag,
            redelivered: delivery.redelivered,
        };

        if self.descriptor.auto_ack {
            if let Some(handler) = self.descriptor.handlers.get(&routing_key) {
                if let Err(outcome) = handler.handle(&message) {
                    log::warn!(
                        "component=consumer_channel queue={} routing_key={} delivery_tag={} event=auto_ack_handler_error outcome={}",
                        self.descriptor.queue, routing_key, delivery_tag, outcome
                    );
                }
            }
            return;
        }

        let Some(handler) = self.descriptor.handlers.get(&routing_key) else {
            log::warn!(
                "component=consumer_channel queue={} routing_key={} delivery_tag={} event=unknown_routing_key action=nack_discard",
                self.descriptor.queue, routing_key, delivery_tag
            );
            if let Err(e) = channel
                .basic_nack(
                    delivery_tag,
                    BasicNackOptions {
                        multiple: false,
                        requeue: false,
                    },
                )
                .await
            {
                log::error!(
                    "component=consumer_channel queue={} delivery_tag={} event=nack_failed err={}",
                    self.descriptor.queue, delivery_tag, e
                );
            }
            return;
        };

        match handler.handle(&message) {
            Ok(()) => {
                if let Err(e) = channel.basic_ack(delivery_tag, BasicAckOptions::default()).await {
                    log::error!(
                        "component=consumer_channel queue={} delivery_tag={} event=ack_failed err={}",
                        self.descriptor.queue, delivery_tag, e
                    );
                }
            }
            Err(HandlerOutcome::Permanent(msg)) => {
                log::warn!(
                    "component=consumer_channel queue={} routing_key={} delivery_tag={} event=handler_permanent action=nack_discard err={}",
                    self.descriptor.queue, routing_key, delivery_tag, msg
                );
                if let Err(e) = channel
                    .basic_nack(
                        delivery_tag,
                        BasicNackOptions {
                            multiple: false,
                            requeue: false,
                        },
                    )
                    .await
                {
                    log::error!(
                        "component=consumer_channel queue={} delivery_tag={} event=nack_failed err={}",
                        self.descriptor.queue, delivery_tag, e
                    );
                }
            }
            Err(HandlerOutcome::Transient(msg)) => {
                self.handle_transient(channel, &delivery, &routing_key, delivery_tag, &msg)
                    .await;
            }
        }
    }

    async fn handle_transient(
        &self,
        channel: &Channel,
        delivery: &lapin::message::Delivery,
        routing_key: &str,
        delivery_tag: u64,
        msg: &str,
    ) {
        let Some(max) = self.descriptor.max_redeliveries else {
            log::warn!(
                "component=consumer_channel queue={} routing_key={} delivery_tag={} event=handler_transient action=nack_requeue err={}",
                self.descriptor.queue, routing_key, delivery_tag, msg
            );
            if let Err(e) = channel
                .basic_nack(
                    delivery_tag,
                    BasicNackOptions {
                        multiple: false,
                        requeue: true,
                    },
                )
                .await
            {
                log::error!(
                    "component=consumer_channel queue={} delivery_tag={} event=nack_failed err={}",
                    self.descriptor.queue, delivery_tag, e
                );
            }
            return;
        };

        let retry_count = retry_count_from_headers(delivery.properties.headers());
        if retry_count >= max {
            log::warn!(
                "component=consumer_channel queue={} routing_key={} delivery_tag={} event=handler_transient retries_exhausted=true retry_count={} max_redeliveries={} action=nack_discard err={}",
                self.descriptor.queue, routing_key, delivery_tag, retry_count, max, msg
            );
            if let Err(e) = channel
                .basic_nack(
                    delivery_tag,
                    BasicNackOptions {
                        multiple: false,
                        requeue: false,
                    },
                )
                .await
            {
                log::error!(
                    "component=consumer_channel queue={} delivery_tag={} event=nack_failed err={}",
                    self.descriptor.queue, delivery_tag, e
                );
            }
            return;
        }

        let retry_exchange = format!("{RETRY_EXCHANGE_PREFIX}{}", self.descriptor.queue);
        let next = retry_count + 1;
        let props = with_retry_count(delivery.properties.clone(), next);
        let published = channel
            .basic_publish(
                &retry_exchange,
                routing_key,
                BasicPublishOptions::default(),
                &delivery.data,
                props,
            )
            .await;

        match published {
            Ok(_) => {
                log::warn!(
                    "component=consumer_channel queue={} routing_key={} delivery_tag={} event=handler_transient action=retry retry_exchange={} retry_count_next={} err={}",
                    self.descriptor.queue, routing_key, delivery_tag, retry_exchange, next, msg
                );
                if let Err(e) = channel.basic_ack(delivery_tag, BasicAckOptions::default()).await {
                    log::error!(
                        "component=consumer_channel queue={} delivery_tag={} event=ack_failed err={}",
                        self.descriptor.queue, delivery_tag, e
                    );
                }
            }
            Err(e) => {
                log::error!(
                    "component=consumer_channel queue={} routing_key={} delivery_tag={} event=retry_publish_failed action=nack_requeue err={}",
                    self.descriptor.queue, routing_key, delivery_tag, e
                );
                if let Err(e) = channel
                    .basic_nack(
                        delivery_tag,
                        BasicNackOptions {
                            multiple: false,
                            requeue: true,
                        },
                    )
                    .await
                {
                    log::error!(
                        "component=consumer_channel queue={} delivery_tag={} event=nack_failed err={}",
                        self.descriptor.queue, delivery_tag, e
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerRegistry;

    #[test]
    fn retry_count_from_headers_defaults_to_zero_when_absent() {
        assert_eq!(retry_count_from_headers(&None), 0);
    }

    #[test]
    fn retry_count_from_headers_reads_long_uint() {
        let mut table = FieldTable::default();
        table.insert(RETRY_COUNT_HEADER.into(), AMQPValue::LongUInt(3));
        assert_eq!(retry_count_from_headers(&Some(table)), 3);
    }

    #[test]
    fn with_retry_count_overwrites_previous_value() {
        let props = with_retry_count(BasicProperties::default(), 1);
        let props = with_retry_count(props, 2);
        let headers = props.headers().clone().unwrap();
        assert_eq!(
            headers.inner().get(RETRY_COUNT_HEADER),
            Some(&AMQPValue::LongUInt(2))
        );
    }

    #[test]
    fn unmarshal_to_decodes_json_body() {
        #[derive(serde::Deserialize)]
        struct Payload {
            id: u32,
        }

        let message = Message {
            body: br#"{"id":42}"#.to_vec(),
            routing_key: "rk".into(),
            exchange: "ex".into(),
            content_type: None,
            timestamp: None,
            delivery_tag: 1,
            redelivered: false,
        };
        let payload: Payload = message.unmarshal_to().unwrap();
        assert_eq!(payload.id, 42);
    }

    #[tokio::test]
    async fn spawn_reports_its_queue_and_closes_cleanly() {
        let descriptor = ConsumerDescriptor::new(
            "test-consumer",
            "my-queue",
            HandlerRegistry::new().with_handler("rk", |_: &Message| Ok(())),
        );
        let channel = ConsumerChannel::spawn(
            descriptor,
            Arc::new(RwLock::new(None)),
            Arc::new(Notify::new()),
            Duration::from_millis(20),
            CancellationToken::new(),
        );

        assert_eq!(channel.queue(), "my-queue");
        channel.close().await.unwrap();
        assert_eq!(channel.state().await, ChannelState::Closed);
    }
}
