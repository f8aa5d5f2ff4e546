//! Connection: owns one AMQP connection, its channels, and the
//! reconnection guard (§4.E).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lapin::ConnectionProperties;
use tokio::sync::{Mutex as AsyncMutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::consumer::ConsumerChannel;
use crate::channel::publisher::{PublishOptions, PublisherChannel};
use crate::channel::ChannelKey;
use crate::error::{RabbitMqError, Result};
use crate::handler::ConsumerDescriptor;
use crate::uri::redact;

/// Tuning knobs a factory supplies when dialing a broker (§3 Connection
/// record). Mirrors [`crate::config::Config`]'s additive fields, but the
/// core never reads the environment itself; only this struct does.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Whether a dropped transport is automatically redialed.
    pub keep_alive: bool,
    /// Fixed delay between reconnect attempts. No exponential backoff (§9).
    pub retry_delay: Duration,
    /// Default attempts-remaining assigned to a cached publish.
    pub max_retry: u32,
    /// Bound on the publishing cache's size.
    pub publishing_cache_size: usize,
    /// TTL applied to cached publishes, measured from insertion.
    pub publishing_cache_ttl: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            keep_alive: true,
            retry_delay: Duration::from_secs(5),
            max_retry: 5,
            publishing_cache_size: 1000,
            publishing_cache_ttl: Duration::from_secs(60),
        }
    }
}

enum ChannelEntry {
    Consumer(Arc<ConsumerChannel>),
    Publisher(Arc<PublisherChannel>),
}

/// Owns one AMQP connection, a collection of channels, and the
/// reconnection guard (§3, §4.E). Always held behind an `Arc` since the
/// guard and reconnect tasks need to outlive the caller's stack frame.
pub struct Connection {
    uri: String,
    opts: ConnectionOptions,
    transport: Arc<RwLock<Option<lapin::Connection>>>,
    ready_notify: Arc<Notify>,
    channels: RwLock<HashMap<ChannelKey, ChannelEntry>>,
    explicit_close: AtomicBool,
    cancel: CancellationToken,
    guard_handle: AsyncMutex<Option<JoinHandle<()>>>,
    reconnect_handle: AsyncMutex<Option<JoinHandle<()>>>,
    reconnecting: AtomicBool,
}

impl Connection {
    /// Builds, then attempts to open, a connection to `uri`. On dial
    /// failure, if `opts.keep_alive` is set, schedules exactly one
    /// reconnect task and returns the dial error to the caller anyway (the
    /// connection keeps trying in the background); otherwise the error is
    /// final and no background task is left running. This is the "factory"
    /// referenced throughout §4.E: an ordinary constructor, no global
    /// state (§9).
    pub async fn connect(uri: impl Into<String>, opts: ConnectionOptions) -> Result<Arc<Self>> {
        let uri = uri.into();
        if uri.is_empty() {
            return Err(RabbitMqError::UriEmpty);
        }

        let this = Arc::new(Self {
            uri,
            opts,
            transport: Arc::new(RwLock::new(None)),
            ready_notify: Arc::new(Notify::new()),
            channels: RwLock::new(HashMap::new()),
            explicit_close: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            guard_handle: AsyncMutex::new(None),
            reconnect_handle: AsyncMutex::new(None),
            reconnecting: AtomicBool::new(false),
        });

        match this.open().await {
            Ok(()) => Ok(this),
            Err(e) => {
                if this.opts.keep_alive {
                    this.spawn_reconnect();
                    Ok(this)
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Dials the broker. On success, stores the transport, wakes any
    /// channel waiting on `ready_notify`, and spawns the guard (if
    /// `keep_alive`). On failure, returns the error without touching
    /// existing state.
    pub async fn open(self: &Arc<Self>) -> Result<()> {
        if self.explicit_close.load(Ordering::SeqCst) {
            return Err(RabbitMqError::ConnectionClosed);
        }

        log::info!(
            "component=connection uri={} state=opening",
            redact(&self.uri)
        );

        let conn = lapin::Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(|e| RabbitMqError::DialFailed(e.to_string()))?;

        let close_notify = Arc::new(Notify::new());
        let on_error_notify = Arc::clone(&close_notify);
        conn.on_error(move |_err| {
            on_error_notify.notify_waiters();
        });

        *self.transport.write().await = Some(conn);
        self.ready_notify.notify_waiters();

        log::info!(
            "component=connection uri={} state=ready",
            redact(&self.uri)
        );

        if self.opts.keep_alive {
            self.spawn_guard(close_notify);
        }

        Ok(())
    }

    fn spawn_guard(self: &Arc<Self>, close_notify: Arc<Notify>) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = this.cancel.cancelled() => {}
                _ = close_notify.notified() => {
                    if !this.explicit_close.load(Ordering::SeqCst) {
                        log::warn!(
                            "component=connection uri={} event=transport_closed",
                            redact(&this.uri)
                        );
                        *this.transport.write().await = None;
                        this.spawn_reconnect();
                    }
                }
            }
        });
        // `try_lock` never contends here: `spawn_guard` only runs from
        // `open`, which is never called concurrently with itself on the
        // same `Connection` (single caller per generation: `connect` or
        // the reconnect loop, never both).
        if let Ok(mut guard) = self.guard_handle.try_lock() {
            *guard = Some(handle);
        }
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            this.reconnect().await;
            this.reconnecting.store(false, Ordering::SeqCst);
        });
        if let Ok(mut guard) = self.reconnect_handle.try_lock() {
            *guard = Some(handle);
        }
    }

    async fn reconnect(self: &Arc<Self>) {
        loop {
            if self.cancel.is_cancelled() || self.explicit_close.load(Ordering::SeqCst) {
                return;
            }
            if self.ready().await {
                return;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.opts.retry_delay) => {}
            }

            if self.cancel.is_cancelled() || self.explicit_close.load(Ordering::SeqCst) {
                return;
            }

            log::debug!(
                "component=connection uri={} event=reconnect_attempt",
                redact(&self.uri)
            );
            match self.open().await {
                Ok(()) => {
                    log::info!(
                        "component=connection uri={} event=reconnected",
                        redact(&self.uri)
                    );
                    return;
                }
                Err(e) => {
                    log::warn!(
                        "component=connection uri={} event=reconnect_failed err={}",
                        redact(&self.uri),
                        e
                    );
                }
            }
        }
    }

    /// Registers a new consumer channel for `descriptor.queue`. Rejects
    /// duplicate registrations on the same queue (§4.E) and validates the
    /// handler registry before spawning anything.
    pub async fn register_consumer(
        self: &Arc<Self>,
        descriptor: ConsumerDescriptor,
    ) -> Result<Arc<ConsumerChannel>> {
        if self.explicit_close.load(Ordering::SeqCst) {
            return Err(RabbitMqError::ConnectionClosed);
        }
        descriptor.validate()?;

        let key = ChannelKey::Consumer(descriptor.queue.clone());
        let mut channels = self.channels.write().await;
        if channels.contains_key(&key) {
            return Err(RabbitMqError::ConsumerDuplicateQueue(descriptor.queue));
        }

        let channel = ConsumerChannel::spawn(
            descriptor,
            Arc::clone(&self.transport),
            Arc::clone(&self.ready_notify),
            self.opts.retry_delay,
            self.cancel.child_token(),
        );
        channels.insert(key, ChannelEntry::Consumer(Arc::clone(&channel)));
        Ok(channel)
    }

    /// Publishes one message, lazily creating the connection's single
    /// publisher channel on first use (§4.E).
    pub async fn publish(
        self: &Arc<Self>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        body: Vec<u8>,
        content_type: impl Into<String>,
        opts: PublishOptions,
    ) -> Result<()> {
        if self.explicit_close.load(Ordering::SeqCst) {
            return Err(RabbitMqError::ConnectionClosed);
        }

        let publisher = self.publisher_channel().await;
        publisher
            .publish(exchange, routing_key, body, content_type, opts)
            .await
    }

    async fn publisher_channel(self: &Arc<Self>) -> Arc<PublisherChannel> {
        {
            let channels = self.channels.read().await;
            if let Some(ChannelEntry::Publisher(p)) = channels.get(&ChannelKey::Publisher) {
                return Arc::clone(p);
            }
        }

        let mut channels = self.channels.write().await;
        if let Some(ChannelEntry::Publisher(p)) = channels.get(&ChannelKey::Publisher) {
            return Arc::clone(p);
        }

        let publisher = PublisherChannel::spawn(
            Arc::clone(&self.transport),
            Arc::clone(&self.ready_notify),
            self.opts.retry_delay,
            self.opts.max_retry,
            self.opts.publishing_cache_size,
            self.opts.publishing_cache_ttl,
            self.cancel.child_token(),
        );
        channels.insert(ChannelKey::Publisher, ChannelEntry::Publisher(Arc::clone(&publisher)));
        publisher
    }

    /// Closes every channel (best-effort: the first error is remembered
    /// but closing continues), closes the transport, latches explicit
    /// close, and cancels the root scope so no guard/reconnect/delivery-loop
    /// task is ever spawned for this connection again.
    pub async fn close(self: &Arc<Self>) -> Result<()> {
        self.explicit_close.store(true, Ordering::SeqCst);

        let mut first_err = None;
        let channels = self.channels.read().await;
        for entry in channels.values() {
            let result = match entry {
                ChannelEntry::Consumer(c) => c.close().await,
                ChannelEntry::Publisher(p) => p.close().await,
            };
            if let Err(e) = result {
                first_err.get_or_insert(e);
            }
        }
        drop(channels);

        self.cancel.cancel();

        if let Some(handle) = self.guard_handle.lock().await.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.reconnect_handle.lock().await.take() {
            let _ = handle.await;
        }

        if let Some(conn) = self.transport.write().await.take() {
            if let Err(e) = conn.close(0, "explicit close").await {
                first_err.get_or_insert(RabbitMqError::DialFailed(e.to_string()));
            }
        }

        log::info!(
            "component=connection uri={} state=closed",
            redact(&self.uri)
        );

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Transport present and not explicitly closed.
    pub async fn ready(&self) -> bool {
        !self.explicit_close.load(Ordering::SeqCst) && self.transport.read().await.is_some()
    }

    /// `ready` AND every owned channel reports healthy.
    pub async fn healthy(&self) -> bool {
        if !self.ready().await {
            return false;
        }
        let channels = self.channels.read().await;
        for entry in channels.values() {
            let healthy = match entry {
                ChannelEntry::Consumer(c) => c.healthy().await,
                ChannelEntry::Publisher(p) => p.healthy().await,
            };
            if !healthy {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::consumer::Message;
    use crate::handler::HandlerRegistry;

    // Nothing listens on this port, so `lapin::Connection::connect` fails fast
    // with a connection-refused error instead of hanging on a real dial.
    const UNREACHABLE_URI: &str = "amqp://127.0.0.1:1/";

    fn descriptor(queue: &str) -> ConsumerDescriptor {
        ConsumerDescriptor::new(
            format!("{queue}-consumer"),
            queue,
            HandlerRegistry::new().with_handler("rk", |_: &Message| Ok(())),
        )
    }

    #[tokio::test]
    async fn connect_rejects_empty_uri_without_dialing() {
        let _ = env_logger::try_init();
        let result = Connection::connect("", ConnectionOptions::default()).await;
        assert!(matches!(result, Err(RabbitMqError::UriEmpty)));
    }

    #[test]
    fn default_options_match_documented_defaults() {
        let opts = ConnectionOptions::default();
        assert!(opts.keep_alive);
        assert_eq!(opts.retry_delay, Duration::from_secs(5));
        assert_eq!(opts.max_retry, 5);
        assert_eq!(opts.publishing_cache_size, 1000);
        assert_eq!(opts.publishing_cache_ttl, Duration::from_secs(60));
    }

    // §8 scenario 4: registering a second consumer on an already-bound queue
    // is rejected, regardless of whether the transport is up.
    #[tokio::test]
    async fn register_consumer_rejects_duplicate_queue() {
        let conn = Connection::connect(UNREACHABLE_URI, ConnectionOptions::default())
            .await
            .expect("keep_alive keeps the connection alive past a failed dial");

        conn.register_consumer(descriptor("q"))
            .await
            .expect("first registration on a fresh queue succeeds");

        let result = conn.register_consumer(descriptor("q")).await;
        assert!(matches!(
            result,
            Err(RabbitMqError::ConsumerDuplicateQueue(q)) if q == "q"
        ));

        conn.close().await.ok();
    }

    // §8 scenario 6: once `close()` latches, no subsequent operation may
    // proceed; each returns `ConnectionClosed` instead.
    #[tokio::test]
    async fn operations_after_close_return_connection_closed() {
        let conn = Connection::connect(UNREACHABLE_URI, ConnectionOptions::default())
            .await
            .expect("keep_alive keeps the connection alive past a failed dial");

        conn.close().await.ok();
        assert!(!conn.ready().await);

        let publish_result = conn
            .publish(
                "ex",
                "rk",
                b"body".to_vec(),
                "application/json",
                PublishOptions::default(),
            )
            .await;
        assert!(matches!(publish_result, Err(RabbitMqError::ConnectionClosed)));

        let register_result = conn.register_consumer(descriptor("q")).await;
        assert!(matches!(register_result, Err(RabbitMqError::ConnectionClosed)));
    }
}
