//! Handler registry: routing-key pattern → typed delivery handler, one per
//! consumer.

use std::collections::HashMap;
use std::sync::Arc;

use crate::channel::consumer::Message;
use crate::error::{HandlerOutcome, RabbitMqError, Result};

/// A typed delivery handler. Implementations are plain values passed into
/// the registry, not subclasses: the same capability-set style used for
/// [`crate::codec::Codec`].
pub trait DeliveryHandler: Send + Sync {
    /// Handles one delivery. `Ok(())` acks the message; `Err` with a
    /// transient [`HandlerOutcome`] nacks with requeue, permanent nacks
    /// without requeue.
    fn handle(&self, message: &Message) -> std::result::Result<(), HandlerOutcome>;
}

/// Blanket impl so a plain closure can be registered directly, mirroring
/// `cleanapp_rustlib`'s `CallbackFunc` type alias.
impl<F> DeliveryHandler for F
where
    F: Fn(&Message) -> std::result::Result<(), HandlerOutcome> + Send + Sync,
{
    fn handle(&self, message: &Message) -> std::result::Result<(), HandlerOutcome> {
        (self)(message)
    }
}

/// Mapping from routing-key pattern (a literal string; wildcards are
/// delegated to the broker's binding, not this layer) to a handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn DeliveryHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry. Must be populated with at least one
    /// handler and validated before use by [`crate::connection::Connection::register_consumer`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `routing_key`, builder-style.
    pub fn with_handler(
        mut self,
        routing_key: impl Into<String>,
        handler: impl DeliveryHandler + 'static,
    ) -> Self {
        self.handlers.insert(routing_key.into(), Arc::new(handler));
        self
    }

    /// Looks up the handler registered for `routing_key`, if any.
    pub fn get(&self, routing_key: &str) -> Option<Arc<dyn DeliveryHandler>> {
        self.handlers.get(routing_key).cloned()
    }

    /// Iterates the registered routing-key patterns, e.g. to bind a queue to
    /// each of them during `subscribe()`.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Number of registered routing keys.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Validates the registry: fails with
    /// [`RabbitMqError::HandlerRegistryEmpty`] if empty, or
    /// [`RabbitMqError::HandlerKeyEmpty`] if any routing key is the empty
    /// string.
    pub fn validate(&self) -> Result<()> {
        if self.handlers.is_empty() {
            return Err(RabbitMqError::HandlerRegistryEmpty);
        }
        if self.handlers.keys().any(|k| k.is_empty()) {
            return Err(RabbitMqError::HandlerKeyEmpty);
        }
        Ok(())
    }
}

/// Declarative description of a consumer: what queue to bind, how many
/// in-flight deliveries to allow, and the handlers dispatching its messages.
#[derive(Clone)]
pub struct ConsumerDescriptor {
    /// Logical consumer name (used to build the AMQP consumer tag).
    pub name: String,
    /// Queue to consume from.
    pub queue: String,
    /// Whether the broker should auto-ack deliveries (bypassing this crate's
    /// ack/nack policy entirely). Almost always `false` in production.
    pub auto_ack: bool,
    /// Whether the consumer requests exclusive access to the queue.
    pub exclusive: bool,
    /// Per-consumer prefetch count (placed at consumer scope, per §9 Open
    /// Questions).
    pub prefetch: u16,
    /// Exchange to bind `queue` to for each routing key in `handlers`, if
    /// topology declaration hasn't already bound it out of band. `None`
    /// skips binding entirely.
    pub exchange: Option<String>,
    /// Routing-key → handler mapping.
    pub handlers: HandlerRegistry,
    /// Caps how many times a `Transient` handler outcome may requeue the
    /// same delivery before it is treated as permanent. `None` means
    /// unbounded requeue; `Some(n)` bounds redelivery so a transient
    /// failure cannot loop forever.
    pub max_redeliveries: Option<u32>,
}

impl ConsumerDescriptor {
    /// Creates a descriptor with the given name/queue/registry and the
    /// default settings: non-exclusive, manual ack, prefetch 1, unbounded
    /// redelivery.
    pub fn new(name: impl Into<String>, queue: impl Into<String>, handlers: HandlerRegistry) -> Self {
        Self {
            name: name.into(),
            queue: queue.into(),
            auto_ack: false,
            exclusive: false,
            prefetch: 1,
            handlers,
            max_redeliveries: None,
        }
    }

    /// Sets the prefetch count, builder-style.
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Sets whether the consumer is exclusive, builder-style.
    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    /// Bounds redelivery attempts before a transient failure is escalated to
    /// permanent, builder-style.
    pub fn with_max_redeliveries(mut self, max: u32) -> Self {
        self.max_redeliveries = Some(max);
        self
    }

    /// Validates the embedded handler registry.
    pub fn validate(&self) -> Result<()> {
        self.handlers.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_empty_registry() {
        let registry = HandlerRegistry::new();
        assert!(matches!(
            registry.validate(),
            Err(RabbitMqError::HandlerRegistryEmpty)
        ));
    }

    #[test]
    fn validate_rejects_empty_routing_key() {
        let registry = HandlerRegistry::new().with_handler("", |_: &Message| Ok(()));
        assert!(matches!(
            registry.validate(),
            Err(RabbitMqError::HandlerKeyEmpty)
        ));
    }

    #[test]
    fn validate_accepts_populated_registry() {
        let registry = HandlerRegistry::new().with_handler("rk", |_: &Message| Ok(()));
        assert!(registry.validate().is_ok());
    }

    #[test]
    fn lookup_returns_registered_handler() {
        let registry = HandlerRegistry::new().with_handler("rk", |_: &Message| Ok(()));
        assert!(registry.get("rk").is_some());
        assert!(registry.get("other").is_none());
    }
}
