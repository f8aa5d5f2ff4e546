//! Topology declaration types (§6).
//!
//! This module defines the wire shape of the exchange/queue/binding JSON
//! document the core hands to a separate topology applier. It performs no
//! I/O and applies nothing; schema migrations and diffing are explicit
//! Non-goals (§1).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A full topology document: exchanges, queues, and bindings, in that
/// order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologySchema {
    /// Exchanges to declare.
    #[serde(default)]
    pub exchanges: Vec<ExchangeSpec>,
    /// Queues to declare.
    #[serde(default)]
    pub queues: Vec<QueueSpec>,
    /// Bindings to create, after exchanges and queues exist.
    #[serde(default)]
    pub bindings: Vec<BindingSpec>,
}

/// One exchange declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeSpec {
    /// Exchange name.
    pub name: String,
    /// Virtual host the exchange lives in.
    #[serde(default)]
    pub vhost: Option<String>,
    /// AMQP exchange type (`direct`, `fanout`, `topic`, `headers`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Whether the exchange survives a broker restart.
    #[serde(default)]
    pub durable: bool,
    /// Whether the exchange is deleted once its last queue is unbound.
    #[serde(default)]
    pub auto_delete: bool,
    /// Whether the exchange is restricted to publishes from other
    /// exchanges rather than clients.
    #[serde(default)]
    pub internal: bool,
    /// Extra broker-specific arguments (`x-` prefixed keys).
    #[serde(default)]
    pub arguments: HashMap<String, Value>,
}

/// One queue declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSpec {
    /// Queue name.
    pub name: String,
    /// Virtual host the queue lives in.
    #[serde(default)]
    pub vhost: Option<String>,
    /// Whether the queue survives a broker restart.
    #[serde(default)]
    pub durable: bool,
    /// Whether the queue is deleted once its last consumer disconnects.
    #[serde(default)]
    pub auto_delete: bool,
    /// Whether the queue is restricted to the connection that declared it.
    #[serde(default)]
    pub exclusive: bool,
    /// Extra broker-specific arguments (`x-` prefixed keys): TTLs,
    /// dead-letter routing, etc.
    #[serde(default)]
    pub arguments: HashMap<String, Value>,
}

/// One binding between an exchange and a queue or exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingSpec {
    /// Source exchange.
    pub source: String,
    /// Destination queue or exchange name.
    pub destination: String,
    /// Whether `destination` names a `"queue"` or an `"exchange"`.
    pub destination_type: String,
    /// Routing key the binding matches on.
    #[serde(default)]
    pub routing_key: String,
    /// Extra broker-specific arguments.
    #[serde(default)]
    pub arguments: HashMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_representative_topology_document() {
        let json = r#"{
            "exchanges": [
                {"name": "reports", "vhost": "/", "type": "topic", "durable": true, "auto_delete": false, "internal": false, "arguments": {}}
            ],
            "queues": [
                {"name": "report-tags", "vhost": "/", "durable": true, "auto_delete": false, "exclusive": false, "arguments": {}}
            ],
            "bindings": [
                {"source": "reports", "destination": "report-tags", "destination_type": "queue", "routing_key": "report.raw", "arguments": {}}
            ]
        }"#;

        let schema: TopologySchema = serde_json::from_str(json).unwrap();
        assert_eq!(schema.exchanges.len(), 1);
        assert_eq!(schema.exchanges[0].name, "reports");
        assert_eq!(schema.queues[0].name, "report-tags");
        assert_eq!(schema.bindings[0].routing_key, "report.raw");

        let reencoded = serde_json::to_string(&schema).unwrap();
        let reparsed: TopologySchema = serde_json::from_str(&reencoded).unwrap();
        assert_eq!(reparsed.queues.len(), schema.queues.len());
    }

    #[test]
    fn missing_sections_default_to_empty() {
        let schema: TopologySchema = serde_json::from_str("{}").unwrap();
        assert!(schema.exchanges.is_empty());
        assert!(schema.queues.is_empty());
        assert!(schema.bindings.is_empty());
    }
}
