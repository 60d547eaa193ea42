// Copyright (c) 2026 Tollgate Systems (tollgate.dev)
// This file is part of the Tollgate agent payment orchestrator.
//
// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Event bus: fan-out of state transitions to wildcard subscribers.
//!
//! Subscribers receive events over bounded channels. A full or dropped
//! subscriber never blocks the publisher; the delivery is logged and the
//! subscription pruned.

use async_std::channel::{self, Receiver, Sender};
use async_std::sync::Mutex;
use serde::{Deserialize, Serialize};

const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(event_type: &str, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            data,
        }
    }
}

/// `"*"` matches everything; `"policy.*"` matches one dotted prefix; exact
/// strings match themselves.
pub fn pattern_matches(pattern: &str, event_type: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return event_type
            .strip_prefix(prefix)
            .map_or(false, |rest| rest.starts_with('.'));
    }
    pattern == event_type
}

struct Subscription {
    pattern: String,
    sender: Sender<Event>,
}

#[derive(Default)]
pub struct EventBus {
    subscriptions: Mutex<Vec<Subscription>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, pattern: &str) -> Receiver<Event> {
        let (sender, receiver) = channel::bounded(SUBSCRIBER_BUFFER);
        let mut subscriptions = self.subscriptions.lock().await;
        subscriptions.push(Subscription {
            pattern: pattern.to_string(),
            sender,
        });
        receiver
    }

    /// Deliver to every matching subscriber. Never blocks and never fails
    /// the caller.
    pub async fn publish(&self, event: Event) {
        let mut subscriptions = self.subscriptions.lock().await;
        subscriptions.retain(|sub| {
            if !pattern_matches(&sub.pattern, &event.event_type) {
                return true;
            }
            match sub.sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(
                        pattern = %sub.pattern,
                        event_type = %event.event_type,
                        "dropping event subscriber: {}",
                        err
                    );
                    false
                }
            }
        });
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscriptions.lock().await.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_pattern_matching() {
        assert!(pattern_matches("*", "payment.completed"));
        assert!(pattern_matches("policy.*", "policy.violated"));
        assert!(pattern_matches("policy.*", "policy.window.reset"));
        assert!(!pattern_matches("policy.*", "payment.completed"));
        assert!(!pattern_matches("policy.*", "policyx.violated"));
        assert!(pattern_matches("payment.completed", "payment.completed"));
        assert!(!pattern_matches("payment.completed", "payment.failed"));
    }

    #[async_std::test]
    async fn test_publish_reaches_matching_subscribers() {
        let bus = EventBus::new();
        let all = bus.subscribe("*").await;
        let policy = bus.subscribe("policy.*").await;

        bus.publish(Event::new("policy.violated", serde_json::json!({"agent": "a"})))
            .await;
        bus.publish(Event::new("payment.completed", serde_json::json!({})))
            .await;

        assert_eq!(all.recv().await.unwrap().event_type, "policy.violated");
        assert_eq!(all.recv().await.unwrap().event_type, "payment.completed");
        assert_eq!(policy.recv().await.unwrap().event_type, "policy.violated");
        assert!(policy.is_empty());
    }

    #[async_std::test]
    async fn test_dropped_subscriber_does_not_block_publisher() {
        let bus = EventBus::new();
        let receiver = bus.subscribe("*").await;
        drop(receiver);

        bus.publish(Event::new("payment.completed", serde_json::json!({})))
            .await;
        // The dead subscription was pruned, and publish returned normally.
        assert_eq!(bus.subscriber_count().await, 0);
    }

    #[async_std::test]
    async fn test_full_subscriber_is_dropped_not_awaited() {
        let bus = EventBus::new();
        let receiver = bus.subscribe("*").await;
        for i in 0..SUBSCRIBER_BUFFER + 10 {
            bus.publish(Event::new("tick", serde_json::json!({ "i": i })))
                .await;
        }
        // The slow subscriber was dropped once its buffer filled; the
        // buffered events remain readable.
        assert_eq!(bus.subscriber_count().await, 0);
        assert_eq!(receiver.len(), SUBSCRIBER_BUFFER);
    }
}
