//! Entity paths for session-enabled queues and topic subscriptions.

use std::fmt;

const SUBSCRIPTIONS_SEGMENT: &str = "Subscriptions";
const DEAD_LETTER_SUFFIX: &str = "$DeadLetterQueue";

/// Address of a receivable broker entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityPath {
    Queue(String),
    Subscription { topic: String, subscription: String },
}

impl EntityPath {
    pub fn queue(name: impl Into<String>) -> Self {
        Self::Queue(name.into())
    }

    pub fn subscription(topic: impl Into<String>, subscription: impl Into<String>) -> Self {
        Self::Subscription {
            topic: topic.into(),
            subscription: subscription.into(),
        }
    }

    /// Broker-side address, e.g. `orders` or `events/Subscriptions/audit`.
    pub fn path(&self) -> String {
        match self {
            Self::Queue(name) => name.clone(),
            Self::Subscription {
                topic,
                subscription,
            } => format!("{topic}/{SUBSCRIPTIONS_SEGMENT}/{subscription}"),
        }
    }

    /// Address of the entity's dead-letter sub-queue.
    pub fn dead_letter_path(&self) -> String {
        format!("{}/{DEAD_LETTER_SUFFIX}", self.path())
    }
}

impl fmt::Display for EntityPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_path() {
        let q = EntityPath::queue("orders");
        assert_eq!(q.path(), "orders");
        assert_eq!(q.dead_letter_path(), "orders/$DeadLetterQueue");
    }

    #[test]
    fn subscription_path() {
        let s = EntityPath::subscription("events", "audit");
        assert_eq!(s.to_string(), "events/Subscriptions/audit");
        assert_eq!(
            s.dead_letter_path(),
            "events/Subscriptions/audit/$DeadLetterQueue"
        );
    }
}
