//! Content-based routing rules installed on a receiving endpoint.
//!
//! Each endpoint gets two rules: one admitting the event types it declares,
//! one admitting commands addressed to its queue. Rules are rendered to the
//! infrastructure's SQL dialect and can also be evaluated locally against
//! envelope properties.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::envelope::{DESTINATION_QUEUE_KEY, MESSAGE_TYPE_KEY};

/// Name of the rule that admits declared event types.
pub const EVENT_FILTER_NAME: &str = "eventMessageFilter";
/// Name of the rule that admits commands addressed to the endpoint.
pub const COMMAND_FILTER_NAME: &str = "commandMessageFilter";
/// Catch-all rule the infrastructure creates with every subscription.
pub const DEFAULT_RULE_NAME: &str = "$Default";

/// Property used by the never-matching filter. Never set on any envelope.
const ALWAYS_FALSE_KEY: &str = "alwaysfalse";

/// A subscription filter over envelope properties.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterRule {
    /// Matches everything.
    True,
    /// Matches nothing.
    AlwaysFalse,
    /// Matches when the message type is one of the names.
    MessageTypeIn(Vec<String>),
    /// Matches when the destination hint equals the queue.
    DestinationEquals(String),
}

impl FilterRule {
    /// Event filter for the declared event type names.
    ///
    /// An empty set yields [`FilterRule::AlwaysFalse`]: an endpoint that
    /// declares no events must receive none.
    pub fn events<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            FilterRule::AlwaysFalse
        } else {
            FilterRule::MessageTypeIn(names)
        }
    }

    /// Command filter for an endpoint's queue.
    pub fn commands_for(queue: impl Into<String>) -> Self {
        FilterRule::DestinationEquals(queue.into())
    }

    /// SQL filter expression understood by the infrastructure.
    pub fn to_sql(&self) -> String {
        match self {
            FilterRule::True => "1=1".to_string(),
            FilterRule::AlwaysFalse => format!("user.{} IS NOT NULL", ALWAYS_FALSE_KEY),
            FilterRule::MessageTypeIn(names) => {
                let names: Vec<String> = names.iter().map(|name| quote(name)).collect();
                format!("user.{} IN ({})", MESSAGE_TYPE_KEY, names.join(","))
            }
            FilterRule::DestinationEquals(queue) => {
                format!("user.{}={}", DESTINATION_QUEUE_KEY, quote(queue))
            }
        }
    }

    /// Evaluate the rule against envelope properties.
    pub fn matches(&self, properties: &BTreeMap<String, String>) -> bool {
        match self {
            FilterRule::True => true,
            FilterRule::AlwaysFalse => false,
            FilterRule::MessageTypeIn(names) => properties
                .get(MESSAGE_TYPE_KEY)
                .is_some_and(|message_type| names.iter().any(|name| name == message_type)),
            FilterRule::DestinationEquals(queue) => properties
                .get(DESTINATION_QUEUE_KEY)
                .is_some_and(|destination| destination == queue),
        }
    }
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
