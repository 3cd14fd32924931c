//! Core identifier types for domain entities.
//!
//! These newtype wrappers provide type safety for entity identifiers,
//! preventing accidental mixing of different ID types.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

id_type!(
    /// Identifier of the user who owns connections, tasks and scheduled emails.
    UserId
);

id_type!(
    /// Unique identifier for a recurring task.
    TaskId
);

id_type!(
    /// Unique identifier for one execution attempt of a recurring task.
    ExecutionLogId
);

id_type!(
    /// Unique identifier for a scheduled email.
    ScheduledEmailId
);

id_type!(
    /// Provider-assigned identifier of a single message.
    MessageId
);

id_type!(
    /// Provider-assigned identifier of a thread (Gmail) or conversation (Outlook).
    ThreadId
);

impl TaskId {
    /// Generates a fresh random task ID.
    pub fn generate() -> Self {
        Self(format!("task-{}", uuid::Uuid::new_v4()))
    }
}

impl ExecutionLogId {
    /// Generates a fresh random execution log ID.
    pub fn generate() -> Self {
        Self(format!("run-{}", uuid::Uuid::new_v4()))
    }
}

impl ScheduledEmailId {
    /// Generates a fresh random scheduled email ID.
    pub fn generate() -> Self {
        Self(format!("sched-{}", uuid::Uuid::new_v4()))
    }
}
