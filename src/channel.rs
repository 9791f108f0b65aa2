//! Topic names and their mapping to database notification channels.
//!
//! Application code subscribes to [`Topic`]s; the database boundary
//! speaks full channel names of the form `"<prefix>.oban_<topic>"`.
//! The topic→channel mapping is injective and total; channel→topic is
//! partial — only channels matching the naming convention reverse-map.
//!
//! This module also renders the batched `LISTEN`/`UNLISTEN` statements
//! issued at the database boundary.

use std::fmt;

use serde::Serialize;

use crate::error::RelayError;

/// Separator between the namespace prefix and the topic marker in a full
/// channel name.
const CHANNEL_INFIX: &str = ".oban_";

/// A validated, application-facing subscription name.
///
/// Topics are non-empty and restricted to `[A-Za-z0-9_]`, which keeps
/// the derived channel name safe inside a double-quoted identifier and
/// makes the channel→topic reverse mapping unambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// Validates and wraps a topic name.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidTopic`] if the name is empty or
    /// contains characters outside `[A-Za-z0-9_]`.
    pub fn new(name: impl Into<String>) -> Result<Self, RelayError> {
        let name = name.into();
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if valid {
            Ok(Self(name))
        } else {
            Err(RelayError::InvalidTopic(name))
        }
    }

    /// Returns the topic name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Topic {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Derives the full channel name for a topic under the given prefix.
pub(crate) fn channel_name(prefix: &str, topic: &Topic) -> String {
    format!("{prefix}{CHANNEL_INFIX}{topic}")
}

/// Reverse-maps a full channel name back to its topic.
///
/// Returns `None` when the channel does not carry the expected prefix
/// and marker, or when the remainder is not a valid topic name.
pub(crate) fn channel_topic(prefix: &str, channel: &str) -> Option<Topic> {
    let rest = channel.strip_prefix(prefix)?.strip_prefix(CHANNEL_INFIX)?;
    Topic::new(rest).ok()
}

/// Renders one batched command with a `LISTEN` statement per channel.
pub(crate) fn listen_sql(channels: &[String]) -> String {
    batch_sql("LISTEN", channels)
}

/// Renders one batched command with an `UNLISTEN` statement per channel.
pub(crate) fn unlisten_sql(channels: &[String]) -> String {
    batch_sql("UNLISTEN", channels)
}

/// Joins per-channel statements into a single multi-statement command
/// executed in one simple-protocol round trip.
fn batch_sql(verb: &str, channels: &[String]) -> String {
    channels
        .iter()
        .map(|channel| format!("{verb} {};", quote_ident(channel)))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Double-quotes an identifier, doubling any embedded quote characters.
fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn topic_accepts_word_characters() {
        assert!(Topic::new("job_insert").is_ok());
        assert!(Topic::new("Leader2").is_ok());
    }

    #[test]
    fn topic_rejects_empty_and_unsafe_names() {
        for name in ["", "job.insert", "job insert", "job\"insert", "jöb"] {
            let Err(RelayError::InvalidTopic(t)) = Topic::new(name) else {
                panic!("topic {name:?} should be rejected");
            };
            assert_eq!(t, name);
        }
    }

    #[test]
    fn channel_round_trip() {
        let Ok(topic) = Topic::new("job_insert") else {
            panic!("valid topic");
        };
        let channel = channel_name("public", &topic);
        assert_eq!(channel, "public.oban_job_insert");
        assert_eq!(channel_topic("public", &channel), Some(topic));
    }

    #[test]
    fn foreign_channels_never_reverse_map() {
        assert_eq!(channel_topic("public", "public.jobs"), None);
        assert_eq!(channel_topic("public", "other.oban_jobs"), None);
        assert_eq!(channel_topic("public", "publicx.oban_jobs"), None);
        assert_eq!(channel_topic("public", "public.oban_"), None);
        assert_eq!(channel_topic("public", "public.oban_a.b"), None);
    }

    #[test]
    fn listen_sql_batches_one_statement_per_channel() {
        let channels = vec![
            "public.oban_signal".to_string(),
            "public.oban_leader".to_string(),
        ];
        assert_eq!(
            listen_sql(&channels),
            "LISTEN \"public.oban_signal\"; LISTEN \"public.oban_leader\";"
        );
        assert_eq!(
            unlisten_sql(&channels),
            "UNLISTEN \"public.oban_signal\"; UNLISTEN \"public.oban_leader\";"
        );
    }

    #[test]
    fn quote_ident_doubles_embedded_quotes() {
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}
