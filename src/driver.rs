//! Database connection seam for the notifier actor.
//!
//! The actor never touches the database directly; it drives a [`Driver`]
//! that owns the single underlying connection. [`PgDriver`] is the
//! production implementation on top of [`sqlx::postgres::PgListener`]:
//! it reconnects with capped exponential backoff and surfaces every
//! connect/disconnect transition so the actor can rebuild its LISTEN
//! state from the registry. Tests swap in a mock driver.

use std::time::Duration;

use sqlx::Executor as _;
use sqlx::postgres::PgListener;

use crate::config::RelayConfig;
use crate::error::RelayError;

/// Event delivered from the connection to the actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    /// The connection was (re-)established. The actor must re-issue
    /// LISTEN for every registered channel.
    Connected,

    /// The connection was lost. Notifications sent while disconnected
    /// are lost; the driver will reconnect on its own.
    Disconnected,

    /// A raw notification arrived on a channel.
    Notification {
        /// Full channel name as delivered by the database.
        channel: String,
        /// Notification payload.
        payload: String,
    },
}

/// The external connection primitive the actor collaborates with.
///
/// Exactly one command is in flight at a time: the actor awaits
/// [`execute`](Driver::execute) or [`notify`](Driver::notify) to
/// completion before processing its next message.
pub trait Driver: Send {
    /// Waits for the next connection event. The implementation owns
    /// reconnect scheduling; this future may be pending indefinitely.
    fn recv(&mut self) -> impl Future<Output = DriverEvent> + Send;

    /// Executes a batched multi-statement command (`LISTEN`/`UNLISTEN`)
    /// in a single round trip.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Disconnected`] when no connection is up, or
    /// [`RelayError::Database`] when the database rejects the command.
    fn execute(&mut self, sql: &str) -> impl Future<Output = Result<(), RelayError>> + Send;

    /// Publishes a batch of payloads to a channel, expanding to one
    /// notify event per payload server-side.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Disconnected`] when no connection is up, or
    /// [`RelayError::Database`] when the query fails.
    fn notify(
        &mut self,
        channel: &str,
        payloads: &[String],
    ) -> impl Future<Output = Result<(), RelayError>> + Send;
}

/// One parameterized round trip per publish call: the JSON array of
/// payload strings is unnested server-side into one `pg_notify` each.
const NOTIFY_SQL: &str =
    "SELECT pg_notify($1, payload) FROM jsonb_array_elements_text($2) AS payload";

/// Production driver backed by a dedicated `PgListener` connection.
///
/// Each session uses a fresh listener, so database-side LISTEN state
/// always starts empty and is rebuilt by the actor — the driver never
/// restores channels behind the actor's back.
pub struct PgDriver {
    url: String,
    min_delay: Duration,
    max_delay: Duration,
    delay: Duration,
    listener: Option<PgListener>,
}

impl PgDriver {
    /// Builds a driver from the relay configuration. No connection is
    /// attempted until the first [`recv`](Driver::recv).
    #[must_use]
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            url: config.database_url.clone(),
            min_delay: Duration::from_millis(config.reconnect_min_delay_ms),
            max_delay: Duration::from_millis(config.reconnect_max_delay_ms),
            delay: Duration::ZERO,
            listener: None,
        }
    }
}

impl std::fmt::Debug for PgDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgDriver")
            .field("connected", &self.listener.is_some())
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

impl Driver for PgDriver {
    async fn recv(&mut self) -> DriverEvent {
        loop {
            match self.listener.as_mut() {
                None => {
                    tokio::time::sleep(self.delay).await;
                    match PgListener::connect(&self.url).await {
                        Ok(listener) => {
                            self.listener = Some(listener);
                            self.delay = Duration::ZERO;
                            tracing::info!("database connection established");
                            return DriverEvent::Connected;
                        }
                        Err(error) => {
                            self.delay = next_delay(self.delay, self.min_delay, self.max_delay);
                            tracing::warn!(
                                error = %error,
                                retry_in_ms = self.delay.as_millis() as u64,
                                "database connection failed"
                            );
                        }
                    }
                }
                Some(listener) => match listener.try_recv().await {
                    Ok(Some(notification)) => {
                        return DriverEvent::Notification {
                            channel: notification.channel().to_string(),
                            payload: notification.payload().to_string(),
                        };
                    }
                    // `Ok(None)` means the connection dropped; discard the
                    // listener so the next session starts clean.
                    Ok(None) => {
                        self.listener = None;
                        self.delay = self.min_delay;
                        tracing::warn!("database connection lost");
                        return DriverEvent::Disconnected;
                    }
                    Err(error) => {
                        self.listener = None;
                        self.delay = self.min_delay;
                        tracing::warn!(error = %error, "database connection lost");
                        return DriverEvent::Disconnected;
                    }
                },
            }
        }
    }

    async fn execute(&mut self, sql: &str) -> Result<(), RelayError> {
        let Some(listener) = self.listener.as_mut() else {
            return Err(RelayError::Disconnected);
        };
        listener.execute(sqlx::raw_sql(sql)).await?;
        Ok(())
    }

    async fn notify(&mut self, channel: &str, payloads: &[String]) -> Result<(), RelayError> {
        let Some(listener) = self.listener.as_mut() else {
            return Err(RelayError::Disconnected);
        };
        let payloads = serde_json::Value::from(payloads.to_vec());
        sqlx::query(NOTIFY_SQL)
            .bind(channel)
            .bind(payloads)
            .execute(&mut *listener)
            .await?;
        Ok(())
    }
}

/// Doubles the backoff delay up to `max`, starting from `min`.
fn next_delay(current: Duration, min: Duration, max: Duration) -> Duration {
    if current.is_zero() {
        min
    } else {
        current.saturating_mul(2).min(max)
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let min = Duration::from_secs(1);
        let max = Duration::from_secs(60);

        let mut delay = Duration::ZERO;
        let mut observed = Vec::new();
        for _ in 0..8 {
            delay = next_delay(delay, min, max);
            observed.push(delay.as_secs());
        }
        assert_eq!(observed, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }
}
