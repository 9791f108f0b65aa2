//! # pg-relay
//!
//! A pub/sub relay on top of PostgreSQL `LISTEN`/`NOTIFY`. Many
//! independent in-process subscribers register interest in logical
//! topics; the relay multiplexes that interest onto a single outbound
//! database connection and fans inbound notifications back out to
//! exactly the subscribers who asked for each topic.
//!
//! The heart of the crate is a single actor task that reconciles three
//! independent sources of change — subscribe/unsubscribe calls,
//! subscriber drops, and connection loss/reconnect — into one
//! consistent view of which channels are LISTENed and who receives
//! what, issuing at most the necessary `LISTEN`/`UNLISTEN` traffic.
//!
//! ## Architecture
//!
//! ```text
//! Subscribers (Subscription)        Publishers (Notifier::notify)
//!     │  recv Envelopes                 │  payload batches
//!     └────────────┐      ┌─────────────┘
//!                  ▼      ▼
//!            Notifier actor (notifier)
//!                  │
//!       Registry (registry) + channel naming, wire SQL (channel)
//!                  │
//!                  ▼
//!            Driver (driver) — PgListener, reconnect backoff
//!                  │
//!              PostgreSQL
//! ```
//!
//! Notifications published while the connection is down are lost; that
//! is a property of the underlying notify mechanism. Subscription state
//! lives only in memory and is replayed to the database on reconnect.

pub mod channel;
pub mod config;
pub mod driver;
pub mod error;
pub mod notifier;
mod registry;
