// ABOUTME: PostgreSQL connection layer shared by both sides of a sync run
// ABOUTME: Re-exports session handling and connect helpers

pub mod connection;

pub use connection::{connect, connect_with_retry, init_tls_policy, PgSession, SessionSettings};
