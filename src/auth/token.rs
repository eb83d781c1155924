//! Persisted token shapes and the redacted secret wrapper.

pub mod record;
pub mod secret;
