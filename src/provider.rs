//! Provider-facing descriptors.
//!
//! `descriptor` exposes validated metadata (`ProviderDescriptor`) covering HTTPS-only
//! endpoints, supported grant flags, client authentication preferences, and the optional
//! issuer/JWK Set pair used for ID-token verification.

pub mod descriptor;

pub use descriptor::*;
