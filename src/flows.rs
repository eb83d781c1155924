//! Authorization Code flow, PKCE helpers, and the authorization state store.

pub mod auth_code;
pub mod pkce;
pub mod state;

pub use auth_code::*;
pub use pkce::{PkceMethod, PkcePair};
pub use state::*;
