//! Core types shared across the relay: the error taxonomy and the
//! principal/authorization model.

pub mod error;
pub mod principal;

pub use error::RouterError;
pub use principal::{Allowlist, Principal, assert_allowed_upstream, token_fingerprint};
