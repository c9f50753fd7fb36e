//! STOW-RS ingress.

pub mod routes;
pub mod service;

pub use routes::{routes, StowState};
