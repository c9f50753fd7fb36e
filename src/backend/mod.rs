//! Ingress backends that speak a wire protocol directly to a TCP socket,
//! as opposed to the HTTP-mounted [`crate::api`] surface.

pub mod dimse;
