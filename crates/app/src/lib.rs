//! `courier-app`: composition root.
//!
//! - `runtime`: the process-wide queue manager accessor
//! - `bootstrap`: broker selection and startup wiring used by the binary
//! - `email_service`: producer API that enqueues outgoing email

pub mod bootstrap;
pub mod email_service;
pub mod runtime;
