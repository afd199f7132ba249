//! Transit ticket issuance backend.
//!
//! Turns completed payments into time-limited transit tickets, registers every
//! ticket with the municipal provider and lets holders recover their ticket from
//! any device through a cookie-carried recovery token.

pub mod api;
#[cfg(feature = "cache")]
pub mod cache;
pub mod clock;
pub mod config;
pub mod database;
pub mod error;
pub mod health;
pub mod logging;
pub mod middleware;
pub mod orders;
pub mod provider;
pub mod services;
pub mod tickets;
pub mod workers;
