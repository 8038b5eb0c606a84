//! Askbox Server - Anonymous question box.
//!
//! This crate provides the server for Askbox, responsible for:
//! - Accepting anonymous questions, rate limited per client
//! - Letting an admin answer questions behind a password or signed token
//! - Pushing live updates to connected WebSocket viewers
//!
//! # Architecture
//!
//! Request handlers in [`routes`] drive three independent components:
//! the [`rate_limit::RateLimiter`], the [`broadcast::BroadcastHub`] and the
//! [`auth::AuthGate`]. Questions are held in memory by [`store`].

pub mod auth;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod identity;
pub mod rate_limit;
pub mod reload;
pub mod routes;
pub mod store;
pub mod types;
