//! Floodgate - Sliding-Window Admission Control
//!
//! This crate implements sliding-window-log rate limiting with a pluggable,
//! capacity-bounded storage backend. A [`limiter::Limiter`] evaluates named
//! limits ("requests", "votes", ...) against per-key hit logs held in a
//! [`store::WindowStore`]; the default backend is a bounded in-process store,
//! with a contract for external atomic backends in multi-process deployments.

pub mod clock;
pub mod config;
pub mod error;
pub mod limiter;
pub mod store;
