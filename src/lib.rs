//! Turnstile - In-process Rate Limiting
//!
//! This crate implements a fixed-window, per-key rate limiter for sensitive
//! endpoints such as login, OTP issuance and password reset. Memory stays
//! bounded regardless of how many distinct keys callers present: idle keys
//! expire and the least recently used keys are evicted past a hard cap.

pub mod config;
pub mod error;
pub mod ratelimit;
