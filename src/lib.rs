//! Clickguard - Identity-keyed rate limiting for a click board API
//!
//! This crate implements a fixed-window rate limiter that sits in front of
//! mutating HTTP operations and decides, per caller identity, whether a
//! request is admitted. Windows live in memory or in PostgreSQL, and a
//! background janitor keeps the store from growing without bound.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
