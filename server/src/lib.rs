//! Gatehouse Server - authenticated JSON API gateway with realtime rooms.
//!
//! This crate provides two dispatch engines that share one authentication
//! and validation pipeline:
//! - An HTTP dispatcher over a registry of JSON routes
//! - A realtime gateway that fans messages out to named rooms
//!
//! # Architecture
//!
//! Both engines authenticate callers with a signed session cookie
//! ([`auth`]). HTTP requests run through the [`dispatch`] pipeline and are
//! answered with a uniform [`envelope`]. Realtime connections are upgraded
//! by the [`gateway`] and joined to rooms managed by the [`rooms`] hub.
//! Route handlers are registered by the embedding application through
//! [`registry`]; nothing is persisted.

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod gateway;
pub mod registry;
pub mod rooms;
pub mod routes;
pub mod schema;
