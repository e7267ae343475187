//! # almanac-api
//!
//! HTTP management surface for the almanac workflow scheduler.
//!
//! Exposes backfill CRUD and the per-instance event log under `/api/v3`.
//! Every handler is a pure function over storage and the state manager;
//! handlers never hold locks across I/O. Every response carries an
//! `X-Request-Id` header (inbound echo or freshly minted), and unhandled
//! errors convert to a 500 whose reason includes the request id.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod context;
pub mod error;
pub mod payloads;
pub mod routes;
pub mod server;

pub use error::{ApiError, ApiResult};
pub use server::AppState;
