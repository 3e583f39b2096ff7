//! Signed, rate-limited OKX V5 REST transport.
//!
//! This crate provides:
//! - `RestClient`: HMAC-signed requests with retry, backoff, and
//!   credential-invalid poisoning
//! - `RateLimiter`: per-category token-bucket admission control
//! - Typed endpoint wrappers for every REST call the engine makes

pub mod api;
pub mod client;
pub mod error;
pub mod rate_limiter;
pub mod sign;

pub use api::{
    wire_decimal, AlgoOrderRequest, BalanceSnapshot, Candle, CancelAck, OrderAck, OrderRequest,
    RawAlgoOrder, RawFill, RawPendingOrder, RawPosition,
};
pub use client::{ApiEnvelope, Method, RestClient, DEFAULT_RETRIES, LIVE_REST_URL};
pub use error::{ApiError, RestResult};
pub use rate_limiter::{EndpointCategory, RateLimiter};
pub use sign::{canonical_json, signing_timestamp, sorted_query, Credentials};
