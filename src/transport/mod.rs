//! Connection layer able to send informational responses mid-request.
//!
//! `axum::serve` (hyper) has no server-side API for 1xx responses other
//! than `100 Continue`, so requests are framed here and handed to the
//! router with an `InterimResponder` in their extensions.

pub mod body;
pub mod http1;
pub mod interim;

pub use http1::{serve, serve_connection};
pub use interim::{InterimError, InterimResponder};
