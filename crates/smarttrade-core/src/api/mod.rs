//! Authenticated REST client for the SmartTrade gateway.
//!
//! This module provides the `ApiClient`, which attaches the stored bearer
//! token to every request, classifies failures into an `ErrorKind`, and
//! transparently refreshes an expired token once before giving up with
//! `ApiError::SessionExpired`.

pub mod account;
pub mod client;
pub mod endpoints;
pub mod error;
pub mod request;

pub use account::{LoginResponse, MessageResponse, SessionInfo};
pub use client::ApiClient;
pub use error::{classify, ApiError, ErrorKind, TransportOutcome};
pub use request::RequestDescriptor;
