//! Ready-made [`Marshaller`](crate::method::Marshaller)s.
//!
//! * [`raw`] - opaque bytes and utf8 strings,
//! * `json` - [`serde_json::Value`] bodies (requires `json` feature).

#[cfg(feature = "json")]
pub mod json;
pub mod raw;
