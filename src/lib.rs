#![forbid(unsafe_code)]

//! Library half of the era-api service: every piece the `backend` binary wires
//! together to turn a search phrase or video link into an archived media link.

pub mod archive;
pub mod cache;
pub mod config;
pub mod error;
pub mod extractor;
pub mod query;
pub mod relay;
pub mod search;
pub mod security;
