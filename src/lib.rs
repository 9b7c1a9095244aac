//! A Discord bot that answers trigger words with canned text or a random file
//! from a media pool users grow with `!upload`.
//!
//! Storage, trigger matching, and message routing are always compiled and
//! transport-agnostic; the gateway, REST client, downloader, and the
//! [`bot::start`] event loop sit behind the `io` feature.

#[cfg(feature = "io")]
pub mod bot;
pub mod config;
pub mod dispatcher;
pub mod downloader;
pub mod events;
#[cfg(feature = "io")]
pub mod gateway;
#[cfg(feature = "io")]
pub mod http;
pub mod registry;
pub mod store;
pub mod types;

pub use dispatcher::{Dispatcher, Outcome, ReplySink};
pub use registry::{Response, ResponseRegistry};
pub use store::{MediaKind, MediaStore};
