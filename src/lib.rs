//! An unofficial Rust client for Meta AI image and video generation.
//!
//! The client replays a browser session from cookies, speaks the GraphQL generation
//! protocol and resolves the media the assistant produces into downloadable URLs.
//! An axum front-end exposes the same operations over HTTP.
//!
//! ## Features
//! - Image and video generation from text prompts, optionally with uploaded images.
//! - Decoding of JSON, streamed JSON, multipart and event-stream responses.
//! - Media resolution by polling with a conversation-page fallback.
//! - Automatic credential refresh after auth failures.
//! - Background video jobs for the HTTP server.

pub mod auth;
pub mod client;
pub mod config;
pub mod credentials;
pub mod decode;
pub mod error;
pub mod extract;
pub mod jobs;
pub mod poll;
pub mod request;
pub mod resolve;
pub mod routes;
pub mod scrape;
pub mod types;
pub mod upload;

pub use crate::client::{MetaAiClient, MetaAiClientBuilder};
pub use crate::config::ServerConfig;
pub use crate::credentials::{CredentialStore, Credentials};
pub use crate::error::MetaAiError;
pub use crate::jobs::{Job, JobError, JobOrchestrator, JobState};
pub use crate::poll::{Backoff, PollPolicy};
pub use crate::resolve::{MediaSource, ResolutionPolicy};
pub use crate::routes::{create_router, AppState};
pub use crate::types::*;
pub use crate::upload::UploadPolicy;
