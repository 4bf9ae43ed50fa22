//! GitHub integration for Magpie
//!
//! Implements the core [`SourceChangeProvider`] interface over the GitHub
//! API: pull request changed-file listing and per-file diff retrieval.
//!
//! [`SourceChangeProvider`]: magpie_core::SourceChangeProvider

pub mod client;
pub mod error;
pub mod provider;

pub use client::GitHubClient;
pub use error::{Error, Result};
pub use provider::{parse_subject, GitHubProvider};
