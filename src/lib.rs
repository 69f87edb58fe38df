//! Headless core of a yt-dlp desktop frontend: a single-flight download
//! queue around the external media tool, managed installs of the tool and
//! its helpers, and a self-update pipeline with a mandatory integrity gate.
//! Everything long-running is cancellable through a hierarchical token
//! framework.

pub mod cancellation;
pub mod error;
pub mod events;
pub mod github;
pub mod jobs;
pub mod net;
pub mod process;
pub mod settings;
pub mod setup;
pub mod updater;

pub use error::{Error, Result};

/// User agent sent with every outbound request.
pub const USER_AGENT: &str = concat!("mediagrab/", env!("CARGO_PKG_VERSION"));

/// Repository the app updates itself from.
pub const REPO_OWNER: &str = "mediagrab";
pub const REPO_NAME: &str = "mediagrab";
