//! HTTP plumbing: named clients, retry policy and streaming downloads.

mod http;
mod retry;

pub use http::{DownloadOutcome, HttpClient, HttpClientOptions};
pub use retry::{RetryPolicy, transient_status};
