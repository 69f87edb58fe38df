//! Hierarchical, composable cancellation.
//!
//! A [`CancellationToken`] is a cheap clonable handle to a cancellable scope.
//! Cancelling a token cascades to every linked child, exactly once, and wakes
//! everything awaiting [`CancellationToken::cancelled`]. Ownership of a scope
//! belongs to a [`CancellationTokenSource`], which can also cancel on a delay
//! and refuses further use once disposed.

mod source;
mod token;

pub use source::CancellationTokenSource;
pub use token::{CancellationToken, Registration, TokenOptions};
