//! Bounded retry for optimistic-conflict loops.
//!
//! Kept separate from the store so the retry policy is testable on its
//! own: the combinator knows nothing about watches or batches, only about
//! attempts that either commit, conflict, or fail.

use std::future::Future;

/// Outcome of a single optimistic attempt.
pub(crate) enum Attempt<T> {
    /// The attempt committed with this result.
    Committed(T),
    /// The store reported a conflict; the attempt may be retried.
    Conflicted,
}

/// Runs `body` until an attempt commits or `max_attempts` attempts have
/// conflicted.
///
/// Returns `Ok(Some(value))` on the first commit and `Ok(None)` once the
/// bound is exhausted. An error from `body` is returned immediately,
/// without retrying. The attempt number passed to `body` starts at 1; a
/// bound of 0 still runs one attempt.
pub(crate) async fn until_committed<T, E, F, Fut>(
    max_attempts: u32,
    mut body: F,
) -> Result<Option<T>, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Attempt<T>, E>>,
{
    let bound = max_attempts.max(1);
    for attempt in 1..=bound {
        match body(attempt).await? {
            Attempt::Committed(value) => return Ok(Some(value)),
            Attempt::Conflicted => {}
        }
    }
    Ok(None)
}
