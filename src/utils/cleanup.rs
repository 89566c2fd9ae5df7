//! Scoped acquisition with a release step that always runs.
//!
//! Rust `Drop` cannot report failures, and several release steps here (resuming a
//! paused database, restarting stopped services) must surface their errors. So the
//! release is an explicit closure run after the body on every exit path.

use anyhow::Result;
use tracing::error;

/// Runs `body`, then `release` exactly once, whatever `body` returned.
///
/// Errors aggregate first-error-wins: a release failure is returned only when the
/// body succeeded, otherwise it is logged and the body's error is kept.
pub fn with_release<T, B, R>(body: B, release: R) -> Result<T>
where
    B: FnOnce() -> Result<T>,
    R: FnOnce() -> Result<()>,
{
    let outcome = body();
    let released = release();
    match (outcome, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(release_err)) => Err(release_err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(release_err)) => {
            error!("release step failed after an earlier error: {release_err:#}");
            Err(err)
        }
    }
}
