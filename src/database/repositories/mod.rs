pub mod blob;
pub mod recovery;
pub mod session;
pub mod setting;

pub use blob::BlobStore;
pub use recovery::RecoveryStore;
pub use session::SessionsRepository;
pub use setting::SettingsRepository;

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Hot-path writes retry a few times with a linear backoff (1 s × attempt)
/// before the error propagates.
pub(crate) const MAX_WRITE_ATTEMPTS: u32 = 3;

pub(crate) async fn with_retries<T, E, F, Fut>(op_name: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < MAX_WRITE_ATTEMPTS => {
                warn!(
                    "{} failed (attempt {}/{}): {}",
                    op_name, attempt, MAX_WRITE_ATTEMPTS, e
                );
                tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = with_retries("op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(format!("boom {n}"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_three_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = with_retries("op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("always".to_string()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
