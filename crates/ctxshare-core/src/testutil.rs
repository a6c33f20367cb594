//! Shared helpers for async tests.

use std::{future::Future, time::Duration};

/// Poll `probe` until it yields true, panicking after a few seconds.
pub(crate) async fn wait_until<F, Fut>(probe: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if probe().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}

/// Poll `probe` for a short grace period and panic if it ever yields true.
/// Used to assert that something does NOT happen.
pub(crate) async fn assert_never<F, Fut>(probe: F, what: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..30 {
        if probe().await {
            panic!("unexpected: {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
