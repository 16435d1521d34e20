use super::host::PageHost;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Polls `check` every `interval` until it returns true or `timeout` elapses.
/// The first check runs immediately. Returns whether the condition was met.
pub async fn poll_until<F, Fut>(timeout: Duration, interval: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}

/// True once every selector matches at least one element. Script errors
/// count as "not yet".
pub async fn selectors_present(host: &dyn PageHost, selectors: &[String]) -> bool {
    for selector in selectors {
        match host.query_count(selector).await {
            Ok(n) if n > 0 => {}
            _ => return false,
        }
    }
    true
}

/// True once at least `min` elements match `selector`.
pub async fn at_least(host: &dyn PageHost, selector: &str, min: usize) -> bool {
    host.query_count(selector)
        .await
        .map(|n| n >= min)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn condition_met_after_a_few_polls() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let met = poll_until(Duration::from_secs(5), Duration::from_millis(120), move || async move {
            calls.fetch_add(1, Ordering::SeqCst) >= 2
        })
        .await;
        assert!(met);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_at_the_deadline() {
        let started = Instant::now();
        let met = poll_until(Duration::from_millis(500), Duration::from_millis(120), || async {
            false
        })
        .await;
        assert!(!met);
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(started.elapsed() < Duration::from_millis(700));
    }
}
