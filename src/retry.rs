use std::future::Future;
use std::time::Duration;

/// Retry a lazy async producer with a fixed delay between attempts.
///
/// `count` is the total number of attempts, including the first one; a
/// `count` of zero is treated as one attempt. On exhaustion the last error is
/// returned. There is no backoff: the delay between attempts is constant.
pub async fn retry_with_delay<T, E, F, Fut>(
    interval: Duration,
    count: u32,
    mut produce: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = count.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match produce().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt >= attempts {
                    return Err(e);
                }
                tokio::time::sleep(interval).await;
            }
        }
    }
}
