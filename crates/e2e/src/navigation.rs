//! Navigation with retry on rate limiting and transient failures

use cartcheck_common::backoff::{parse_retry_after, BackoffPolicy};
use std::time::Duration;
use tracing::{error, warn};

use crate::browser::{NavigationResponse, PageSession};
use crate::error::{E2eError, E2eResult};

/// Bounds for one retried navigation.
#[derive(Debug, Clone, Copy)]
pub struct NavigationPlan {
    pub max_attempts: u32,
    pub timeout: Duration,
    pub transient: BackoffPolicy,
    pub rate_limit: BackoffPolicy,
}

impl Default for NavigationPlan {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            timeout: Duration::from_secs(60),
            transient: BackoffPolicy::NAVIGATION,
            rate_limit: BackoffPolicy::RATE_LIMIT,
        }
    }
}

/// Navigate to `url`, retrying 429s and transient errors within the plan.
///
/// A 429 on the last attempt surfaces as `E2eError::RateLimited`; a transient
/// error on the last attempt is returned as-is.
pub async fn goto_with_retry(
    page: &mut dyn PageSession,
    url: &str,
    label: &str,
    plan: &NavigationPlan,
) -> E2eResult<NavigationResponse> {
    let max = plan.max_attempts.max(1);

    for attempt in 1..=max {
        match page.goto(url, plan.timeout).await {
            Ok(resp) if resp.is_rate_limited() => {
                if attempt >= max {
                    error!("[goto] 429 for {} (attempt {}/{}), giving up", label, attempt, max);
                    return Err(E2eError::RateLimited {
                        url: url.to_string(),
                        attempts: attempt,
                    });
                }
                let hint = resp.retry_after.as_deref().and_then(parse_retry_after);
                let delay = plan.rate_limit.delay_with_hint(attempt, hint);
                warn!(
                    "[goto] 429 for {} (attempt {}/{}), sleeping {}ms",
                    label,
                    attempt,
                    max,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }
            Ok(resp) => return Ok(resp),
            Err(e) if e.is_transient() && attempt < max => {
                let delay = plan.transient.delay(attempt);
                warn!(
                    "[goto] error on {} (attempt {}/{}): {}, sleeping {}ms",
                    label,
                    attempt,
                    max,
                    e,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!("[goto] error on {} (attempt {}/{}), giving up: {}", label, attempt, max, e);
                return Err(e);
            }
        }
    }

    Err(E2eError::TransientNetwork(format!("navigation exhausted for {}", label)))
}
