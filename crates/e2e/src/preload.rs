//! In-page instrumentation installed in every isolated context before any
//! page script runs.
//!
//! - A layout-shift accumulator (`window.__settleScore`) with a reset hook,
//!   sampled after interactions as the settlement score.
//! - A `fetch` wrapper that retries HTTP 429 with the rate-limit backoff.

use cartcheck_common::backoff::BackoffPolicy;
use std::time::Duration;

/// Attempts made by the in-page fetch wrapper, first try included.
pub const FETCH_MAX_ATTEMPTS: u32 = 6;

/// Reads the accumulated layout shift since the last reset.
pub const READ_SETTLE_SCORE: &str = "() => Number(window.__settleScore || 0)";

/// Zeroes the layout-shift accumulator.
pub const RESET_SETTLE_SCORE: &str =
    "() => { if (typeof window.__settleReset === 'function') window.__settleReset(); return true; }";

/// Reply budget for an evaluation whose `fetch` calls may hit a rate limit:
/// `base` plus every backoff wait the in-page wrapper can take.
pub fn fetch_timeout(base: Duration, rate_limit: &BackoffPolicy) -> Duration {
    base + rate_limit.worst_case_total(FETCH_MAX_ATTEMPTS)
}

/// Build the init script for the given rate-limit policy.
pub fn preload_script(rate_limit: &BackoffPolicy) -> String {
    format!(
        r#"(() => {{
  try {{
    window.__settleScore = 0;
    window.__settleReset = () => {{ window.__settleScore = 0; }};
    new PerformanceObserver((list) => {{
      for (const e of list.getEntries()) {{
        if (!e.hadRecentInput) window.__settleScore += e.value;
      }}
    }}).observe({{ type: "layout-shift", buffered: true }});
  }} catch (_) {{}}

  try {{
    const orig = window.fetch && window.fetch.bind(window);
    if (!orig || window.__fetchWrapped) return;
    window.__fetchWrapped = true;
    const MAX_ATTEMPTS = {max_attempts};
    const BASE_MS = {base_ms};
    const JITTER_MS = {jitter_ms};
    const CAP_MS = {cap_ms};
    const sleep = (ms) => new Promise((res) => setTimeout(res, ms));
    window.fetch = async (...args) => {{
      let lastErr = null;
      for (let attempt = 1; attempt <= MAX_ATTEMPTS; attempt++) {{
        try {{
          const res = await orig(...args);
          if (res.status !== 429) return res;
          lastErr = new Error(`HTTP 429 (attempt ${{attempt}})`);
        }} catch (e) {{
          lastErr = e;
        }}
        if (attempt >= MAX_ATTEMPTS) break;
        const delay = Math.min(CAP_MS, BASE_MS * Math.pow(2, attempt - 1) + Math.random() * JITTER_MS);
        console.warn(`[fetch-backoff] retry ${{attempt}}/${{MAX_ATTEMPTS}} | delay=${{delay.toFixed(0)}}ms`);
        await sleep(delay);
      }}
      throw lastErr || new Error("fetch failed");
    }};
  }} catch (_) {{}}
}})();"#,
        max_attempts = FETCH_MAX_ATTEMPTS,
        base_ms = rate_limit.base.as_millis(),
        jitter_ms = rate_limit.jitter.as_millis(),
        cap_ms = rate_limit.cap.as_millis(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preload_embeds_policy() {
        let script = preload_script(&BackoffPolicy::RATE_LIMIT);
        assert!(script.contains("const BASE_MS = 1000;"));
        assert!(script.contains("const CAP_MS = 60000;"));
        assert!(script.contains("const MAX_ATTEMPTS = 6;"));
        assert!(script.contains("window.__settleReset"));
    }

    #[test]
    fn test_fetch_timeout_outlasts_wrapper_retries() {
        let budget = fetch_timeout(Duration::from_secs(15), &BackoffPolicy::RATE_LIMIT);
        assert_eq!(budget, Duration::from_secs(15 + 36));
    }
}
