//! Refresh capability: per-variant routines that make the UI reflect a state
//! change performed behind its back.
//!
//! The heuristics themselves live in a prebuilt in-page bundle. This module
//! decides which handler the bundle should run and injects it.

use async_trait::async_trait;
use cartcheck_common::backoff::BackoffPolicy;
use serde_json::{json, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::browser::PageSession;
use crate::error::{E2eError, E2eResult};
use crate::playwright::DEFAULT_EVALUATE_TIMEOUT;
use crate::preload::fetch_timeout;
use crate::storefront::TestableItem;

/// Known implementation variants with a dedicated refresh handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefreshVariant {
    Dawn,
    MrParker,
    Impact,
    ImpactThemeShape,
    Hyper,
    Grid,
    Sunrise,
    Balance,
    Unknown,
}

/// Schema names and brand aliases, keyed in loose form.
const REGISTRY: &[(&str, RefreshVariant)] = &[
    ("dawn", RefreshVariant::Dawn),
    ("mr parker", RefreshVariant::MrParker),
    ("impact", RefreshVariant::Impact),
    ("impact theme shape", RefreshVariant::ImpactThemeShape),
    ("hyper", RefreshVariant::Hyper),
    ("grid", RefreshVariant::Grid),
    ("sunrise", RefreshVariant::Sunrise),
    ("balance", RefreshVariant::Balance),
    ("nest", RefreshVariant::MrParker),
    ("pillar", RefreshVariant::Hyper),
    ("flora", RefreshVariant::Grid),
    ("jellybean", RefreshVariant::Sunrise),
    ("sense", RefreshVariant::Dawn),
    ("craft", RefreshVariant::Dawn),
    ("studio", RefreshVariant::Dawn),
    ("taste", RefreshVariant::Dawn),
    ("origin", RefreshVariant::Dawn),
    ("spotlight", RefreshVariant::Dawn),
    ("refresh", RefreshVariant::Dawn),
    ("ride", RefreshVariant::Dawn),
    ("publisher", RefreshVariant::Dawn),
    ("colorblock", RefreshVariant::Dawn),
    ("taste2", RefreshVariant::Dawn),
];

fn loose(s: &str) -> String {
    s.trim().to_lowercase()
}

fn compact(s: &str) -> String {
    loose(s)
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

impl RefreshVariant {
    /// Resolve a detected schema name. Matches the loose form first, then the
    /// form with every non-alphanumeric character removed.
    pub fn from_schema(schema_name: &str) -> Self {
        let loose_key = loose(schema_name);
        if loose_key.is_empty() {
            return RefreshVariant::Unknown;
        }
        if let Some((_, v)) = REGISTRY.iter().find(|(k, _)| *k == loose_key) {
            return *v;
        }
        let compact_key = compact(schema_name);
        REGISTRY
            .iter()
            .find(|(k, _)| compact(k) == compact_key)
            .map(|(_, v)| *v)
            .unwrap_or(RefreshVariant::Unknown)
    }

    /// Canonical handler key understood by the bundle.
    pub fn handler_key(&self) -> Option<&'static str> {
        match self {
            RefreshVariant::Dawn => Some("dawn"),
            RefreshVariant::MrParker => Some("mr parker"),
            RefreshVariant::Impact => Some("impact"),
            RefreshVariant::ImpactThemeShape => Some("impact theme shape"),
            RefreshVariant::Hyper => Some("hyper"),
            RefreshVariant::Grid => Some("grid"),
            RefreshVariant::Sunrise => Some("sunrise"),
            RefreshVariant::Balance => Some("balance"),
            RefreshVariant::Unknown => None,
        }
    }
}

impl fmt::Display for RefreshVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.handler_key().unwrap_or("unknown"))
    }
}

#[async_trait]
pub trait RefreshCapability: Send + Sync {
    /// Try to make the page reflect the item just added. `Ok(false)` means
    /// the routine ran but reported no success.
    async fn attempt_refresh(
        &self,
        page: &mut dyn PageSession,
        item: &TestableItem,
        variant: RefreshVariant,
    ) -> E2eResult<bool>;
}

const INVOKE_JS: &str = r#"async (key) => {
  const g = window;
  try {
    if (g.RC && typeof g.RC.refreshCart === "function") {
      return !!(await g.RC.refreshCart(key));
    }
    if (typeof g.refreshCart === "function") {
      return !!(await g.refreshCart(key));
    }
  } catch (e) {
    console.error(e);
  }
  return false;
}"#;

/// Injects the refresh bundle and calls its entry point.
#[derive(Debug, Clone)]
pub struct ScriptedRefresh {
    bundle: String,
    source: PathBuf,
    fetch_timeout: Duration,
}

impl ScriptedRefresh {
    pub fn new(bundle: impl Into<String>) -> Self {
        Self {
            bundle: bundle.into(),
            source: PathBuf::new(),
            fetch_timeout: fetch_timeout(DEFAULT_EVALUATE_TIMEOUT, &BackoffPolicy::RATE_LIMIT),
        }
    }

    /// Reply budget for the handler call, which re-fetches cart sections.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Read the bundle from disk.
    pub fn load(path: &Path) -> E2eResult<Self> {
        let bundle = std::fs::read_to_string(path).map_err(|e| {
            E2eError::DelegateFailure(format!("cannot read {}: {}", path.display(), e))
        })?;
        Ok(Self {
            source: path.to_path_buf(),
            ..Self::new(bundle)
        })
    }

    pub fn source(&self) -> &Path {
        &self.source
    }
}

#[async_trait]
impl RefreshCapability for ScriptedRefresh {
    async fn attempt_refresh(
        &self,
        page: &mut dyn PageSession,
        item: &TestableItem,
        variant: RefreshVariant,
    ) -> E2eResult<bool> {
        page.add_script(&self.bundle)
            .await
            .map_err(|e| E2eError::DelegateFailure(format!("inject: {}", e)))?;

        let key = match variant.handler_key() {
            Some(k) => json!(k),
            None => json!(item.identity),
        };
        debug!("Invoking refresh handler {} ({})", variant, key);

        let ok = page
            .evaluate_within(INVOKE_JS, key, self.fetch_timeout)
            .await
            .map_err(|e| E2eError::DelegateFailure(e.to_string()))?;
        Ok(matches!(ok, Value::Bool(true)))
    }
}
