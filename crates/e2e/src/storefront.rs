//! Page-inspection collaborator for storefront subjects

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use cartcheck_common::backoff::BackoffPolicy;

use crate::browser::PageSession;
use crate::error::E2eResult;
use crate::playwright::DEFAULT_EVALUATE_TIMEOUT;
use crate::preload::fetch_timeout;

/// Implementation variant reported by the page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct VariantInfo {
    #[serde(default)]
    pub schema_name: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub schema_id: String,
}

/// One concrete purchasable unit found on the subject.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TestableItem {
    /// Listing handle used to build the detail view URL
    pub handle: String,

    /// Identity handed to the direct action and the refresh delegate
    #[serde(deserialize_with = "string_or_number")]
    pub identity: String,

    /// Absolute URL of the item's detail view
    pub detail_url: String,

    /// Which lookup produced the item
    #[serde(default)]
    pub source: String,
}

/// The primary interactive control on a detail view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub selector: String,
}

#[async_trait]
pub trait PageInspector: Send + Sync {
    async fn detect_variant(&self, page: &mut dyn PageSession) -> E2eResult<Option<VariantInfo>>;

    /// Locate one testable item: paged listing scan first, then the
    /// single-resource fallback for the current detail view.
    async fn resolve_testable_item(
        &self,
        page: &mut dyn PageSession,
    ) -> E2eResult<Option<TestableItem>>;

    async fn locate_trigger(
        &self,
        page: &mut dyn PageSession,
        wait: Duration,
    ) -> E2eResult<Option<Trigger>>;

    /// Perform the state-changing action directly, bypassing the UI.
    async fn invoke_direct_action(
        &self,
        page: &mut dyn PageSession,
        item: &TestableItem,
    ) -> E2eResult<bool>;
}

/// Inspector for Shopify-style storefronts.
#[derive(Debug, Clone)]
pub struct StorefrontInspector {
    pub trigger_selector: String,
    pub max_listing_pages: u32,

    /// Reply budget for the evaluations that call `fetch`
    pub fetch_timeout: Duration,
}

impl Default for StorefrontInspector {
    fn default() -> Self {
        Self {
            trigger_selector: r#"form[action*="/cart/add"] button"#.to_string(),
            max_listing_pages: 20,
            fetch_timeout: fetch_timeout(DEFAULT_EVALUATE_TIMEOUT, &BackoffPolicy::RATE_LIMIT),
        }
    }
}

impl StorefrontInspector {
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }
}

const DETECT_VARIANT_JS: &str = r#"() => {
  const t = window.Shopify && window.Shopify.theme;
  if (!t) return null;
  const name = t.schema_name || t.name || "";
  return { schema_name: name, schema_id: name ? (t.id ?? "") : "" };
}"#;

const RESOLVE_ITEM_JS: &str = r#"async (maxPages) => {
  const pickVariant = (p) => {
    const vs = Array.isArray(p && p.variants) ? p.variants : [];
    return vs.find((v) => v && v.available) || vs[0] || null;
  };
  try {
    for (let page = 1; page <= maxPages; page++) {
      const r = await fetch(`/products.json?page=${page}`, { credentials: "same-origin" });
      if (!r.ok) break;
      const data = await r.json();
      const list = Array.isArray(data && data.products) ? data.products : [];
      if (list.length === 0) break;
      const pick =
        list.find((p) => Array.isArray(p && p.variants) && p.variants.some((v) => v && v.available)) ||
        list[0];
      const v = pick ? pickVariant(pick) : null;
      if (pick && pick.handle && v && v.id) {
        return {
          handle: pick.handle,
          identity: v.id,
          detail_url: `${location.origin}/products/${pick.handle}`,
          source: `/products.json?page=${page}`,
        };
      }
    }
  } catch (_) {}
  try {
    const m = location.pathname.match(/\/products\/([^/?#]+)/);
    if (m && m[1]) {
      const r = await fetch(`/products/${m[1]}.js`, { credentials: "same-origin" });
      if (r.ok) {
        const p = await r.json();
        const v = pickVariant(p);
        const handle = (p && p.handle) || m[1];
        if (v && v.id) {
          return {
            handle,
            identity: v.id,
            detail_url: `${location.origin}/products/${handle}`,
            source: "product.js",
          };
        }
      }
    }
  } catch (_) {}
  return null;
}"#;

const DIRECT_ACTION_JS: &str = r#"async (id) => {
  try {
    const r = await fetch("/cart/add.js", {
      method: "POST",
      credentials: "same-origin",
      headers: { "content-type": "application/json", accept: "application/json" },
      body: JSON.stringify({ id: /^\d+$/.test(id) ? Number(id) : id, quantity: 1 }),
    });
    return r.ok;
  } catch (_) {
    return false;
  }
}"#;

#[async_trait]
impl PageInspector for StorefrontInspector {
    async fn detect_variant(&self, page: &mut dyn PageSession) -> E2eResult<Option<VariantInfo>> {
        let value = page.evaluate(DETECT_VARIANT_JS, Value::Null).await?;
        Ok(parse_variant(value))
    }

    async fn resolve_testable_item(
        &self,
        page: &mut dyn PageSession,
    ) -> E2eResult<Option<TestableItem>> {
        let value = page
            .evaluate_within(
                RESOLVE_ITEM_JS,
                json!(self.max_listing_pages),
                self.fetch_timeout,
            )
            .await?;
        let item = parse_item(value);
        if let Some(item) = &item {
            debug!("Resolved item {} via {}", item.handle, item.source);
        }
        Ok(item)
    }

    async fn locate_trigger(
        &self,
        page: &mut dyn PageSession,
        wait: Duration,
    ) -> E2eResult<Option<Trigger>> {
        let found = page.wait_for_selector(&self.trigger_selector, wait).await?;
        Ok(found.then(|| Trigger {
            selector: self.trigger_selector.clone(),
        }))
    }

    async fn invoke_direct_action(
        &self,
        page: &mut dyn PageSession,
        item: &TestableItem,
    ) -> E2eResult<bool> {
        let ok = page
            .evaluate_within(DIRECT_ACTION_JS, json!(item.identity), self.fetch_timeout)
            .await?;
        Ok(ok.as_bool().unwrap_or(false))
    }
}

fn parse_variant(value: Value) -> Option<VariantInfo> {
    if value.is_null() {
        return None;
    }
    serde_json::from_value(value)
        .ok()
        .filter(|v: &VariantInfo| !v.schema_name.is_empty())
}

fn parse_item(value: Value) -> Option<TestableItem> {
    if value.is_null() {
        return None;
    }
    serde_json::from_value(value)
        .ok()
        .filter(|i: &TestableItem| !i.handle.is_empty() && !i.identity.is_empty())
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}
