//! In-memory browser fakes for driving the verification procedure.
//!
//! A `FakeBrowser` hands out `FakePage`s. A page picks the `SiteScript`
//! registered for the host it navigates to and answers navigations, script
//! evaluations and screenshots from it. Evaluations are matched on the
//! function text so the real storefront inspector and refresh capability run
//! unmodified against the fake.

#![allow(dead_code)]

use async_trait::async_trait;
use cartcheck_common::types::Subject;
use cartcheck_common::Ledger;
use cartcheck_e2e::browser::{host_of, BrowserDriver, NavigationResponse, PageSession};
use cartcheck_e2e::navigation::NavigationPlan;
use cartcheck_e2e::playwright::DEFAULT_EVALUATE_TIMEOUT;
use cartcheck_e2e::procedure::{Procedure, ProcedureSettings};
use cartcheck_e2e::refresh::ScriptedRefresh;
use cartcheck_e2e::runner::Collaborators;
use cartcheck_e2e::storefront::StorefrontInspector;
use cartcheck_e2e::visual::ImageDiffer;
use cartcheck_e2e::{E2eError, E2eResult};
use image::{Rgba, RgbaImage};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const WHITE: [u8; 4] = [255, 255, 255, 255];
pub const BLACK: [u8; 4] = [0, 0, 0, 255];
pub const RED: [u8; 4] = [255, 0, 0, 255];

/// Scripted behavior of one site, plus counters of what the procedure did.
pub struct SiteScript {
    pub host: String,
    pub schema_name: Option<String>,
    pub has_item: bool,
    pub trigger_present: bool,
    pub dialogs: u32,
    pub direct_action_ok: bool,
    pub refresh_ok: bool,
    pub panic_on_goto: bool,

    /// Time each in-page `fetch` script takes to settle, e.g. while the
    /// preload wrapper backs off from 429s
    pub fetch_delay: Duration,

    /// Responses served to successive navigations; 200 once drained
    pub responses: Mutex<VecDeque<NavigationResponse>>,

    /// Colors of successive screenshots; the last one repeats
    pub frames: Vec<[u8; 4]>,

    pub gotos: AtomicUsize,
    pub screenshots: AtomicUsize,
    pub clicks: AtomicUsize,
    pub direct_actions: AtomicUsize,
    pub refreshes: AtomicUsize,
    pub cleared: AtomicUsize,
}

impl SiteScript {
    /// A site on which the whole procedure succeeds and the refreshed page
    /// matches the clicked page.
    pub fn passing(host: &str) -> Self {
        Self {
            host: host.to_string(),
            schema_name: Some("Dawn".to_string()),
            has_item: true,
            trigger_present: true,
            dialogs: 0,
            direct_action_ok: true,
            refresh_ok: true,
            panic_on_goto: false,
            fetch_delay: Duration::ZERO,
            responses: Mutex::new(VecDeque::new()),
            frames: vec![WHITE, BLACK, BLACK],
            gotos: AtomicUsize::new(0),
            screenshots: AtomicUsize::new(0),
            clicks: AtomicUsize::new(0),
            direct_actions: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
            cleared: AtomicUsize::new(0),
        }
    }

    pub fn with_frames(mut self, frames: &[[u8; 4]]) -> Self {
        self.frames = frames.to_vec();
        self
    }

    pub fn with_responses(self, statuses: &[u16]) -> Self {
        {
            let mut queue = self.responses.lock();
            for &status in statuses {
                queue.push_back(NavigationResponse::ok(status));
            }
        }
        self
    }

    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    pub fn url(&self) -> String {
        format!("https://{}/", self.host)
    }

    fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn goto_count(&self) -> usize {
        Self::count(&self.gotos)
    }

    pub fn click_count(&self) -> usize {
        Self::count(&self.clicks)
    }

    pub fn direct_action_count(&self) -> usize {
        Self::count(&self.direct_actions)
    }

    pub fn refresh_count(&self) -> usize {
        Self::count(&self.refreshes)
    }
}

#[derive(Default)]
pub struct FakeBrowser {
    sites: Mutex<HashMap<String, Arc<SiteScript>>>,
    pub fail_contexts: bool,
    pub contexts_opened: AtomicUsize,
    pub contexts_closed: AtomicUsize,
    pub holds: AtomicUsize,
}

impl FakeBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail_contexts: true,
            ..Self::default()
        }
    }

    pub fn add(&self, site: SiteScript) -> Arc<SiteScript> {
        let site = Arc::new(site);
        self.sites.lock().insert(site.host.clone(), Arc::clone(&site));
        site
    }

    fn site(&self, url: &str) -> Option<Arc<SiteScript>> {
        let host = host_of(url)?;
        self.sites.lock().get(&host).cloned()
    }

    pub fn opened(&self) -> usize {
        self.contexts_opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.contexts_closed.load(Ordering::SeqCst)
    }

    pub fn held(&self) -> usize {
        self.holds.load(Ordering::SeqCst)
    }
}

/// Handle that lets pages look sites up after the browser is shared.
#[derive(Clone)]
pub struct SharedBrowser(pub Arc<FakeBrowser>);

#[async_trait]
impl BrowserDriver for SharedBrowser {
    async fn new_page(&self) -> E2eResult<Box<dyn PageSession>> {
        if self.0.fail_contexts {
            return Err(E2eError::ContextUnavailable("no more contexts".into()));
        }
        self.0.contexts_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakePage {
            browser: Arc::clone(&self.0),
            site: None,
        }))
    }

    async fn shutdown(&self) -> E2eResult<()> {
        Ok(())
    }
}

pub struct FakePage {
    browser: Arc<FakeBrowser>,
    site: Option<Arc<SiteScript>>,
}

impl FakePage {
    fn site(&self) -> E2eResult<&Arc<SiteScript>> {
        self.site
            .as_ref()
            .ok_or_else(|| E2eError::Playwright("page has not navigated".into()))
    }
}

#[async_trait]
impl PageSession for FakePage {
    async fn goto(&mut self, url: &str, _timeout: Duration) -> E2eResult<NavigationResponse> {
        let site = self
            .browser
            .site(url)
            .ok_or_else(|| E2eError::TransientNetwork(format!("net::ERR_NAME_NOT_RESOLVED {}", url)))?;
        site.gotos.fetch_add(1, Ordering::SeqCst);
        if site.panic_on_goto {
            panic!("renderer crashed");
        }
        let response = site
            .responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| NavigationResponse::ok(200));
        self.site = Some(site);
        Ok(response)
    }

    async fn evaluate(&mut self, function: &str, arg: Value) -> E2eResult<Value> {
        self.evaluate_within(function, arg, DEFAULT_EVALUATE_TIMEOUT)
            .await
    }

    async fn evaluate_within(
        &mut self,
        function: &str,
        _arg: Value,
        timeout: Duration,
    ) -> E2eResult<Value> {
        let site = Arc::clone(self.site()?);
        let fetches = ["/products.json", "/cart/add.js", "RC.refreshCart"]
            .iter()
            .any(|marker| function.contains(marker));
        if fetches && !site.fetch_delay.is_zero() {
            if site.fetch_delay > timeout {
                tokio::time::sleep(timeout).await;
                return Err(E2eError::Timeout(format!(
                    "evaluate after {}ms",
                    timeout.as_millis()
                )));
            }
            tokio::time::sleep(site.fetch_delay).await;
        }

        let value = if function.contains("Shopify.theme") {
            match &site.schema_name {
                Some(name) => json!({ "schema_name": name, "schema_id": 4242 }),
                None => Value::Null,
            }
        } else if function.contains("/products.json") {
            if site.has_item {
                json!({
                    "handle": "test-product",
                    "identity": 123456789,
                    "detail_url": format!("https://{}/products/test-product", site.host),
                    "source": "/products.json?page=1",
                })
            } else {
                Value::Null
            }
        } else if function.contains("/cart/add.js") {
            site.direct_actions.fetch_add(1, Ordering::SeqCst);
            json!(site.direct_action_ok)
        } else if function.contains("RC.refreshCart") {
            site.refreshes.fetch_add(1, Ordering::SeqCst);
            json!(site.refresh_ok)
        } else if function.contains("__settleReset") {
            json!(true)
        } else if function.contains("__settleScore") {
            json!(0.0125)
        } else {
            Value::Null
        };
        Ok(value)
    }

    async fn add_script(&mut self, _content: &str) -> E2eResult<()> {
        self.site()?;
        Ok(())
    }

    async fn wait_for_selector(&mut self, _selector: &str, _timeout: Duration) -> E2eResult<bool> {
        Ok(self.site()?.trigger_present)
    }

    async fn click(&mut self, _selector: &str) -> E2eResult<()> {
        self.site()?.clicks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn screenshot(&mut self, path: &Path) -> E2eResult<()> {
        let site = self.site()?;
        let n = site.screenshots.fetch_add(1, Ordering::SeqCst);
        let color = site
            .frames
            .get(n)
            .or_else(|| site.frames.last())
            .copied()
            .unwrap_or(WHITE);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        RgbaImage::from_pixel(16, 12, Rgba(color)).save(path)?;
        Ok(())
    }

    async fn dialog_count(&mut self) -> E2eResult<u32> {
        Ok(self.site()?.dialogs)
    }

    async fn clear_site_data(&mut self, _origin: &str) -> E2eResult<()> {
        self.site()?.cleared.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_cache_enabled(&mut self, _enabled: bool) -> E2eResult<()> {
        Ok(())
    }

    async fn wait_closed(&mut self) -> E2eResult<()> {
        self.browser.holds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(self: Box<Self>) -> E2eResult<()> {
        self.browser.contexts_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn subject_for(name: &str, site: &SiteScript) -> Subject {
    Subject::new(name, site.url())
}

pub fn settings(out_dir: &Path) -> ProcedureSettings {
    ProcedureSettings {
        out_dir: out_dir.to_path_buf(),
        navigation: NavigationPlan::default(),
        trigger_wait: Duration::ZERO,
        settle_after_trigger: Duration::ZERO,
        settle_after_manual: Duration::ZERO,
        settle_after_refresh: Duration::ZERO,
        hold: false,
    }
}

pub fn collaborators(browser: &Arc<FakeBrowser>) -> Collaborators {
    Collaborators {
        browser: Arc::new(SharedBrowser(Arc::clone(browser))),
        inspector: Arc::new(StorefrontInspector::default()),
        refresher: Arc::new(ScriptedRefresh::new("window.RC = window.RC || {};")),
    }
}

/// A procedure writing into a fresh ledger under `out_dir`.
pub fn procedure(browser: &Arc<FakeBrowser>, out_dir: &Path) -> (Procedure, Arc<Ledger>) {
    procedure_with(browser, out_dir, settings(out_dir))
}

pub fn procedure_with(
    browser: &Arc<FakeBrowser>,
    out_dir: &Path,
    settings: ProcedureSettings,
) -> (Procedure, Arc<Ledger>) {
    let ledger = Arc::new(Ledger::new(out_dir.join("results.csv")));
    ledger
        .initialize(&cartcheck_common::types::RunMode::Fresh)
        .unwrap();
    let c = collaborators(browser);
    let procedure = Procedure::new(
        c.browser,
        c.inspector,
        c.refresher,
        ImageDiffer::default(),
        Arc::clone(&ledger),
        settings,
    );
    (procedure, ledger)
}
