//! Playwright browser automation
//!
//! A single long-lived `node` process hosts the browser. Rust sends one JSON
//! request per line on its stdin and reads `{id, ok, result | error}` replies
//! from its stdout. Each isolated context lives inside that process and is
//! addressed by a numeric handle.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command as TokioCommand};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::browser::{BrowserDriver, NavigationResponse, PageSession};
use crate::error::{E2eError, E2eResult};

/// Extra time granted on top of an operation's own timeout before the
/// bridge request is abandoned.
const REPLY_GRACE: Duration = Duration::from_secs(5);

/// Time a terminated bridge gets to exit before it is killed.
const TERM_GRACE: Duration = Duration::from_millis(200);

/// Longest a held page is waited on before its slot is released anyway.
const HOLD_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Reply budget for requests without a timeout of their own.
pub const DEFAULT_EVALUATE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Browser {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl Browser {
    fn as_str(&self) -> &'static str {
        match self {
            Browser::Chromium => "chromium",
            Browser::Firefox => "firefox",
            Browser::Webkit => "webkit",
        }
    }
}

/// Configuration for Playwright
#[derive(Debug, Clone)]
pub struct PlaywrightConfig {
    pub browser: Browser,
    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,

    /// Init script installed in every new context
    pub preload: String,

    /// Leave contexts open after a job finishes (interactive debugging)
    pub keep_contexts_open: bool,

    /// Budget for browser launch and context creation
    pub launch_timeout: Duration,

    /// Budget for evaluate/click/screenshot style requests
    pub request_timeout: Duration,

    /// Directory the bridge script is written into. Module resolution for
    /// `require('playwright')` starts here.
    pub script_dir: PathBuf,
}

impl Default for PlaywrightConfig {
    fn default() -> Self {
        Self {
            browser: Browser::Chromium,
            headless: true,
            viewport_width: 1280,
            viewport_height: 720,
            preload: String::new(),
            keep_contexts_open: false,
            launch_timeout: Duration::from_secs(60),
            request_timeout: DEFAULT_EVALUATE_TIMEOUT,
            script_dir: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Serialize)]
struct BridgeSettings<'a> {
    browser: &'a str,
    headless: bool,
    width: u32,
    height: u32,
    preload: &'a str,
    #[serde(rename = "keepOpen")]
    keep_open: bool,
}

#[derive(Debug, Deserialize)]
struct BridgeReply {
    id: u64,
    ok: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

struct BridgeInner {
    stdin: tokio::sync::Mutex<ChildStdin>,
    pending: parking_lot::Mutex<HashMap<u64, oneshot::Sender<BridgeReply>>>,
    next_id: AtomicU64,
    child: parking_lot::Mutex<Option<Child>>,
    request_timeout: Duration,
    launch_timeout: Duration,
    keep_open: bool,
    _script: tempfile::NamedTempFile,
}

impl BridgeInner {
    async fn request(&self, op: &str, mut params: Value, timeout: Duration) -> E2eResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if let Value::Object(map) = &mut params {
            map.insert("id".to_string(), json!(id));
            map.insert("op".to_string(), json!(op));
        }
        let mut line = serde_json::to_string(&params)?;
        line.push('\n');

        let written = {
            let mut stdin = self.stdin.lock().await;
            match stdin.write_all(line.as_bytes()).await {
                Ok(()) => stdin.flush().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = written {
            self.pending.lock().remove(&id);
            debug!("Bridge write failed for {}: {}", op, e);
            return Err(E2eError::BridgeClosed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(E2eError::Timeout(format!("{} after {}ms", op, timeout.as_millis())))
            }
            Ok(Err(_)) => Err(E2eError::BridgeClosed),
            Ok(Ok(reply)) if reply.ok => Ok(reply.result),
            Ok(Ok(reply)) => Err(E2eError::Playwright(
                reply.error.unwrap_or_else(|| format!("{} failed", op)),
            )),
        }
    }

    fn route(&self, line: &str) {
        match serde_json::from_str::<BridgeReply>(line) {
            Ok(reply) => match self.pending.lock().remove(&reply.id) {
                Some(tx) => {
                    let _ = tx.send(reply);
                }
                None => debug!("Dropping late bridge reply {}", reply.id),
            },
            Err(_) => debug!("[playwright] {}", line),
        }
    }
}

/// Handle to the browser-hosting node process.
pub struct PlaywrightBridge {
    inner: Arc<BridgeInner>,
}

impl PlaywrightBridge {
    /// Check if Playwright is installed
    pub fn check_playwright_installed() -> E2eResult<()> {
        let output = Command::new("npx")
            .args(["playwright", "--version"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        match output {
            Ok(status) if status.success() => Ok(()),
            _ => Err(E2eError::PlaywrightNotFound),
        }
    }

    /// Spawn node, launch the browser and wait until it accepts requests.
    pub async fn launch(config: PlaywrightConfig) -> E2eResult<Self> {
        Self::check_playwright_installed()?;

        std::fs::create_dir_all(&config.script_dir)?;
        let mut script = tempfile::Builder::new()
            .prefix(".cartcheck-bridge-")
            .suffix(".js")
            .tempfile_in(&config.script_dir)?;
        {
            use std::io::Write;
            script.write_all(build_script(&config)?.as_bytes())?;
            script.flush()?;
        }

        debug!("Starting Playwright bridge: {}", script.path().display());

        let mut child = TokioCommand::new("node")
            .arg(script.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| E2eError::Playwright(format!("Failed to spawn node: {}", e)))?;

        let stdin = child.stdin.take().ok_or(E2eError::BridgeClosed)?;
        let stdout = child.stdout.take().ok_or(E2eError::BridgeClosed)?;
        let stderr = child.stderr.take().ok_or(E2eError::BridgeClosed)?;

        let inner = Arc::new(BridgeInner {
            stdin: tokio::sync::Mutex::new(stdin),
            pending: parking_lot::Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            child: parking_lot::Mutex::new(Some(child)),
            request_timeout: config.request_timeout,
            launch_timeout: config.launch_timeout,
            keep_open: config.keep_contexts_open,
            _script: script,
        });

        let reader = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match reader.upgrade() {
                    Some(inner) => inner.route(&line),
                    None => break,
                }
            }
            if let Some(inner) = reader.upgrade() {
                inner.pending.lock().clear();
            }
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("[playwright] {}", line);
            }
        });

        let bridge = Self { inner };
        bridge
            .inner
            .request("ping", json!({}), config.launch_timeout)
            .await
            .map_err(|e| E2eError::Playwright(format!("Browser launch failed: {}", e)))?;

        info!(
            "Browser ready ({}, headless={})",
            config.browser.as_str(),
            config.headless
        );
        Ok(bridge)
    }

    fn take_child(&self) -> Option<Child> {
        self.inner.child.lock().take()
    }
}

/// Ask `child` to exit; kill it if it is still running after `grace`.
async fn stop_child(mut child: Child, grace: Duration) {
    if send_sigterm(&child) && tokio::time::timeout(grace, child.wait()).await.is_ok() {
        return;
    }
    if let Err(e) = child.kill().await {
        debug!("Bridge process already gone: {}", e);
    }
}

fn send_sigterm(child: &Child) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            return kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok();
        }
    }
    #[cfg(not(unix))]
    let _ = child;
    false
}

#[async_trait]
impl BrowserDriver for PlaywrightBridge {
    async fn new_page(&self) -> E2eResult<Box<dyn PageSession>> {
        let context = self
            .inner
            .request("newContext", json!({}), self.inner.launch_timeout)
            .await
            .map_err(|e| E2eError::ContextUnavailable(e.to_string()))?;

        let context = context
            .as_u64()
            .ok_or_else(|| E2eError::ContextUnavailable(format!("bad context handle {}", context)))?;

        Ok(Box::new(PlaywrightPage {
            inner: Arc::clone(&self.inner),
            context,
        }))
    }

    async fn shutdown(&self) -> E2eResult<()> {
        info!("Stopping Playwright bridge");
        if let Err(e) = self
            .inner
            .request("shutdown", json!({}), Duration::from_secs(10))
            .await
        {
            warn!("Bridge did not shut down cleanly: {}", e);
        }
        if let Some(child) = self.take_child() {
            stop_child(child, TERM_GRACE).await;
        }
        Ok(())
    }
}

impl Drop for PlaywrightBridge {
    fn drop(&mut self) {
        if let Some(mut child) = self.take_child() {
            if send_sigterm(&child) {
                std::thread::sleep(TERM_GRACE);
            }
            let _ = child.start_kill();
        }
    }
}

/// One page inside one bridge-side context.
pub struct PlaywrightPage {
    inner: Arc<BridgeInner>,
    context: u64,
}

impl PlaywrightPage {
    async fn call(&self, op: &str, mut params: Value, timeout: Duration) -> E2eResult<Value> {
        if let Value::Object(map) = &mut params {
            map.insert("ctx".to_string(), json!(self.context));
        }
        self.inner.request(op, params, timeout).await
    }

    fn default_timeout(&self) -> Duration {
        self.inner.request_timeout
    }
}

#[async_trait]
impl PageSession for PlaywrightPage {
    async fn goto(&mut self, url: &str, timeout: Duration) -> E2eResult<NavigationResponse> {
        let params = json!({ "url": url, "timeoutMs": timeout.as_millis() as u64 });
        let value = match self.call("goto", params, timeout + REPLY_GRACE).await {
            Ok(v) => v,
            Err(E2eError::Playwright(msg)) => return Err(E2eError::TransientNetwork(msg)),
            Err(e) => return Err(e),
        };

        Ok(NavigationResponse {
            status: value
                .get("status")
                .and_then(Value::as_u64)
                .and_then(|s| u16::try_from(s).ok()),
            retry_after: value
                .get("retryAfter")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    async fn evaluate(&mut self, function: &str, arg: Value) -> E2eResult<Value> {
        let timeout = self.default_timeout();
        self.evaluate_within(function, arg, timeout).await
    }

    async fn evaluate_within(
        &mut self,
        function: &str,
        arg: Value,
        timeout: Duration,
    ) -> E2eResult<Value> {
        self.call("evaluate", json!({ "fn": function, "arg": arg }), timeout)
            .await
    }

    async fn add_script(&mut self, content: &str) -> E2eResult<()> {
        let timeout = self.default_timeout();
        self.call("addScript", json!({ "content": content }), timeout)
            .await?;
        Ok(())
    }

    async fn wait_for_selector(&mut self, selector: &str, timeout: Duration) -> E2eResult<bool> {
        let params = json!({ "selector": selector, "timeoutMs": timeout.as_millis() as u64 });
        let found = self
            .call("waitForSelector", params, timeout + REPLY_GRACE)
            .await?;
        Ok(found.as_bool().unwrap_or(false))
    }

    async fn click(&mut self, selector: &str) -> E2eResult<()> {
        let timeout = self.default_timeout();
        self.call("click", json!({ "selector": selector }), timeout)
            .await?;
        Ok(())
    }

    async fn screenshot(&mut self, path: &Path) -> E2eResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let timeout = self.default_timeout();
        self.call(
            "screenshot",
            json!({ "path": path.to_string_lossy() }),
            timeout,
        )
        .await?;
        Ok(())
    }

    async fn dialog_count(&mut self) -> E2eResult<u32> {
        let timeout = self.default_timeout();
        let count = self.call("dialogs", json!({}), timeout).await?;
        Ok(count.as_u64().unwrap_or(0) as u32)
    }

    async fn clear_site_data(&mut self, origin: &str) -> E2eResult<()> {
        let timeout = self.default_timeout();
        self.call("clearSiteData", json!({ "origin": origin }), timeout)
            .await?;
        Ok(())
    }

    async fn set_cache_enabled(&mut self, enabled: bool) -> E2eResult<()> {
        let timeout = self.default_timeout();
        self.call("setCache", json!({ "enabled": enabled }), timeout)
            .await?;
        Ok(())
    }

    async fn wait_closed(&mut self) -> E2eResult<()> {
        self.call("waitForClose", json!({}), HOLD_TIMEOUT).await?;
        Ok(())
    }

    async fn close(self: Box<Self>) -> E2eResult<()> {
        if self.inner.keep_open {
            debug!("Leaving context {} open", self.context);
            return Ok(());
        }
        let timeout = self.default_timeout();
        self.call("closeContext", json!({}), timeout).await?;
        Ok(())
    }
}

/// Build the bridge program for `config`.
pub fn build_script(config: &PlaywrightConfig) -> E2eResult<String> {
    let settings = BridgeSettings {
        browser: config.browser.as_str(),
        headless: config.headless,
        width: config.viewport_width,
        height: config.viewport_height,
        preload: &config.preload,
        keep_open: config.keep_contexts_open,
    };
    Ok(format!(
        "const SETTINGS = {};\n{}",
        serde_json::to_string(&settings)?,
        BRIDGE_JS
    ))
}

const BRIDGE_JS: &str = r#"
const playwright = require('playwright');
const readline = require('readline');

const contexts = new Map();
let nextContext = 1;

const launchArgs = SETTINGS.browser === 'chromium' ? ['--disable-dev-shm-usage'] : [];
const launched = playwright[SETTINGS.browser].launch({ headless: SETTINGS.headless, args: launchArgs });
launched.catch((e) => console.error(`launch failed: ${e && e.message}`));

function reply(msg) {
  process.stdout.write(JSON.stringify(msg) + '\n');
}

async function cdpFor(entry) {
  if (SETTINGS.browser !== 'chromium') return null;
  if (!entry.cdp) entry.cdp = await entry.context.newCDPSession(entry.page);
  return entry.cdp;
}

async function handle(req) {
  const browser = await launched;
  let entry = null;
  if (req.ctx !== undefined) {
    entry = contexts.get(req.ctx);
    if (!entry) throw new Error(`unknown context ${req.ctx}`);
  }

  switch (req.op) {
    case 'ping':
      return true;

    case 'newContext': {
      const context = await browser.newContext({
        viewport: { width: SETTINGS.width, height: SETTINGS.height },
        bypassCSP: true,
      });
      if (SETTINGS.preload) await context.addInitScript({ content: SETTINGS.preload });
      const page = await context.newPage();
      const id = nextContext++;
      const state = { context, page, dialogs: 0, cdp: null };
      page.on('dialog', async (dialog) => {
        state.dialogs++;
        try { await dialog.dismiss(); } catch (_) {}
      });
      page.on('console', (msg) => console.error(`[ctx ${id}] ${msg.type()}: ${msg.text()}`));
      page.on('pageerror', (err) => console.error(`[ctx ${id}] pageerror: ${err.message}`));
      contexts.set(id, state);
      return id;
    }

    case 'goto': {
      const resp = await entry.page.goto(req.url, { waitUntil: 'domcontentloaded', timeout: req.timeoutMs });
      if (!resp) return { status: null, retryAfter: null };
      const headers = resp.headers();
      return { status: resp.status(), retryAfter: headers['retry-after'] ?? null };
    }

    case 'evaluate': {
      const fn = new Function(`return (${req.fn});`)();
      const value = await entry.page.evaluate(fn, req.arg);
      return value === undefined ? null : value;
    }

    case 'addScript':
      await entry.page.addScriptTag({ content: req.content });
      return true;

    case 'waitForSelector':
      try {
        await entry.page.waitForSelector(req.selector, { state: 'attached', timeout: req.timeoutMs });
        return true;
      } catch (e) {
        if (e && e.name === 'TimeoutError') return false;
        throw e;
      }

    case 'click':
      await entry.page.click(req.selector, { delay: 30 });
      return true;

    case 'screenshot':
      await entry.page.screenshot({ path: req.path, fullPage: false });
      return true;

    case 'dialogs':
      return entry.dialogs;

    case 'clearSiteData': {
      await entry.context.clearCookies();
      const cdp = await cdpFor(entry);
      if (cdp) {
        try { await cdp.send('Network.clearBrowserCache'); } catch (_) {}
        try { await cdp.send('Storage.clearDataForOrigin', { origin: req.origin, storageTypes: 'all' }); } catch (_) {}
      }
      return true;
    }

    case 'setCache': {
      const cdp = await cdpFor(entry);
      if (cdp) {
        await cdp.send('Network.enable');
        await cdp.send('Network.setCacheDisabled', { cacheDisabled: !req.enabled });
      }
      return true;
    }

    case 'waitForClose':
      if (!entry.page.isClosed()) await entry.page.waitForEvent('close', { timeout: 0 });
      return true;

    case 'closeContext':
      contexts.delete(req.ctx);
      if (!SETTINGS.keepOpen) await entry.context.close();
      return true;

    case 'shutdown':
      if (!SETTINGS.keepOpen) await browser.close();
      return true;

    default:
      throw new Error(`unknown op ${req.op}`);
  }
}

const rl = readline.createInterface({ input: process.stdin });
rl.on('line', (line) => {
  let req;
  try { req = JSON.parse(line); } catch (_) { return; }
  handle(req).then(
    (result) => {
      reply({ id: req.id, ok: true, result });
      if (req.op === 'shutdown') process.exit(0);
    },
    (e) => reply({ id: req.id, ok: false, error: String((e && e.message) || e) }),
  );
});
rl.on('close', async () => {
  try { await (await launched).close(); } catch (_) {}
  process.exit(0);
});
"#;
