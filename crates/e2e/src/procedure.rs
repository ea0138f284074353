//! Per-subject verification procedure.
//!
//! Each step either names the next step or ends the job with a
//! [`TerminalReason`]. A single dispatcher in [`Procedure::run`] folds the
//! outcome into the job's row and appends it to the ledger, whether the job
//! finished, exited early, or panicked.

use cartcheck_common::config::RunConfig;
use cartcheck_common::types::{round_pct, JobResult, Subject, Verdict};
use cartcheck_common::Ledger;
use futures::FutureExt;
use regex::Regex;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::browser::{host_of, origin_of, BrowserDriver, PageSession};
use crate::error::{E2eError, ErrorKind};
use crate::navigation::{goto_with_retry, NavigationPlan};
use crate::preload::{READ_SETTLE_SCORE, RESET_SETTLE_SCORE};
use crate::refresh::{RefreshCapability, RefreshVariant};
use crate::storefront::{PageInspector, TestableItem, Trigger};
use crate::visual::ImageDiffer;

pub const PRE_TRIGGER_PNG: &str = "pre_click.png";
pub const POST_TRIGGER_PNG: &str = "post_click.png";
pub const POST_REFRESH_PNG: &str = "post_refresh.png";
pub const BASE_DIFF_PNG: &str = "base_diff.png";
pub const REFRESH_DIFF_PNG: &str = "refresh_diff.png";

const MAX_TAG_LEN: usize = 80;

/// Steps of the procedure, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Navigate,
    ResolveTestableItem,
    BaselineCapture,
    LocateTrigger,
    TriggerAndCapture,
    BaseDiff,
    ResetEnvironment,
    ManualTrigger,
    DelegatedRefresh,
    PostRefreshCapture,
    RefreshDiff,
    Write,
}

/// Why a job stopped before reaching `Step::Write` on its own.
#[derive(Debug)]
pub enum TerminalReason {
    NoEntryUrl,
    DialogInterrupted,
    NoTestableItem,
    NoTrigger,
    NoBaselineChange,
    ContextUnavailable(String),
    Failed(E2eError),
}

impl From<E2eError> for TerminalReason {
    fn from(e: E2eError) -> Self {
        TerminalReason::Failed(e)
    }
}

impl TerminalReason {
    pub fn code(&self) -> String {
        match self {
            TerminalReason::NoEntryUrl => "no_demo_url".to_string(),
            TerminalReason::DialogInterrupted => "alert_dialog".to_string(),
            TerminalReason::NoTestableItem => "no_variant_available".to_string(),
            TerminalReason::NoTrigger => "no_add_button".to_string(),
            TerminalReason::NoBaselineChange => "base_no_change".to_string(),
            TerminalReason::ContextUnavailable(msg) => format!("context_unavailable:{}", msg),
            TerminalReason::Failed(e) => e.to_string(),
        }
    }

    /// Verdict carried by this exit. Blocked interactions are a definite
    /// NO-PASS; crashes leave the verdict empty.
    pub fn verdict(&self) -> Option<Verdict> {
        match self {
            TerminalReason::DialogInterrupted
            | TerminalReason::NoTestableItem
            | TerminalReason::NoTrigger
            | TerminalReason::NoBaselineChange => Some(Verdict::NoPass),
            TerminalReason::Failed(e) if e.kind() == ErrorKind::InteractionBlocked => {
                Some(Verdict::NoPass)
            }
            _ => None,
        }
    }

    fn apply(&self, row: &mut JobResult) {
        match self {
            TerminalReason::DialogInterrupted => row.dialog_interrupted = true,
            TerminalReason::NoBaselineChange => row.skipped_no_baseline_change = true,
            _ => {}
        }
        if let Some(verdict) = self.verdict() {
            row.verdict = Some(verdict);
        }
        row.push_reason(self.code());
    }
}

type StepResult = Result<Step, TerminalReason>;

/// Timing and location knobs for the procedure.
#[derive(Debug, Clone)]
pub struct ProcedureSettings {
    pub out_dir: PathBuf,
    pub navigation: NavigationPlan,
    pub trigger_wait: Duration,
    pub settle_after_trigger: Duration,
    pub settle_after_manual: Duration,
    pub settle_after_refresh: Duration,
    /// Keep each finished page open, and its worker busy, until it is closed
    /// by hand.
    pub hold: bool,
}

impl ProcedureSettings {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            out_dir: config.out_dir.clone(),
            navigation: NavigationPlan {
                max_attempts: config.navigation_attempts,
                timeout: config.timeouts.navigation(),
                ..NavigationPlan::default()
            },
            trigger_wait: config.timeouts.trigger_wait(),
            settle_after_trigger: config.settle.after_trigger(),
            settle_after_manual: config.settle.after_manual(),
            settle_after_refresh: config.settle.after_refresh(),
            hold: false,
        }
    }
}

/// Everything a job accumulates on its way through the steps.
struct JobState {
    idx: usize,
    tag: String,
    dir: PathBuf,
    row: JobResult,
    item: Option<TestableItem>,
    trigger: Option<Trigger>,
    variant: RefreshVariant,
}

impl JobState {
    fn artifact(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    /// Ledger form of an artifact path: relative to the output directory.
    fn relative(&self, file: &str) -> String {
        Path::new(&self.tag).join(file).to_string_lossy().into_owned()
    }

    fn item(&self) -> Result<&TestableItem, TerminalReason> {
        self.item.as_ref().ok_or(TerminalReason::NoTestableItem)
    }
}

pub struct Procedure {
    browser: Arc<dyn BrowserDriver>,
    inspector: Arc<dyn PageInspector>,
    refresher: Arc<dyn RefreshCapability>,
    differ: ImageDiffer,
    ledger: Arc<Ledger>,
    settings: ProcedureSettings,
}

impl Procedure {
    pub fn new(
        browser: Arc<dyn BrowserDriver>,
        inspector: Arc<dyn PageInspector>,
        refresher: Arc<dyn RefreshCapability>,
        differ: ImageDiffer,
        ledger: Arc<Ledger>,
        settings: ProcedureSettings,
    ) -> Self {
        Self {
            browser,
            inspector,
            refresher,
            differ,
            ledger,
            settings,
        }
    }

    /// Verify one subject and append exactly one row for it.
    pub async fn run(&self, subject: &Subject, idx: usize) -> JobResult {
        let tag = sanitize_name(&subject.name, &subject.entry_url, idx);
        let mut state = JobState {
            idx,
            dir: self.settings.out_dir.join(&tag),
            tag,
            row: JobResult::for_subject(subject),
            item: None,
            trigger: None,
            variant: RefreshVariant::Unknown,
        };
        let mut page: Option<Box<dyn PageSession>> = None;

        let outcome = AssertUnwindSafe(self.drive(&mut page, &mut state))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => {
                match &reason {
                    TerminalReason::Failed(e) => warn!("[JOB {}] {}: {}", idx, state.tag, e),
                    other => info!("[JOB {}] {}: early exit ({})", idx, state.tag, other.code()),
                }
                reason.apply(&mut state.row);
            }
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                error!("[JOB {}] {} panicked: {}", idx, state.tag, msg);
                state.row.push_reason(format!("panic:{}", msg));
            }
        }

        if let Err(e) = self.ledger.append(&state.row) {
            error!("[JOB {}] cannot record result for {}: {}", idx, state.tag, e);
        }

        if let Some(mut page) = page.take() {
            if self.settings.hold {
                info!("[JOB {}] {}: holding slot until the page is closed", idx, state.tag);
                if let Err(e) = page.wait_closed().await {
                    debug!("[JOB {}] hold ended: {}", idx, e);
                }
            }
            if let Err(e) = page.close().await {
                debug!("[JOB {}] close failed: {}", idx, e);
            }
        }

        info!(
            "[JOB {}] {} done: verdict={} reasons={}",
            idx,
            state.tag,
            state.row.verdict.map(|v| v.as_str()).unwrap_or("-"),
            if state.row.reason_codes.is_empty() {
                "-"
            } else {
                state.row.reason_codes.as_str()
            }
        );
        state.row
    }

    async fn drive(
        &self,
        slot: &mut Option<Box<dyn PageSession>>,
        state: &mut JobState,
    ) -> Result<(), TerminalReason> {
        if state.row.entry_url.trim().is_empty() {
            return Err(TerminalReason::NoEntryUrl);
        }

        let page = self
            .browser
            .new_page()
            .await
            .map_err(|e| TerminalReason::ContextUnavailable(e.to_string()))?;
        let page = slot.insert(page).as_mut();

        std::fs::create_dir_all(&state.dir).map_err(E2eError::from)?;
        info!("[JOB {}] {} -> {}", state.idx, state.tag, state.row.entry_url);

        let mut step = Step::Navigate;
        while step != Step::Write {
            debug!("[JOB {}] {:?}", state.idx, step);
            step = self.step(step, page, state).await?;
        }
        Ok(())
    }

    async fn step(&self, step: Step, page: &mut dyn PageSession, st: &mut JobState) -> StepResult {
        match step {
            Step::Navigate => self.navigate(page, st).await,
            Step::ResolveTestableItem => self.resolve_item(page, st).await,
            Step::BaselineCapture => self.baseline_capture(page, st).await,
            Step::LocateTrigger => self.locate_trigger(page, st).await,
            Step::TriggerAndCapture => self.trigger_and_capture(page, st).await,
            Step::BaseDiff => self.base_diff(st),
            Step::ResetEnvironment => self.reset_environment(page, st).await,
            Step::ManualTrigger => self.manual_trigger(page, st).await,
            Step::DelegatedRefresh => self.delegated_refresh(page, st).await,
            Step::PostRefreshCapture => self.post_refresh_capture(page, st).await,
            Step::RefreshDiff => self.refresh_diff(st),
            Step::Write => Ok(Step::Write),
        }
    }

    async fn navigate(&self, page: &mut dyn PageSession, st: &mut JobState) -> StepResult {
        let url = st.row.entry_url.clone();
        let label = format!("landing {}", st.tag);
        goto_with_retry(page, &url, &label, &self.settings.navigation).await?;
        st.row.navigated = true;

        match self.inspector.detect_variant(page).await {
            Ok(Some(variant)) => {
                st.variant = RefreshVariant::from_schema(&variant.schema_name);
                debug!(
                    "[JOB {}] schema {} -> handler {}",
                    st.idx, variant.schema_name, st.variant
                );
                st.row.schema_name = variant.schema_name;
                st.row.schema_id = variant.schema_id;
            }
            Ok(None) => {}
            Err(e) => debug!("[JOB {}] variant detection failed: {}", st.idx, e),
        }

        if page.dialog_count().await? > 0 {
            return Err(TerminalReason::DialogInterrupted);
        }
        Ok(Step::ResolveTestableItem)
    }

    async fn resolve_item(&self, page: &mut dyn PageSession, st: &mut JobState) -> StepResult {
        let item = self
            .inspector
            .resolve_testable_item(page)
            .await?
            .ok_or(TerminalReason::NoTestableItem)?;

        info!(
            "[JOB {}] Item: {} (identity={}, via {})",
            st.idx, item.detail_url, item.identity, item.source
        );
        st.row.resolved_item = true;
        st.item = Some(item);
        Ok(Step::BaselineCapture)
    }

    async fn baseline_capture(&self, page: &mut dyn PageSession, st: &mut JobState) -> StepResult {
        let url = st.item()?.detail_url.clone();
        let label = format!("detail {}", st.tag);
        goto_with_retry(page, &url, &label, &self.settings.navigation).await?;

        st.row.pre_trigger_png = Some(self.capture(page, st, PRE_TRIGGER_PNG).await?);
        Ok(Step::LocateTrigger)
    }

    async fn locate_trigger(&self, page: &mut dyn PageSession, st: &mut JobState) -> StepResult {
        let trigger = self
            .inspector
            .locate_trigger(page, self.settings.trigger_wait)
            .await?
            .ok_or(TerminalReason::NoTrigger)?;

        st.row.found_trigger = true;
        st.trigger = Some(trigger);
        Ok(Step::TriggerAndCapture)
    }

    async fn trigger_and_capture(
        &self,
        page: &mut dyn PageSession,
        st: &mut JobState,
    ) -> StepResult {
        let selector = match &st.trigger {
            Some(t) => t.selector.clone(),
            None => return Err(TerminalReason::NoTrigger),
        };

        reset_settle_score(page).await;
        page.click(&selector).await?;
        st.row.clicked_trigger = true;
        tokio::time::sleep(self.settings.settle_after_trigger).await;

        st.row.post_trigger_png = Some(self.capture(page, st, POST_TRIGGER_PNG).await?);
        st.row.settle_after_trigger = read_settle_score(page).await;
        Ok(Step::BaseDiff)
    }

    fn base_diff(&self, st: &mut JobState) -> StepResult {
        let outcome = self.differ.diff_files(
            &st.artifact(PRE_TRIGGER_PNG),
            &st.artifact(POST_TRIGGER_PNG),
            &st.artifact(BASE_DIFF_PNG),
        );

        match outcome {
            Ok(diff) => {
                st.row.base_diff_png = Some(st.relative(BASE_DIFF_PNG));
                st.row.base_change_pct = Some(round_pct(diff.percentage));
                if diff.is_identical() {
                    return Err(TerminalReason::NoBaselineChange);
                }
            }
            Err(e) => {
                warn!("[JOB {}] base diff failed: {}", st.idx, e);
                st.row.push_reason(format!("base_diff_failed:{}", e));
            }
        }
        Ok(Step::ResetEnvironment)
    }

    async fn reset_environment(&self, page: &mut dyn PageSession, st: &mut JobState) -> StepResult {
        let url = st.item()?.detail_url.clone();

        if let Err(e) = page.set_cache_enabled(false).await {
            debug!("[JOB {}] cannot disable cache: {}", st.idx, e);
        }
        if let Some(origin) = origin_of(&url) {
            page.clear_site_data(&origin).await?;
        }

        let label = format!("detail reload {}", st.tag);
        goto_with_retry(page, &url, &label, &self.settings.navigation).await?;
        Ok(Step::ManualTrigger)
    }

    async fn manual_trigger(&self, page: &mut dyn PageSession, st: &mut JobState) -> StepResult {
        let item = st.item()?.clone();

        reset_settle_score(page).await;
        let ok = match self.inspector.invoke_direct_action(page, &item).await {
            Ok(ok) => ok,
            Err(e) => {
                warn!("[JOB {}] direct action failed: {}", st.idx, e);
                false
            }
        };
        st.row.manual_trigger_ok = ok;
        tokio::time::sleep(self.settings.settle_after_manual).await;
        Ok(Step::DelegatedRefresh)
    }

    async fn delegated_refresh(&self, page: &mut dyn PageSession, st: &mut JobState) -> StepResult {
        let item = st.item()?.clone();

        match self.refresher.attempt_refresh(page, &item, st.variant).await {
            Ok(ok) => st.row.refresh_ok = ok,
            Err(e) => {
                warn!("[JOB {}] refresh delegate failed: {}", st.idx, e);
                st.row.push_reason(format!("refresh_failed:{}", e));
            }
        }
        Ok(Step::PostRefreshCapture)
    }

    async fn post_refresh_capture(
        &self,
        page: &mut dyn PageSession,
        st: &mut JobState,
    ) -> StepResult {
        tokio::time::sleep(self.settings.settle_after_refresh).await;

        st.row.post_refresh_png = Some(self.capture(page, st, POST_REFRESH_PNG).await?);
        st.row.settle_after_manual = read_settle_score(page).await;
        Ok(Step::RefreshDiff)
    }

    fn refresh_diff(&self, st: &mut JobState) -> StepResult {
        let outcome = self.differ.diff_files(
            &st.artifact(POST_TRIGGER_PNG),
            &st.artifact(POST_REFRESH_PNG),
            &st.artifact(REFRESH_DIFF_PNG),
        );

        match outcome {
            Ok(diff) => {
                st.row.refresh_diff_png = Some(st.relative(REFRESH_DIFF_PNG));
                st.row.refresh_change_pct = Some(round_pct(diff.percentage));
                if diff.is_identical() {
                    st.row.verdict = Some(Verdict::Pass);
                } else {
                    st.row.verdict = Some(Verdict::NoPass);
                    st.row.push_reason("refresh_nonzero_change");
                }
            }
            Err(e) => {
                warn!("[JOB {}] refresh diff failed: {}", st.idx, e);
                st.row.push_reason(format!("refresh_diff_failed:{}", e));
            }
        }
        Ok(Step::Write)
    }

    async fn capture(
        &self,
        page: &mut dyn PageSession,
        st: &JobState,
        file: &str,
    ) -> Result<String, TerminalReason> {
        page.screenshot(&st.artifact(file)).await?;
        Ok(st.relative(file))
    }
}

async fn reset_settle_score(page: &mut dyn PageSession) {
    if let Err(e) = page.evaluate(RESET_SETTLE_SCORE, Value::Null).await {
        debug!("settle reset failed: {}", e);
    }
}

async fn read_settle_score(page: &mut dyn PageSession) -> Option<f64> {
    match page.evaluate(READ_SETTLE_SCORE, Value::Null).await {
        Ok(v) => v.as_f64(),
        Err(e) => {
            debug!("settle read failed: {}", e);
            None
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn unsafe_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-z0-9_-]+").expect("tag character class compiles"))
}

/// Directory-safe tag for a subject. Falls back to the entry URL host, then
/// to `job-<idx>`.
pub fn sanitize_name(name: &str, entry_url: &str, idx: usize) -> String {
    let source = if !name.trim().is_empty() {
        name.to_string()
    } else if let Some(host) = host_of(entry_url) {
        host
    } else {
        format!("job-{}", idx)
    };

    let replaced = unsafe_chars().replace_all(&source.to_lowercase(), "-").into_owned();
    replaced.chars().take(MAX_TAG_LEN).collect()
}
