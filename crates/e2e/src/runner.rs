//! Batch runner: subjects in, compacted ledger and run summary out

use cartcheck_common::config::RunConfig;
use cartcheck_common::ledger::{CompactionStats, Ledger, Tally};
use cartcheck_common::types::{RunMode, Subject};
use cartcheck_common::{subjects, worklist, BackoffPolicy};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::browser::BrowserDriver;
use crate::error::E2eResult;
use crate::playwright::{PlaywrightBridge, PlaywrightConfig};
use crate::preload::{fetch_timeout, preload_script};
use crate::procedure::{Procedure, ProcedureSettings};
use crate::refresh::{RefreshCapability, ScriptedRefresh};
use crate::scheduler::{self, Progress};
use crate::storefront::{PageInspector, StorefrontInspector};
use crate::visual::ImageDiffer;

/// Outcome of one batch run, written to `summary.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub mode: String,
    pub name_filter: Option<String>,
    pub scheduled: usize,
    pub concurrency: usize,
    pub ledger: PathBuf,
    pub compaction: CompactionStats,
    pub tally: Tally,
}

/// The external collaborators a run drives.
#[derive(Clone)]
pub struct Collaborators {
    pub browser: Arc<dyn BrowserDriver>,
    pub inspector: Arc<dyn PageInspector>,
    pub refresher: Arc<dyn RefreshCapability>,
}

/// Main batch runner
pub struct BatchRunner {
    config: RunConfig,
    mode: RunMode,
    name_filter: Option<String>,
    debug: bool,
    hold: bool,
}

impl BatchRunner {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            mode: RunMode::Fresh,
            name_filter: None,
            debug: false,
            hold: false,
        }
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    /// Only run subjects whose name contains `filter` (case-insensitive).
    pub fn with_name_filter(mut self, filter: Option<String>) -> Self {
        self.name_filter = filter.filter(|f| !f.trim().is_empty());
        self
    }

    /// Headed browser, contexts kept open after each job.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// In debug mode, keep each finished page open and its worker busy until
    /// the page is closed by hand.
    pub fn with_hold(mut self, hold: bool) -> Self {
        self.hold = hold;
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    fn playwright_config(&self) -> PlaywrightConfig {
        PlaywrightConfig {
            headless: self.config.headless && !self.debug,
            viewport_width: self.config.viewport.width,
            viewport_height: self.config.viewport.height,
            preload: preload_script(&BackoffPolicy::RATE_LIMIT),
            keep_contexts_open: self.debug,
            request_timeout: self.config.timeouts.evaluate(),
            script_dir: self.config.out_dir.clone(),
            ..PlaywrightConfig::default()
        }
    }

    fn procedure_settings(&self) -> ProcedureSettings {
        ProcedureSettings {
            hold: self.debug && self.hold,
            ..ProcedureSettings::from_config(&self.config)
        }
    }

    /// Reply budget for evaluations whose `fetch` calls go through the
    /// rate-limit wrapper installed by the preload.
    fn fetch_budget(&self) -> Duration {
        fetch_timeout(self.config.timeouts.evaluate(), &BackoffPolicy::RATE_LIMIT)
    }

    /// Load subjects, launch the browser and run every selected subject.
    ///
    /// Errors returned here are startup failures; per-subject failures end
    /// up in the ledger.
    pub async fn run(&self) -> E2eResult<RunSummary> {
        let subjects = subjects::load_csv(&self.config.input_csv)?;
        info!(
            "Loaded {} subject(s) from {}",
            subjects.len(),
            self.config.input_csv.display()
        );

        let budget = self.fetch_budget();
        let refresher =
            ScriptedRefresh::load(&self.config.refresh_script)?.with_fetch_timeout(budget);
        info!("Refresh bundle: {}", refresher.source().display());

        info!(
            "Launching browser ({})",
            if self.debug { "headed debug" } else { "headless" }
        );
        let bridge = Arc::new(PlaywrightBridge::launch(self.playwright_config()).await?);

        let collaborators = Collaborators {
            browser: bridge.clone(),
            inspector: Arc::new(StorefrontInspector::default().with_fetch_timeout(budget)),
            refresher: Arc::new(refresher),
        };
        let result = self.run_with(subjects, collaborators).await;

        if self.debug {
            info!("Debug mode: browser left open, press Ctrl+C to exit");
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Cannot wait for Ctrl+C: {}", e);
            }
        }
        bridge.shutdown().await?;

        result
    }

    /// Run the given subjects against already-constructed collaborators.
    pub async fn run_with(
        &self,
        subjects: Vec<Subject>,
        collaborators: Collaborators,
    ) -> E2eResult<RunSummary> {
        let started_at = Utc::now();
        let start = Instant::now();

        let ledger = Arc::new(Ledger::new(self.config.ledger_path()));
        ledger.initialize(&self.mode)?;

        let work = worklist::build(subjects, &self.mode, &ledger, self.name_filter.as_deref())?;
        let concurrency = self.config.concurrency.max(1);
        let scheduled = work.len();
        info!(
            "Mode {}: {} subject(s) to run, concurrency {}",
            self.mode, scheduled, concurrency
        );

        let procedure = Arc::new(Procedure::new(
            collaborators.browser,
            collaborators.inspector,
            collaborators.refresher,
            ImageDiffer::with_threshold(self.config.diff_threshold),
            Arc::clone(&ledger),
            self.procedure_settings(),
        ));
        let progress = Arc::new(Progress::new(scheduled, concurrency));

        scheduler::run(work, concurrency, progress, move |subject: Subject, idx| {
            let procedure = Arc::clone(&procedure);
            async move {
                procedure.run(&subject, idx).await;
            }
        })
        .await;

        let compaction = ledger.compact()?;
        let tally = ledger.tally()?;

        let summary = RunSummary {
            started_at,
            finished_at: Utc::now(),
            duration_ms: start.elapsed().as_millis() as u64,
            mode: self.mode.to_string(),
            name_filter: self.name_filter.clone(),
            scheduled,
            concurrency,
            ledger: ledger.path().to_path_buf(),
            compaction,
            tally,
        };

        info!(
            "Run finished: {} passed, {} no-pass, {} without verdict ({} ms)",
            tally.passed, tally.no_pass, tally.unjudged, summary.duration_ms
        );
        self.write_summary(&summary)?;
        Ok(summary)
    }

    /// Write the run summary as JSON next to the ledger.
    pub fn write_summary(&self, summary: &RunSummary) -> E2eResult<PathBuf> {
        std::fs::create_dir_all(&self.config.out_dir)?;

        let path = self.config.summary_path();
        let json = serde_json::to_string_pretty(summary)?;
        std::fs::write(&path, json)?;

        info!("Summary written to: {}", path.display());
        Ok(path)
    }
}
