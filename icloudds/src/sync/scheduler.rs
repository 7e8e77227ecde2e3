use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use icloud_core::DriveApi;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::{next_refresh_multiplier, Backoff};
use super::executor::{Executor, PlanOrigin};
use super::filter::PathFilter;
use super::local_scan;
use super::reconcile;
use super::remote_scan::RemoteScanner;
use super::replica::{Replica, SharedReplica};
use super::statedump::{
    StateDumper, LOCAL_AFTER, LOCAL_BEFORE, REMOTE_AFTER, REMOTE_BEFORE, REMOTE_CANDIDATE,
};
use super::suppress::SuppressionSet;
use super::watcher::LocalWatcher;
use super::SyncError;

const DRAIN_TICK: Duration = Duration::from_secs(1);
const STARTUP_RETRY_DELAY: Duration = Duration::from_secs(60);
// Swallows the trailing modify events of our own writes.
const QUIESCE_MARGIN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub root: PathBuf,
    pub check_period: Duration,
    pub refresh_period: Duration,
    pub debounce_period: Duration,
    pub max_workers: usize,
    pub state_dir: PathBuf,
}

/// Owns the live replicas and the three periodic triggers: the watcher
/// drain tick, the cheap remote change check, and the full refresh.
pub struct SyncScheduler {
    config: SchedulerConfig,
    filter: Arc<PathFilter>,
    local: SharedReplica,
    remote: SharedReplica,
    executor: Executor,
    scanner: RemoteScanner,
    suppress: SuppressionSet,
    dumper: StateDumper,
    cancel: CancellationToken,
    /// Held while a plan is being applied or a refresh is being swapped
    /// in; never both at once.
    sync_gate: Mutex<()>,
    local_events_pending: AtomicBool,
}

impl SyncScheduler {
    pub fn new(
        config: SchedulerConfig,
        drive: Arc<dyn DriveApi>,
        filter: Arc<PathFilter>,
        cancel: CancellationToken,
    ) -> std::io::Result<Self> {
        let local = SharedReplica::default();
        let remote = SharedReplica::default();
        let suppress = SuppressionSet::new(config.debounce_period + QUIESCE_MARGIN);
        let executor = Executor::new(
            Arc::clone(&drive),
            local.clone(),
            remote.clone(),
            config.root.clone(),
            suppress.clone(),
            config.max_workers,
            Backoff::new(Duration::from_millis(500), Duration::from_secs(30), true),
            cancel.clone(),
        );
        let scanner = RemoteScanner::new(drive, Arc::clone(&filter), config.max_workers);
        let dumper = StateDumper::new(config.state_dir.clone())?;
        Ok(Self {
            config,
            filter,
            local,
            remote,
            executor,
            scanner,
            suppress,
            dumper,
            cancel,
            sync_gate: Mutex::new(()),
            local_events_pending: AtomicBool::new(false),
        })
    }

    /// First full pass: scan both sides, then converge them with one
    /// two-sided plan.
    pub async fn initial_sync(&self) -> Result<(), SyncError> {
        info!("performing initial refresh of the local tree");
        let local = local_scan::scan(&self.config.root, &self.filter)?;
        self.local.replace(local);

        info!("performing initial refresh of iCloud Drive");
        let candidate = self.scanner.refresh().await?;

        let _gate = self.sync_gate.lock().await;
        self.dump(LOCAL_BEFORE, &self.local.snapshot());
        self.dump(REMOTE_BEFORE, &candidate);
        self.remote.replace(candidate);

        let plan = reconcile::cross_side_plan(&self.local.snapshot(), &self.remote.snapshot());
        info!(actions = plan.len(), "initial sync plan computed");
        self.executor.apply(plan, PlanOrigin::Initial).await;

        self.dump(LOCAL_AFTER, &self.local.snapshot());
        self.dump(REMOTE_AFTER, &self.remote.snapshot());
        info!("initial sync complete");
        Ok(())
    }

    /// One full refresh cycle. Returns false when the candidate was
    /// consistent but had to be discarded because local events were
    /// still in flight.
    pub async fn refresh_once(&self) -> Result<bool, SyncError> {
        let candidate = self.scanner.refresh().await?;

        let _gate = self.sync_gate.lock().await;
        if self.local_events_pending.load(Ordering::SeqCst) {
            info!("refresh discarded, local events still pending");
            return Ok(false);
        }

        self.dump(LOCAL_BEFORE, &self.local.snapshot());
        self.dump(REMOTE_BEFORE, &self.remote.snapshot());
        self.dump(REMOTE_CANDIDATE, &candidate);

        let live = self.remote.snapshot();
        let plan = reconcile::refresh_plan(&live, &candidate, &self.local.snapshot());
        // Swap first: the candidate is the remote truth, and the plan's
        // local-side actions resolve their handles against it.
        self.remote.replace(candidate);
        if plan.is_empty() {
            debug!("refresh applied, no changes");
        } else {
            info!(actions = plan.len(), "applying refresh plan");
            self.executor.apply(plan, PlanOrigin::RemoteRefresh).await;
        }

        self.dump(LOCAL_AFTER, &self.local.snapshot());
        self.dump(REMOTE_AFTER, &self.remote.snapshot());
        Ok(true)
    }

    /// Watcher drain tick: collect released records and apply a minimal
    /// plan for them.
    pub async fn drain_events(&self, watcher: &mut LocalWatcher) {
        let records = watcher.drain();
        self.local_events_pending
            .store(watcher.has_pending(), Ordering::SeqCst);
        if records.is_empty() {
            return;
        }

        let _gate = self.sync_gate.lock().await;
        let remote = self.remote.snapshot();
        let plan = reconcile::plan_for_records(&records, &remote, &self.config.root);
        if plan.is_empty() {
            return;
        }
        info!(
            records = records.len(),
            actions = plan.len(),
            "applying plan for local changes"
        );
        self.executor.apply(plan, PlanOrigin::LocalEvents).await;
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let this = Arc::new(self);

        // Initial sync, retried until it goes through. Auth failures are
        // fatal here; everything else is assumed transient.
        loop {
            match this.initial_sync().await {
                Ok(()) => break,
                Err(err) if err.is_auth() => {
                    return Err(anyhow::anyhow!(err).context("authentication failed at startup"));
                }
                Err(err) => {
                    warn!(%err, "initial sync failed, retrying");
                    tokio::select! {
                        _ = this.cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(STARTUP_RETRY_DELAY) => {}
                    }
                }
            }
        }

        let mut watcher = LocalWatcher::start(
            &this.config.root,
            Arc::clone(&this.filter),
            this.suppress.clone(),
            this.config.debounce_period,
        )
        .context("failed to start filesystem watcher")?;

        let (refresh_tx, mut refresh_rx) = mpsc::channel::<()>(1);

        let drain = {
            let this = Arc::clone(&this);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = this.cancel.cancelled() => break,
                        _ = tokio::time::sleep(DRAIN_TICK) => {}
                    }
                    this.drain_events(&mut watcher).await;
                }
            })
        };

        let check = {
            let this = Arc::clone(&this);
            let refresh_tx = refresh_tx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = this.cancel.cancelled() => break,
                        _ = tokio::time::sleep(this.config.check_period) => {}
                    }
                    match this.scanner.check_changed(&this.remote).await {
                        Ok(true) => {
                            info!("iCloud Drive changes detected");
                            // A refresh already queued or running absorbs
                            // this request.
                            let _ = refresh_tx.try_send(());
                        }
                        Ok(false) => {}
                        Err(err) if err.is_auth() => {
                            warn!(%err, "change check paused until authentication recovers");
                        }
                        Err(err) => warn!(%err, "change check failed"),
                    }
                }
            })
        };

        let refresh = {
            let this = Arc::clone(&this);
            tokio::spawn(async move {
                let mut multiplier = 1u32;
                loop {
                    tokio::select! {
                        _ = this.cancel.cancelled() => break,
                        _ = tokio::time::sleep(this.config.refresh_period * multiplier) => {}
                        Some(()) = refresh_rx.recv() => {}
                    }
                    // Coalesce any requests that piled up meanwhile.
                    while refresh_rx.try_recv().is_ok() {}

                    match this.refresh_once().await {
                        Ok(_) => multiplier = 1,
                        Err(SyncError::RefreshInconsistent { declared, counted }) => {
                            multiplier = next_refresh_multiplier(multiplier);
                            warn!(
                                declared,
                                counted, multiplier, "refresh inconsistent, backing off"
                            );
                        }
                        Err(err) if err.is_auth() => {
                            warn!(%err, "refresh paused until authentication recovers");
                        }
                        Err(err) => warn!(%err, "refresh failed"),
                    }
                }
            })
        };

        info!("waiting for events to happen...");
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("failed waiting for shutdown signal")?;
                info!("shutdown requested");
            }
            _ = this.cancel.cancelled() => {}
        }
        this.cancel.cancel();

        drain.abort();
        check.abort();
        refresh.abort();

        let dead = this.executor.dead_letters();
        if !dead.is_empty() {
            for letter in &dead {
                error!(
                    action = %letter.action,
                    error = %letter.error,
                    attempts = letter.attempts,
                    "unresolved action at shutdown"
                );
            }
        }
        Ok(())
    }

    fn dump(&self, name: &str, replica: &Replica) {
        if let Err(err) = self.dumper.dump(name, replica) {
            warn!(name, %err, "state dump failed");
        }
    }
}
