//! Poll, diff, trigger
//!
//! One [`Engine`] drives one [`Stage`]. Each poll:
//! 1. asks the stage's source for candidate units (sorted)
//! 2. drops units already in the ledger or currently in flight
//! 3. groups the rest and builds one command per group
//! 4. spawns each command as a background task and returns
//!
//! A finished task marks its units done only when the tool succeeded, then
//! runs the stage's follow-up. Failed units stay unmarked and are offered
//! again on the next poll.
//!
//! Follow-up work deferred by an earlier group (see
//! [`crate::stage::FollowUp::has_pending`]) is retried in the background at
//! the start of each poll, one retry task at a time.
//!
//! Polls never wait for tools. `run_forever` keeps ticking while tools run;
//! `run_once` polls a single time and then waits for everything it started.

use crate::error::Error;
use crate::runner::{self, RunOutcome};
use crate::scanner;
use crate::stage::{group_units, Stage, WorkGroup};
use smitt_common::{Ledger, MemoryLedger};
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Result of one finished group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupReport {
    pub subfolder: String,
    pub label: String,
    pub keys: Vec<String>,
    pub outcome: RunOutcome,
}

/// Summary of one poll
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Units listed by the source
    pub discovered: usize,
    /// Units neither known nor in flight
    pub fresh: usize,
    /// Groups whose tool was started
    pub spawned: usize,
    /// Groups left for a later poll (inputs not ready)
    pub deferred: usize,
    /// Groups whose command could not be built
    pub rejected: usize,
    /// Groups that finished, collected by this call
    pub finished: Vec<GroupReport>,
}

impl TickReport {
    pub fn succeeded(&self) -> usize {
        self.finished.iter().filter(|r| r.outcome.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.finished.len() - self.succeeded()
    }

    /// Whether any tool could not be started or any command not be built
    pub fn had_launch_failure(&self) -> bool {
        self.rejected > 0
            || self
                .finished
                .iter()
                .any(|r| matches!(r.outcome, RunOutcome::LaunchFailed(_)))
    }
}

type SharedLedger = Arc<Mutex<Box<dyn Ledger>>>;
type SharedKeys = Arc<Mutex<HashSet<String>>>;

/// A poisoned lock only means another task panicked mid-update; the sets
/// themselves stay consistent
fn locked<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// In-flight registration, removed on drop
struct InFlight {
    keys: Vec<String>,
    set: SharedKeys,
}

impl InFlight {
    fn register(set: &SharedKeys, keys: Vec<String>) -> Self {
        locked(set).extend(keys.iter().cloned());
        Self {
            keys,
            set: Arc::clone(set),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut set = locked(&self.set);
        for key in &self.keys {
            set.remove(key);
        }
    }
}

/// Polling engine for one stage
pub struct Engine {
    stage: Arc<Stage>,
    ledger: SharedLedger,
    in_flight: SharedKeys,
    tasks: JoinSet<GroupReport>,
    retry: Option<JoinHandle<()>>,
}

impl Engine {
    /// Engine with an empty in-memory ledger
    pub fn new(stage: Stage) -> Self {
        Self::with_ledger(stage, Box::new(MemoryLedger::new()))
    }

    pub fn with_ledger(stage: Stage, ledger: Box<dyn Ledger>) -> Self {
        Self {
            stage: Arc::new(stage),
            ledger: Arc::new(Mutex::new(ledger)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            tasks: JoinSet::new(),
            retry: None,
        }
    }

    pub fn stage_name(&self) -> &str {
        &self.stage.name
    }

    /// Whether `key` has been processed successfully
    pub fn is_known(&self, key: &str) -> bool {
        locked(&self.ledger).contains(key)
    }

    pub fn known_count(&self) -> usize {
        locked(&self.ledger).len()
    }

    /// Units whose tool is still running
    pub fn in_flight_count(&self) -> usize {
        locked(&self.in_flight).len()
    }

    /// Scan, diff and start tools for new groups; must run inside a tokio
    /// runtime
    pub fn poll_once(&mut self) -> TickReport {
        self.retry_follow_up();

        let stage_name = self.stage.name.clone();
        let scanned = self.stage.source.discover();
        let mut report = TickReport {
            discovered: scanned.len(),
            ..TickReport::default()
        };

        let fresh = {
            let ledger = locked(&self.ledger);
            let in_flight = locked(&self.in_flight);
            scanner::diff(scanned, &**ledger)
                .into_iter()
                .filter(|u| !in_flight.contains(&u.key))
                .collect::<Vec<_>>()
        };
        report.fresh = fresh.len();
        if fresh.is_empty() {
            debug!(stage = %stage_name, discovered = report.discovered, "No new inputs");
            return report;
        }

        for group in group_units(fresh, self.stage.grouping) {
            match self.stage.invocation.prepare(&group) {
                Ok(spec) => {
                    self.spawn_group(group, spec);
                    report.spawned += 1;
                }
                Err(Error::NotReady(reason)) => {
                    warn!(stage = %stage_name, subfolder = %group.subfolder, "Deferred: {}", reason);
                    report.deferred += 1;
                }
                Err(e) => {
                    error!(stage = %stage_name, subfolder = %group.subfolder, error = %e, "Could not build command");
                    report.rejected += 1;
                }
            }
        }
        report
    }

    fn spawn_group(&mut self, group: WorkGroup, spec: runner::CommandSpec) {
        let stage = Arc::clone(&self.stage);
        let ledger = Arc::clone(&self.ledger);
        let flight = InFlight::register(&self.in_flight, group.keys());

        self.tasks.spawn(async move {
            let outcome = runner::run(&stage.name, &spec, stage.success).await;

            if outcome.is_success() {
                let mut ledger = locked(&ledger);
                for key in &flight.keys {
                    ledger.mark_done(key);
                }
            }
            // Known before leaving the in-flight set, so no poll sees neither
            drop(flight);

            if outcome.is_success() {
                if let Some(follow_up) = &stage.follow_up {
                    follow_up.on_success(&group, &spec).await;
                }
            }

            GroupReport {
                keys: group.keys(),
                subfolder: group.subfolder,
                label: spec.label,
                outcome,
            }
        });
    }

    /// Start a retry of deferred follow-up work unless one is running
    fn retry_follow_up(&mut self) {
        let Some(follow_up) = &self.stage.follow_up else {
            return;
        };
        if self.retry.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        if !follow_up.has_pending() {
            return;
        }

        info!(stage = %self.stage.name, "Retrying deferred follow-up work");
        let stage = Arc::clone(&self.stage);
        self.retry = Some(tokio::spawn(async move {
            if let Some(follow_up) = &stage.follow_up {
                follow_up.retry_pending().await;
            }
        }));
    }

    /// Collect finished groups without waiting
    pub fn reap(&mut self) -> Vec<GroupReport> {
        let mut done = Vec::new();
        while let Some(joined) = self.tasks.try_join_next() {
            self.collect(joined, &mut done);
        }
        done
    }

    /// Wait for every running group
    pub async fn drain(&mut self) -> Vec<GroupReport> {
        let mut done = Vec::new();
        while let Some(joined) = self.tasks.join_next().await {
            self.collect(joined, &mut done);
        }
        if let Some(retry) = self.retry.take() {
            if let Err(e) = retry.await {
                error!(stage = %self.stage.name, error = %e, "Follow-up retry ended abnormally");
            }
        }
        done
    }

    fn collect(&self, joined: Result<GroupReport, tokio::task::JoinError>, done: &mut Vec<GroupReport>) {
        match joined {
            Ok(report) => done.push(report),
            // Its in-flight keys were released when the task unwound
            Err(e) => error!(stage = %self.stage.name, error = %e, "Stage task ended abnormally"),
        }
    }

    /// Single poll, then wait for everything it started
    pub async fn run_once(&mut self) -> TickReport {
        let mut report = self.poll_once();
        report.finished = self.drain().await;
        log_tick(&self.stage.name, &report);
        report
    }

    /// Poll every `interval` until `shutdown` completes, then wait for
    /// running tools
    pub async fn run_forever<F>(&mut self, interval: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!(stage = %self.stage.name, interval_secs = interval.as_secs(), "Watching for new inputs");
        tokio::pin!(shutdown);

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    let finished = self.reap();
                    let mut report = self.poll_once();
                    report.finished = finished;
                    log_tick(&self.stage.name, &report);
                }
            }
        }

        let running = self.tasks.len();
        if running > 0 {
            info!(stage = %self.stage.name, running, "Waiting for running tools to finish");
        }
        let finished = self.drain().await;
        info!(stage = %self.stage.name, finished = finished.len(), "Watcher stopped");
    }
}

fn log_tick(stage: &str, report: &TickReport) {
    if report.fresh == 0 && report.finished.is_empty() {
        return;
    }
    info!(
        stage = %stage,
        discovered = report.discovered,
        fresh = report.fresh,
        spawned = report.spawned,
        deferred = report.deferred,
        rejected = report.rejected,
        succeeded = report.succeeded(),
        failed = report.failed(),
        "Poll complete"
    );
}
