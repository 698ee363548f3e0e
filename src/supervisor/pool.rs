//! The supervisor poll loop.

use anyhow::{bail, Result};
use std::collections::{HashSet, VecDeque};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use super::slot::WorkerSlot;
use super::spawn::{WorkerHandle, WorkerSpawner};
use super::{SlotEnvelope, SlotMessage, WorkItem, WorkResult, WorkerCommand, WorkerEvent};
use crate::config::ScanConfig;

/// What the result sink did with a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Durably written.
    Committed,
    /// Dropped; the photo stays eligible for the next run.
    Incomplete,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub workers: usize,
    /// A live worker silent for longer than this is replaced. Also how long
    /// the queue may sit empty before the run ends.
    pub sync_timeout: Duration,
    /// Extra time a new worker gets before liveness checks apply.
    pub master_wait_for: Duration,
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
    pub max_restarts: usize,
}

impl From<&ScanConfig> for SupervisorConfig {
    fn from(config: &ScanConfig) -> Self {
        Self {
            workers: config.workers,
            sync_timeout: config.sync_timeout(),
            master_wait_for: config.master_wait_for(),
            poll_interval: config.poll_interval(),
            shutdown_grace: config.shutdown_grace(),
            max_restarts: config.max_worker_restarts,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupervisorReport {
    pub workers: usize,
    pub total: usize,
    pub processed: usize,
    pub incomplete: usize,
    pub restarts: usize,
    pub timeouts: usize,
}

impl SupervisorReport {
    pub fn accounted(&self) -> usize {
        self.processed + self.incomplete
    }
}

pub struct Supervisor<S: WorkerSpawner> {
    config: SupervisorConfig,
    spawner: S,
}

/// Never more workers than CPUs, or than half the items (rounded up).
pub fn pool_size(configured: usize, cpus: usize, items: usize) -> usize {
    let useful = items.div_ceil(2).max(1);
    configured.min(cpus).min(useful).max(1)
}

/// State of one run.
struct Run<'a, F> {
    config: &'a SupervisorConfig,
    queue: VecDeque<WorkerCommand>,
    slots: Vec<WorkerSlot>,
    handles: Vec<Option<Box<dyn WorkerHandle>>>,
    /// Items without an outcome yet. Guarantees one outcome per item.
    outstanding: HashSet<i64>,
    report: SupervisorReport,
    sink: F,
}

impl<'a, F> Run<'a, F>
where
    F: FnMut(WorkResult) -> Disposition,
{
    fn has_work(&self) -> bool {
        self.queue
            .iter()
            .any(|c| matches!(c, WorkerCommand::Process(_)))
    }

    fn mark_incomplete(&mut self, item: &WorkItem, why: &str) {
        if self.outstanding.remove(&item.id) {
            self.report.incomplete += 1;
            tracing::warn!(photo_id = item.id, path = ?item.path, "Photo incomplete: {}", why);
        }
    }

    fn handle_result(&mut self, index: usize, result: WorkResult) {
        let item_id = result.item_id;
        if !self.slots[index].on_result(item_id) || !self.outstanding.remove(&item_id) {
            tracing::warn!(slot = index, photo_id = item_id, "Dropping unexpected result");
            return;
        }
        match (self.sink)(result) {
            Disposition::Committed => self.report.processed += 1,
            Disposition::Incomplete => self.report.incomplete += 1,
        }
    }

    /// Answer a worker's message with the next queue entry.
    fn dispatch_next(&mut self, index: usize) {
        let command = self.queue.pop_front().unwrap_or(WorkerCommand::Stop);
        let Some(handle) = self.handles[index].as_mut() else {
            self.queue.push_front(command);
            return;
        };

        if let Err(e) = handle.send(&command) {
            tracing::warn!(slot = index, "Failed to send to worker: {:#}", e);
            // The command never reached the worker, so it goes back to the queue.
            self.queue.push_front(command);
            if let Some(item) = self.slots[index].on_exit() {
                self.mark_incomplete(&item, "worker lost");
            }
            self.kill(index);
            return;
        }

        match command {
            WorkerCommand::Process(item) => self.slots[index].on_dispatch(item),
            WorkerCommand::Stop => self.slots[index].on_stop_sent(),
        }
    }

    fn handle(&mut self, envelope: SlotEnvelope, now: Instant) {
        let index = envelope.slot;
        if index >= self.slots.len() || envelope.generation != self.slots[index].generation() {
            tracing::debug!(slot = index, generation = envelope.generation, "Ignoring message from replaced worker");
            return;
        }

        match envelope.message {
            SlotMessage::Event(WorkerEvent::Ready) => {
                self.slots[index].on_message(now);
                tracing::debug!(slot = index, "Worker ready");
                self.dispatch_next(index);
            }
            SlotMessage::Event(WorkerEvent::Done(result)) => {
                self.slots[index].on_message(now);
                self.handle_result(index, result);
                self.dispatch_next(index);
            }
            SlotMessage::Exited => {
                if let Some(item) = self.slots[index].on_exit() {
                    self.mark_incomplete(&item, "worker exited");
                }
                if self.slots[index].needs_restart() {
                    tracing::warn!(slot = index, "Worker exited unexpectedly");
                }
                self.kill(index);
            }
        }
    }

    fn kill(&mut self, index: usize) {
        if let Some(mut handle) = self.handles[index].take() {
            handle.kill();
        }
    }

    fn check_liveness(&mut self, now: Instant) {
        for index in 0..self.slots.len() {
            let gone = self.slots[index].is_live()
                && self.handles[index].as_mut().is_some_and(|h| !h.is_alive());
            if gone {
                tracing::warn!(slot = index, "Worker died");
                if let Some(item) = self.slots[index].on_exit() {
                    self.mark_incomplete(&item, "worker exited");
                }
                self.kill(index);
                continue;
            }

            if !self.slots[index].is_overdue(now, self.config.sync_timeout) {
                continue;
            }
            tracing::warn!(
                slot = index,
                timeout_secs = self.config.sync_timeout.as_secs(),
                "Worker unresponsive, killing"
            );
            self.report.timeouts += 1;
            self.kill(index);
            if let Some(item) = self.slots[index].on_timeout() {
                self.mark_incomplete(&item, "worker timed out");
            }
        }
    }

    fn restart_down_slots<S: WorkerSpawner>(
        &mut self,
        spawner: &mut S,
        events: &mpsc::Sender<SlotEnvelope>,
        now: Instant,
    ) {
        for index in 0..self.slots.len() {
            if !self.slots[index].needs_restart() {
                continue;
            }
            if self.report.restarts >= self.config.max_restarts {
                continue;
            }

            self.report.restarts += 1;
            let generation = self.slots[index].begin_restart(now, self.config.master_wait_for);
            match spawner.spawn(index, generation, events.clone()) {
                Ok(handle) => {
                    tracing::info!(slot = index, generation, "Worker restarted");
                    self.handles[index] = Some(handle);
                }
                Err(e) => {
                    tracing::error!(slot = index, "Failed to restart worker: {:#}", e);
                    self.slots[index].on_spawn_failed();
                }
            }
        }
    }

    /// No worker is running or can be brought back.
    fn exhausted(&self) -> bool {
        let any_live = self.slots.iter().any(|s| s.is_live());
        let can_restart = self.report.restarts < self.config.max_restarts
            && self.slots.iter().any(|s| s.needs_restart());
        !any_live && !can_restart
    }

    fn abandon_queue(&mut self, why: &str) {
        let pending: Vec<WorkItem> = self
            .queue
            .drain(..)
            .filter_map(|c| match c {
                WorkerCommand::Process(item) => Some(item),
                WorkerCommand::Stop => None,
            })
            .collect();
        for item in &pending {
            self.mark_incomplete(item, why);
        }
    }
}

impl<S: WorkerSpawner> Supervisor<S> {
    pub fn new(config: SupervisorConfig, spawner: S) -> Self {
        Self { config, spawner }
    }

    /// Extract every item, passing each result to `sink` as it arrives.
    ///
    /// Every item gets exactly one outcome: `processed` counts items the sink
    /// committed, `incomplete` everything else (failed extraction, rejected
    /// commit, dead or hung worker, shutdown). Errors only when no worker
    /// can be started at all.
    pub fn run<F>(&mut self, items: Vec<WorkItem>, sink: F) -> Result<SupervisorReport>
    where
        F: FnMut(WorkResult) -> Disposition,
    {
        let total = items.len();
        if total == 0 {
            return Ok(SupervisorReport::default());
        }

        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let workers = pool_size(self.config.workers, cpus, total);
        tracing::info!(items = total, workers, "Starting worker pool");

        let mut queue: VecDeque<WorkerCommand> = VecDeque::with_capacity(total + workers);
        let outstanding = items.iter().map(|i| i.id).collect();
        queue.extend(items.into_iter().map(WorkerCommand::Process));
        queue.extend(std::iter::repeat(WorkerCommand::Stop).take(workers));

        let (events_tx, events_rx) = mpsc::channel::<SlotEnvelope>();
        let started = Instant::now();
        let mut run = Run {
            config: &self.config,
            queue,
            slots: (0..workers)
                .map(|i| WorkerSlot::new(i, started, self.config.master_wait_for))
                .collect(),
            handles: (0..workers).map(|_| None).collect(),
            outstanding,
            report: SupervisorReport {
                workers,
                total,
                ..Default::default()
            },
            sink,
        };

        let mut spawned = 0;
        for index in 0..workers {
            match self.spawner.spawn(index, 0, events_tx.clone()) {
                Ok(handle) => {
                    run.handles[index] = Some(handle);
                    spawned += 1;
                }
                Err(e) => {
                    tracing::error!(slot = index, "Failed to start worker: {:#}", e);
                    run.slots[index].on_spawn_failed();
                }
            }
        }
        if spawned == 0 {
            bail!("No extraction worker could be started");
        }

        let mut empty_since: Option<Instant> = None;
        loop {
            match events_rx.recv_timeout(self.config.poll_interval) {
                Ok(envelope) => run.handle(envelope, Instant::now()),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            while let Ok(envelope) = events_rx.try_recv() {
                run.handle(envelope, Instant::now());
            }

            let now = Instant::now();
            run.check_liveness(now);
            run.restart_down_slots(&mut self.spawner, &events_tx, now);

            if run.report.accounted() >= total {
                tracing::debug!("All items accounted for");
                break;
            }

            if run.has_work() {
                empty_since = None;
                if run.exhausted() {
                    tracing::error!(
                        restarts = run.report.restarts,
                        "No workers left and restart limit reached; abandoning queue"
                    );
                    run.abandon_queue("no workers left");
                }
            } else {
                let since = *empty_since.get_or_insert(now);
                if now.duration_since(since) > self.config.sync_timeout {
                    tracing::warn!(
                        outstanding = run.outstanding.len(),
                        "Queue empty past the sync timeout; stopping"
                    );
                    break;
                }
            }
        }

        // Give in-flight results a moment before killing whatever is left.
        if run.report.accounted() < total {
            let deadline = Instant::now() + self.config.shutdown_grace;
            while run.report.accounted() < total {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                match events_rx.recv_timeout(deadline - now) {
                    Ok(envelope) => run.handle(envelope, Instant::now()),
                    Err(_) => break,
                }
            }
        }

        for index in 0..workers {
            run.kill(index);
        }

        let leftovers: Vec<i64> = run.outstanding.iter().copied().collect();
        for id in leftovers {
            run.outstanding.remove(&id);
            run.report.incomplete += 1;
            tracing::warn!(photo_id = id, "Photo incomplete: run ended before it finished");
        }

        let report = run.report;
        tracing::info!(
            processed = report.processed,
            incomplete = report.incomplete,
            restarts = report.restarts,
            timeouts = report.timeouts,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Worker pool finished"
        );
        Ok(report)
    }
}
