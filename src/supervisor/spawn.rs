//! Worker transports.
//!
//! [`ProcessSpawner`] runs each worker as a child process speaking JSON
//! lines; extraction models are not shared between workers and a wedged
//! model can be killed without taking the supervisor down. On Unix each
//! worker leads its own process group, so killing it also takes down any
//! OCR command it started. [`ThreadSpawner`]
//! runs the same worker loop on a thread, for in-process scans and tests.

use anyhow::{anyhow, Context, Result};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use super::{SlotEnvelope, SlotMessage, WorkerCommand, WorkerEvent};
use crate::extract::FeatureExtractor;
use crate::worker::{self, WorkerOptions};

/// The supervisor's side of one running worker.
pub trait WorkerHandle {
    fn send(&mut self, command: &WorkerCommand) -> Result<()>;

    /// Stop the worker now. Must not block on the worker's cooperation.
    fn kill(&mut self);

    /// False once the worker is gone, even if its transport has not said so.
    fn is_alive(&mut self) -> bool;
}

pub trait WorkerSpawner {
    /// Start a worker for `slot`. Everything it reports, and a final
    /// [`SlotMessage::Exited`], goes to `events` tagged with `generation`.
    fn spawn(
        &mut self,
        slot: usize,
        generation: u64,
        events: mpsc::Sender<SlotEnvelope>,
    ) -> Result<Box<dyn WorkerHandle>>;
}

// ============================================================================
// Process transport
// ============================================================================

/// Spawns `program args.. --slot N`, normally the current executable's
/// `worker` subcommand.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Re-run this binary as `bibfinder [--config PATH] worker`.
    pub fn current_exe(config_path: Option<PathBuf>) -> Result<Self> {
        let program = std::env::current_exe().context("Cannot locate the bibfinder executable")?;
        let mut args = Vec::new();
        if let Some(path) = config_path {
            args.push("--config".to_string());
            args.push(path.to_string_lossy().to_string());
        }
        args.push("worker".to_string());
        Ok(Self::new(program, args))
    }
}

struct ProcessHandle {
    child: Child,
    stdin: Option<ChildStdin>,
}

impl WorkerHandle for ProcessHandle {
    fn send(&mut self, command: &WorkerCommand) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("Worker stdin already closed"))?;
        let mut line = serde_json::to_vec(command)?;
        line.push(b'\n');
        stdin.write_all(&line)?;
        stdin.flush()?;
        Ok(())
    }

    fn kill(&mut self) {
        self.stdin = None;
        kill_process_group(&self.child);
        let _ = self.child.kill();
        let _ = self.child.wait();
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

/// SIGKILL the group `child` leads, reaching its own children too.
#[cfg(unix)]
fn kill_process_group(child: &Child) {
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        return;
    };
    unsafe {
        if libc::kill(-pgid, libc::SIGKILL) != 0 {
            tracing::debug!(pid = pgid, "Worker process group already gone");
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.is_alive() {
            self.kill();
        }
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(
        &mut self,
        slot: usize,
        generation: u64,
        events: mpsc::Sender<SlotEnvelope>,
    ) -> Result<Box<dyn WorkerHandle>> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("--slot")
            .arg(slot.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to start worker {}", self.program.display()))?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Worker stdout not captured"))?;

        std::thread::Builder::new()
            .name(format!("worker-{}-reader", slot))
            .spawn(move || {
                let send = |message| {
                    events
                        .send(SlotEnvelope { slot, generation, message })
                        .is_ok()
                };
                for line in BufReader::new(stdout).lines() {
                    let Ok(line) = line else { break };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<WorkerEvent>(&line) {
                        Ok(event) => {
                            if !send(SlotMessage::Event(event)) {
                                return;
                            }
                        }
                        Err(e) => tracing::warn!(slot, "Ignoring malformed worker output: {}", e),
                    }
                }
                send(SlotMessage::Exited);
            })
            .context("Failed to start worker reader thread")?;

        tracing::debug!(slot, generation, pid = child.id(), "Worker process started");
        Ok(Box::new(ProcessHandle { child, stdin }))
    }
}

// ============================================================================
// Thread transport
// ============================================================================

pub type ExtractorFactory =
    Arc<dyn Fn(usize) -> Result<Box<dyn FeatureExtractor + Send>> + Send + Sync>;

/// Runs workers on threads. Each worker builds its own extractor with the
/// factory, the way a worker process loads its own models.
#[derive(Clone)]
pub struct ThreadSpawner {
    factory: ExtractorFactory,
    options: WorkerOptions,
}

impl ThreadSpawner {
    pub fn new<F>(options: WorkerOptions, factory: F) -> Self
    where
        F: Fn(usize) -> Result<Box<dyn FeatureExtractor + Send>> + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
            options,
        }
    }
}

struct ThreadHandle {
    commands: Option<mpsc::Sender<WorkerCommand>>,
    killed: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle for ThreadHandle {
    fn send(&mut self, command: &WorkerCommand) -> Result<()> {
        let commands = self
            .commands
            .as_ref()
            .ok_or_else(|| anyhow!("Worker already killed"))?;
        commands
            .send(command.clone())
            .map_err(|_| anyhow!("Worker thread has exited"))
    }

    /// Threads cannot be killed; the worker is cut off instead. It finishes
    /// its current photo in the background and its output is discarded.
    fn kill(&mut self) {
        self.killed.store(true, Ordering::SeqCst);
        self.commands = None;
        self.thread = None;
    }

    fn is_alive(&mut self) -> bool {
        !self.killed.load(Ordering::SeqCst)
            && self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl WorkerSpawner for ThreadSpawner {
    fn spawn(
        &mut self,
        slot: usize,
        generation: u64,
        events: mpsc::Sender<SlotEnvelope>,
    ) -> Result<Box<dyn WorkerHandle>> {
        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let killed = Arc::new(AtomicBool::new(false));
        let factory = Arc::clone(&self.factory);
        let options = self.options;
        let cut_off = Arc::clone(&killed);

        let thread = std::thread::Builder::new()
            .name(format!("worker-{}", slot))
            .spawn(move || {
                let send = |message| {
                    !cut_off.load(Ordering::SeqCst)
                        && events
                            .send(SlotEnvelope { slot, generation, message })
                            .is_ok()
                };

                match factory(slot) {
                    Ok(mut extractor) => {
                        worker::run(slot, &mut extractor, &options, command_rx, |event| {
                            send(SlotMessage::Event(event))
                        });
                    }
                    Err(e) => tracing::error!(slot, "Worker failed to start: {:#}", e),
                }
                send(SlotMessage::Exited);
            })
            .context("Failed to start worker thread")?;

        tracing::debug!(slot, generation, "Worker thread started");
        Ok(Box::new(ThreadHandle {
            commands: Some(command_tx),
            killed,
            thread: Some(thread),
        }))
    }
}
