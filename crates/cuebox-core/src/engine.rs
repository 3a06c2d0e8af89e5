//! Cuebox engine: the threaded runtime around a [`Director`].
//!
//! The director moves into a single scheduler thread that wakes once per
//! tick, drains queued commands, advances the schedule and publishes a
//! snapshot. Everything outside that thread talks to it through a command
//! channel and reads the last published snapshot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::Mutex;

#[cfg(feature = "native")]
use crate::backend::NativeBackend;
use crate::backend::AudioBackend;
use crate::catalog::Catalog;
use crate::config::SchedulerConfig;
use crate::director::Director;
use crate::error::EngineError;
use crate::models::{Command, Snapshot};

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    catalog: Arc<Catalog>,
    /// The director until `start` hands it to the scheduler thread.
    pending: Mutex<Option<Director>>,
    commands: Mutex<Option<Sender<Command>>>,
    /// Last snapshot published by the scheduler thread.
    snapshot: Arc<Mutex<Snapshot>>,
    shutdown: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Engine playing through the default output device.
    #[cfg(feature = "native")]
    pub fn new(catalog: Catalog, config: SchedulerConfig) -> Result<Self, EngineError> {
        Self::with_backend(catalog, Arc::new(NativeBackend::new()), config)
    }

    /// Engine with a custom backend, e.g. `NoopBackend` for headless use.
    pub fn with_backend(
        catalog: Catalog,
        backend: Arc<dyn AudioBackend>,
        config: SchedulerConfig,
    ) -> Result<Self, EngineError> {
        let catalog = Arc::new(catalog);
        let director = Director::new(Arc::clone(&catalog), backend, config)?;
        let snapshot = director.snapshot();
        Ok(Self {
            catalog,
            pending: Mutex::new(Some(director)),
            commands: Mutex::new(None),
            snapshot: Arc::new(Mutex::new(snapshot)),
            shutdown: Arc::new(AtomicBool::new(false)),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Start the scheduler loop and activate the default theme. Idempotent.
    pub fn start(&self) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() || self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        // Hold `pending` until the sender is in place so no command is lost.
        let mut pending = self.pending.lock();
        let Some(director) = pending.take() else {
            return;
        };
        let (tx, rx) = mpsc::channel();
        *self.commands.lock() = Some(tx);
        drop(pending);
        handles.push(self.start_scheduler(director, rx));
    }

    /// Stop the scheduler loop, silence every channel and wait for the
    /// thread to exit. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.commands.lock().take();

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                log::error!("cuebox: scheduler thread panicked");
            }
        }

        if let Some(mut director) = self.pending.lock().take() {
            director.shutdown();
            *self.snapshot.lock() = director.snapshot();
        }
    }

    pub fn is_running(&self) -> bool {
        !self.handles.lock().is_empty() && !self.shutdown.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Control surface
    // -----------------------------------------------------------------------

    /// Queue a command for the next tick. Before `start` the command waits
    /// in the director's own queue.
    pub fn command(&self, cmd: Command) -> Result<(), EngineError> {
        if let Some(director) = self.pending.lock().as_mut() {
            director.submit(cmd);
            return Ok(());
        }
        match self.commands.lock().as_ref() {
            Some(tx) => tx.send(cmd).map_err(|_| EngineError::Stopped),
            None => Err(EngineError::Stopped),
        }
    }

    /// Dispatch an assignable key. `Ok(false)` when nothing is bound to it.
    pub fn key(&self, key: char) -> Result<bool, EngineError> {
        match self.catalog.command_for_key(key) {
            Some(cmd) => self.command(cmd).map(|_| true),
            None => Ok(false),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.lock().clone()
    }

    // -----------------------------------------------------------------------
    // Scheduler loop
    // -----------------------------------------------------------------------

    fn start_scheduler(&self, mut director: Director, rx: Receiver<Command>) -> JoinHandle<()> {
        let snapshot = Arc::clone(&self.snapshot);
        let shutdown = Arc::clone(&self.shutdown);

        thread::spawn(move || {
            let tick = director.config().tick;
            log::info!("cuebox: scheduler running, tick {:?}", tick);
            director.activate_default();
            *snapshot.lock() = director.snapshot();

            let mut deadline = Instant::now() + tick;
            while !shutdown.load(Ordering::SeqCst) {
                let now = Instant::now();
                if deadline > now {
                    thread::sleep(deadline - now);
                } else if now - deadline > tick {
                    log::debug!("cuebox: scheduler fell behind by {:?}", now - deadline);
                    deadline = now;
                }
                deadline += tick;

                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                for cmd in rx.try_iter() {
                    director.submit(cmd);
                }
                director.tick();
                *snapshot.lock() = director.snapshot();
            }

            director.shutdown();
            *snapshot.lock() = director.snapshot();
            log::info!("cuebox: scheduler stopped");
        })
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Don't join here; the loop exits at its next wake-up.
    }
}
