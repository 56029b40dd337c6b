//! # Tracking Session
//!
//! Runs a [`TrackingEngine`] on a background worker that drains an ordered
//! message queue.
//!
//! Position producers push fixes through a cloneable [`FixSender`]. The worker
//! processes them one at a time, in arrival order, so a fix is fully applied
//! (matched, deduplicated, credited) before the next one starts.
//!
//! Controls (`start`, `stop`, `pause`, `resume`, `set_active_city`,
//! `load_catalogue`) travel through the same queue. A control lands after every
//! fix queued before it and the call returns once the worker has applied it, so
//! `stop()` never discards a fix that was already accepted. Fixes sent after the
//! control returns see the new state.
//!
//! Progress reads go through the aggregator's own read lock and do not wait for
//! the queue.

use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread;

use log::{debug, info, warn};

use crate::engine::{TrackingEngine, TrackingEvent, TrackingState};
use crate::progress::ProgressAggregator;
use crate::{CityProgress, Position, Result, RoadSegment, WalkerError};

type Command = Box<dyn FnOnce(&mut TrackingEngine) + Send>;

/// Messages consumed by the session worker.
enum SessionMessage {
    Fix(Position),
    SourceLost,
    /// Engine call ordered after everything queued before it
    Command(Command),
    Shutdown,
}

/// Cloneable producer handle for the session's fix queue.
#[derive(Clone)]
pub struct FixSender {
    tx: mpsc::Sender<SessionMessage>,
}

impl FixSender {
    /// Queue a fix. Fails once the session has shut down.
    pub fn send(&self, position: Position) -> Result<()> {
        self.tx
            .send(SessionMessage::Fix(position))
            .map_err(|_| WalkerError::SessionClosed)
    }

    /// Report that the position source failed or went silent.
    pub fn report_lost(&self) -> Result<()> {
        self.tx
            .send(SessionMessage::SourceLost)
            .map_err(|_| WalkerError::SessionClosed)
    }
}

/// A platform position provider.
///
/// The session starts the source when tracking becomes active and stops it on
/// pause or stop. Fixes are delivered through the given [`FixSender`].
pub trait PositionSource: Send {
    fn start(&mut self, sink: FixSender);
    fn stop(&mut self);
}

/// A tracking engine running behind an ordered queue.
pub struct TrackingSession {
    engine: Arc<Mutex<TrackingEngine>>,
    progress: Arc<RwLock<ProgressAggregator>>,
    tx: mpsc::Sender<SessionMessage>,
    worker: Option<thread::JoinHandle<()>>,
    source: Option<Box<dyn PositionSource>>,
}

impl TrackingSession {
    /// Spawn the worker for `engine`. Fixes are pushed by the caller.
    pub fn spawn(engine: TrackingEngine) -> Self {
        let progress = engine.progress_handle();
        let engine = Arc::new(Mutex::new(engine));
        let (tx, rx) = mpsc::channel();

        let worker_engine = Arc::clone(&engine);
        let worker = thread::spawn(move || {
            let mut processed = 0u64;
            for message in rx {
                match message {
                    SessionMessage::Fix(position) => {
                        lock(&worker_engine).process_fix(&position);
                        processed += 1;
                    }
                    SessionMessage::SourceLost => {
                        lock(&worker_engine).position_lost();
                    }
                    SessionMessage::Command(command) => command(&mut *lock(&worker_engine)),
                    SessionMessage::Shutdown => break,
                }
            }
            debug!("[TrackingSession] Worker exiting after {} fixes", processed);
        });

        Self {
            engine,
            progress,
            tx,
            worker: Some(worker),
            source: None,
        }
    }

    /// Spawn the worker and attach a position source it controls.
    pub fn with_source(engine: TrackingEngine, source: Box<dyn PositionSource>) -> Self {
        let mut session = Self::spawn(engine);
        session.source = Some(source);
        session
    }

    /// Producer handle for pushing fixes.
    pub fn sender(&self) -> FixSender {
        FixSender {
            tx: self.tx.clone(),
        }
    }

    /// Run `f` on the worker after everything already queued, and wait for it.
    pub fn run_ordered<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut TrackingEngine) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = mpsc::channel();
        let command: Command = Box::new(move |engine: &mut TrackingEngine| {
            reply_tx.send(f(engine)).ok();
        });
        self.tx
            .send(SessionMessage::Command(command))
            .map_err(|_| WalkerError::SessionClosed)?;
        reply_rx.recv().map_err(|_| WalkerError::SessionClosed)
    }

    // ========================================================================
    // Controls
    // ========================================================================

    pub fn start(&mut self) -> Result<()> {
        self.run_ordered(|engine| engine.start())??;
        self.start_source();
        Ok(())
    }

    /// Pause after every fix already queued has been applied.
    pub fn pause(&mut self) -> Result<()> {
        self.run_ordered(|engine| engine.pause())??;
        self.stop_source();
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        self.run_ordered(|engine| engine.resume())??;
        self.start_source();
        Ok(())
    }

    /// Stop after every fix already queued has been applied.
    pub fn stop(&mut self) -> Result<()> {
        self.run_ordered(|engine| engine.stop())??;
        self.stop_source();
        Ok(())
    }

    fn start_source(&mut self) {
        let sink = self.sender();
        if let Some(source) = self.source.as_mut() {
            source.start(sink);
        }
    }

    fn stop_source(&mut self) {
        if let Some(source) = self.source.as_mut() {
            source.stop();
        }
    }

    pub fn set_active_city(&self, city_id: &str) -> Result<()> {
        let city_id = city_id.to_string();
        self.run_ordered(move |engine| engine.set_active_city(&city_id))?
    }

    pub fn load_catalogue(&self, city_id: &str, segments: Vec<RoadSegment>) -> Result<()> {
        let city_id = city_id.to_string();
        self.run_ordered(move |engine| engine.load_catalogue(&city_id, segments))?
    }

    pub fn subscribe(&self) -> mpsc::Receiver<TrackingEvent> {
        lock(&self.engine).subscribe()
    }

    /// Run `f` against the engine between two fixes, without waiting for the
    /// queue. Use [`run_ordered`](Self::run_ordered) to see every queued fix.
    pub fn with_engine<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut TrackingEngine) -> R,
    {
        f(&mut *lock(&self.engine))
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn state(&self) -> TrackingState {
        lock(&self.engine).state()
    }

    /// Progress snapshot. Never observes a half-applied fix.
    pub fn progress(&self, user_id: &str, city_id: &str) -> Option<CityProgress> {
        self.progress
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .progress(user_id, city_id)
    }

    pub fn all_progress(&self) -> Vec<CityProgress> {
        self.progress
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .all_progress()
    }

    /// Block until every fix queued before this call has been processed.
    pub fn flush(&self) -> Result<()> {
        self.run_ordered(|_| ())
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stop the source, drain queued fixes and join the worker.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.stop_source();
        self.tx.send(SessionMessage::Shutdown).ok();
        if worker.join().is_err() {
            warn!("[TrackingSession] Worker panicked");
        } else {
            info!("[TrackingSession] Closed");
        }
    }
}

impl Drop for TrackingSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock(engine: &Mutex<TrackingEngine>) -> MutexGuard<'_, TrackingEngine> {
    engine.lock().unwrap_or_else(|e| e.into_inner())
}
