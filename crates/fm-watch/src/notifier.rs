// notifier.rs — ChangeNotifier: the board's external-mutation pipeline.
//
// One supervisor thread owns the filesystem watcher and the drain loop:
// raw events map to project ids, ids debounce in the queue, and settled
// projects go through the engine's absorption path. If the watcher
// backend fails, the supervisor reports the failure to the owner's
// health callback and rebuilds the watch with exponential backoff —
// stop() is the only way the watch goes quiet without an error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use fm_engine::{EngineError, EventSink, StateMachine};
use fm_store::{ProjectState, StoreError};
use notify::{RecursiveMode, Watcher};

use crate::debounce::DebounceQueue;
use crate::error::WatchError;

type HealthCallback = Box<dyn Fn(&WatchError) + Send>;
type KnownStates = HashMap<String, ProjectState>;

/// Everything the watch thread needs, cloned out of the notifier.
struct WatchContext {
    engine: Arc<StateMachine>,
    running: Arc<AtomicBool>,
    known: Arc<Mutex<KnownStates>>,
    health: Arc<Mutex<Option<HealthCallback>>>,
    board_root: PathBuf,
    window: Duration,
}

/// Watches the board for externally-made mutations and feeds them
/// through the state machine.
///
/// Explicitly owned and lifecycle-scoped: construct it, `start()` it,
/// and `stop()` it (drop stops it too). There is no process-global
/// watcher hiding anywhere.
pub struct ChangeNotifier {
    engine: Arc<StateMachine>,
    running: Arc<AtomicBool>,
    known: Arc<Mutex<KnownStates>>,
    health: Arc<Mutex<Option<HealthCallback>>>,
    handle: Option<JoinHandle<()>>,
}

impl ChangeNotifier {
    pub fn new(engine: Arc<StateMachine>) -> Self {
        Self {
            engine,
            running: Arc::new(AtomicBool::new(false)),
            known: Arc::new(Mutex::new(HashMap::new())),
            health: Arc::new(Mutex::new(None)),
            handle: None,
        }
    }

    /// Register an event sink with the engine's dispatcher. Validated
    /// external changes arrive there tagged with cause `observed`.
    pub fn subscribe(&self, sink: Box<dyn EventSink>) {
        self.engine.subscribe(sink);
    }

    /// Register a callback invoked whenever the watch backend fails.
    /// The notifier restarts the watch regardless; this is how the
    /// owner finds out it happened.
    pub fn on_watch_error(&self, callback: HealthCallback) {
        *lock(&self.health) = Some(callback);
    }

    /// Prime the known-state cache and spawn the watch thread.
    pub fn start(&mut self) -> Result<(), WatchError> {
        if self.handle.is_some() {
            return Err(WatchError::AlreadyRunning);
        }

        // Records already on the board are known state, not news.
        let mut known = lock(&self.known);
        for project in self.engine.store().list_all()? {
            known.insert(project.project_id.clone(), project.state);
        }
        drop(known);

        self.running.store(true, Ordering::SeqCst);
        let ctx = WatchContext {
            engine: Arc::clone(&self.engine),
            running: Arc::clone(&self.running),
            known: Arc::clone(&self.known),
            health: Arc::clone(&self.health),
            board_root: self.engine.config().board_root.clone(),
            window: self.engine.config().debounce_window(),
        };
        self.handle = Some(std::thread::spawn(move || supervise(ctx)));
        tracing::info!("board watch started");
        Ok(())
    }

    /// Stop the watch thread and wait for it to exit.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("watch thread panicked during shutdown");
            }
            tracing::info!("board watch stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some() && self.running.load(Ordering::SeqCst)
    }
}

impl Drop for ChangeNotifier {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Keep the watch alive until stop: run sessions, restart on failure
/// with doubling backoff, and surface every failure to the owner.
fn supervise(ctx: WatchContext) {
    let mut backoff = Duration::from_millis(200);
    while ctx.running.load(Ordering::SeqCst) {
        match watch_session(&ctx) {
            Ok(()) => return,
            Err(err) => {
                tracing::error!(%err, "board watch failed; restarting");
                if let Some(callback) = lock(&ctx.health).as_ref() {
                    callback(&err);
                }
                interruptible_sleep(&ctx.running, backoff);
                backoff = (backoff * 2).min(Duration::from_secs(5));
            }
        }
    }
}

/// One watcher lifetime: subscribe, drain, debounce, absorb.
fn watch_session(ctx: &WatchContext) -> Result<(), WatchError> {
    let (tx, rx) = mpsc::channel::<notify::Result<notify::Event>>();
    let mut watcher = notify::recommended_watcher(move |res| {
        // Receiver gone means the session ended; nothing to do.
        tx.send(res).ok();
    })?;
    watcher.watch(&ctx.board_root, RecursiveMode::Recursive)?;

    let mut queue = DebounceQueue::new(ctx.window);
    let poll = ctx
        .window
        .min(Duration::from_millis(100))
        .max(Duration::from_millis(10));

    while ctx.running.load(Ordering::SeqCst) {
        match rx.recv_timeout(poll) {
            Ok(Ok(event)) => {
                let now = Instant::now();
                for path in &event.paths {
                    if let Some(id) = project_id_for(&ctx.board_root, path) {
                        queue.note(id, now);
                    }
                }
            }
            Ok(Err(err)) => return Err(WatchError::Backend(err)),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                return Err(WatchError::Backend(notify::Error::generic(
                    "watch channel disconnected",
                )));
            }
        }

        for id in queue.drain_settled(Instant::now()) {
            absorb(ctx, &id);
        }
    }
    Ok(())
}

/// Feed one settled project through the engine, with the skip rules:
/// corrupt records are a writer mid-flight, engine-written versions are
/// our own echo, and a rejected edit is reported once.
fn absorb(ctx: &WatchContext, id: &str) {
    let (current_state, version) = match ctx.engine.store().read(id) {
        Ok((project, version)) => (project.state, version),
        Err(StoreError::Corrupt { reason, .. }) => {
            tracing::warn!(id, %reason, "skipping corrupt record, writer likely mid-flight");
            return;
        }
        Err(StoreError::NotFound { .. }) => {
            lock(&ctx.known).remove(id);
            tracing::info!(id, "project disappeared from board");
            return;
        }
        Err(err) => {
            tracing::warn!(id, %err, "unreadable record");
            return;
        }
    };

    if ctx.engine.last_written_version(id) == Some(version) {
        lock(&ctx.known).insert(id.to_string(), current_state);
        return;
    }

    let prior = lock(&ctx.known).get(id).copied();
    match ctx.engine.absorb_external(id, prior) {
        Ok(absorbed) => {
            lock(&ctx.known).insert(id.to_string(), absorbed.state);
        }
        Err(EngineError::Store(StoreError::Corrupt { .. })) => {
            tracing::warn!(id, "record went corrupt mid-absorption; skipping");
        }
        Err(err) => {
            // Same invariants as internal callers. Cache the on-disk
            // state anyway so one bad edit isn't re-reported on every
            // later signal.
            tracing::warn!(id, %err, "rejected external edit");
            lock(&ctx.known).insert(id.to_string(), current_state);
        }
    }
}

/// Map a raw watcher path to the project it belongs to.
///
/// Accepts `<root>/<bucket>/<id>/...` for real buckets; everything else
/// (`.locks`, the event feed, hidden entries) is noise.
fn project_id_for(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut components = rel.components();

    let bucket = components.next()?.as_os_str().to_str()?;
    if !ProjectState::ALL.iter().any(|state| state.bucket() == bucket) {
        return None;
    }

    let id = components.next()?.as_os_str().to_str()?;
    if id.starts_with('.') {
        return None;
    }
    Some(id.to_string())
}

fn interruptible_sleep(running: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while Instant::now() < deadline && running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
