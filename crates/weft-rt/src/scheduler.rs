// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduler thread: one cooperative thread of execution driven by a
//! command queue.
//!
//! The thread is made of strands that pass a single baton around:
//!
//! - root: owns the run loop; resumes the reader once per command and
//!   tears everything down when told to stop.
//! - reader: checks for quiescence, then blocks on the queue and hands the
//!   next command to the processor.
//! - processor: runs the command's action, switching into fiber strands
//!   when the action needs them, then returns the baton to the root.
//! - one strand per fiber, started by `SpawnTask`. User code only ever
//!   runs on these, so the thread-start hook runs at the top of each one.
//!
//! Only the strand holding the baton runs, so the per-thread state in
//! `LocalState` is never touched concurrently. The mutex around it exists
//! because strands are separate OS threads.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::command::{self, Command, CommandSender};
use crate::context::{self, FiberContext, ThreadContext};
use crate::error::{BoxError, BridgeError, UsageError};
use crate::fiber::FiberId;
use crate::lifecycle::{Lifecycle, LifecycleCell};
use crate::runtime::{run_init_hook, InitHook, Runtime};
use crate::strand::{self, StrandId, ToProcessor, ToReader, ToRoot, Wake};
use crate::task::Task;

static NEXT_SCHEDULER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchedulerId(u64);

impl SchedulerId {
    pub(crate) fn next() -> Self {
        SchedulerId(NEXT_SCHEDULER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SchedulerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State owned by one scheduler thread.
pub(crate) struct LocalState {
    /// Active fibers and the strands parked on each.
    fibers: HashMap<FiberId, Vec<StrandId>>,
    /// Wake inboxes of live fiber strands.
    strands: HashMap<StrandId, Sender<Wake>>,
    /// Mirror of `fibers.len()` for handles on other threads.
    active: Arc<AtomicUsize>,
}

impl LocalState {
    pub fn new(active: Arc<AtomicUsize>) -> Self {
        Self {
            fibers: HashMap::new(),
            strands: HashMap::new(),
            active,
        }
    }

    pub fn add_fiber(&mut self, id: FiberId) {
        self.fibers.insert(id, Vec::new());
        self.sync_active();
    }

    pub fn add_waiter(&mut self, id: FiberId, strand: StrandId) {
        if let Some(waiters) = self.fibers.get_mut(&id) {
            if !waiters.contains(&strand) {
                waiters.push(strand);
            }
        }
    }

    /// Remove a completed fiber from the active set, returning its waiters.
    /// `None` if it was already removed.
    pub fn complete(&mut self, id: FiberId) -> Option<Vec<StrandId>> {
        let waiters = self.fibers.remove(&id);
        self.sync_active();
        waiters
    }

    fn wake_sender(&self, strand: StrandId) -> Option<Sender<Wake>> {
        self.strands.get(&strand).cloned()
    }

    fn add_strand(&mut self, strand: StrandId, wake: Sender<Wake>) {
        self.strands.insert(strand, wake);
    }

    fn remove_strand(&mut self, strand: StrandId) {
        self.strands.remove(&strand);
    }

    /// No active fiber and no running strand.
    pub fn is_idle(&self) -> bool {
        self.fibers.is_empty() && self.strands.is_empty()
    }

    /// Drop every wake inbox so parked strands observe termination.
    fn release_strands(&mut self) -> usize {
        let n = self.strands.len();
        self.strands.clear();
        n
    }

    fn sync_active(&self) {
        self.active.store(self.fibers.len(), Ordering::Release);
    }
}

struct HandleInner {
    id: SchedulerId,
    name: String,
    commands: CommandSender,
    lifecycle: LifecycleCell,
    runtime: Runtime,
    on_thread_start: Option<InitHook>,
    active: Arc<AtomicUsize>,
}

/// Cloneable reference to a scheduler thread, usable from any OS thread.
#[derive(Clone)]
pub struct ThreadHandle {
    inner: Arc<HandleInner>,
}

impl ThreadHandle {
    pub fn id(&self) -> SchedulerId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.lifecycle.get()
    }

    /// Block until the thread terminated. Returns false on timeout.
    pub fn wait_terminated(&self, timeout: Duration) -> bool {
        self.inner.lifecycle.wait_terminated(timeout)
    }

    /// Number of fibers owned by this thread that have no outcome yet.
    pub fn active_fibers(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Request a graceful stop once no fiber is outstanding.
    pub fn start_shutdown(&self) -> Result<(), BridgeError> {
        self.send(Command::StartShutdown { thread: self.id() })
    }

    /// Stop the run loop at the next command boundary. Outstanding fibers
    /// are not drained; parked ones fail with `BridgeError::Terminated`.
    pub fn kill(&self) -> Result<(), BridgeError> {
        self.send(Command::Kill { thread: self.id() })
    }

    /// Run `f` in a new fiber on this thread and hand its outcome to
    /// `completion`. Callable from any OS thread.
    pub fn submit<T, F, C>(&self, f: F, completion: C) -> Result<(), BridgeError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, BoxError> + Send + 'static,
        C: FnOnce(Result<T, BridgeError>) + Send + 'static,
    {
        self.send(Command::SpawnTask(Task::new(f, completion)))
    }

    /// Like `submit`, for work whose fiber the caller already registered on
    /// this thread.
    pub(crate) fn submit_fiber<T, F, C>(&self, fiber: FiberId, f: F, completion: C) -> Result<(), BridgeError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, BoxError> + Send + 'static,
        C: FnOnce(Result<T, BridgeError>) + Send + 'static,
    {
        self.send(Command::SpawnTask(Task::new(f, completion).with_fiber(fiber)))
    }

    pub(crate) fn commands(&self) -> &CommandSender {
        &self.inner.commands
    }

    pub(crate) fn on_thread_start(&self) -> Option<&InitHook> {
        self.inner.on_thread_start.as_ref()
    }

    fn send(&self, cmd: Command) -> Result<(), BridgeError> {
        self.inner.commands.send(cmd).map_err(|err| {
            tracing::warn!(
                thread = %self.id(),
                command = err.0.name(),
                "scheduler thread terminated, dropping command"
            );
            BridgeError::Terminated(self.id())
        })
    }
}

impl fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

/// Owner of a scheduler thread. Dropping it shuts the thread down and
/// waits for it; `detach` gives that up.
pub struct SchedulerThread {
    handle: ThreadHandle,
    os_thread: Option<thread::JoinHandle<()>>,
}

impl SchedulerThread {
    /// Start a scheduler thread. `on_thread_start` runs on every strand of it
    /// that executes user code, before that code starts.
    pub(crate) fn start(
        runtime: Runtime,
        on_thread_start: Option<InitHook>,
    ) -> Result<Self, BridgeError> {
        let id = SchedulerId::next();
        let name = format!("{}-sched-{}", runtime.config().thread_name_prefix, id);
        let (commands, queue) = command::queue(id);
        let handle = ThreadHandle {
            inner: Arc::new(HandleInner {
                id,
                name: name.clone(),
                commands,
                lifecycle: LifecycleCell::new(),
                runtime,
                on_thread_start,
                active: Arc::new(AtomicUsize::new(0)),
            }),
        };

        let root = handle.clone();
        let os_thread = thread::Builder::new()
            .name(name)
            .spawn(move || run_root(root, queue))
            .map_err(BridgeError::ThreadSpawn)?;

        tracing::debug!(thread = %id, "scheduler thread started");
        Ok(Self {
            handle,
            os_thread: Some(os_thread),
        })
    }

    pub fn handle(&self) -> &ThreadHandle {
        &self.handle
    }

    pub fn id(&self) -> SchedulerId {
        self.handle.id()
    }

    pub fn submit<T, F, C>(&self, f: F, completion: C) -> Result<(), BridgeError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, BoxError> + Send + 'static,
        C: FnOnce(Result<T, BridgeError>) + Send + 'static,
    {
        self.handle.submit(f, completion)
    }

    /// Run `f` in a fiber on this thread and block the calling OS thread
    /// until it finishes.
    pub fn block_on<T, F>(&self, f: F) -> Result<T, BridgeError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, BoxError> + Send + 'static,
    {
        if context::current_scheduler() == Some(self.id()) {
            return Err(UsageError::BlockOnOwnThread.into());
        }
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.handle.submit(f, move |outcome| {
            let _ = tx.send(outcome);
        })?;
        rx.recv()
            .unwrap_or(Err(BridgeError::Terminated(self.id())))
    }

    pub fn start_shutdown(&self) -> Result<(), BridgeError> {
        self.handle.start_shutdown()
    }

    pub fn kill(&self) -> Result<(), BridgeError> {
        self.handle.kill()
    }

    /// Wait for the OS thread to exit.
    pub fn join(mut self) {
        self.join_os_thread();
    }

    /// Request shutdown and wait for termination.
    pub fn shutdown(mut self) {
        let _ = self.handle.start_shutdown();
        self.join_os_thread();
    }

    /// Let the thread run on its own. The handle still controls it.
    pub fn detach(mut self) -> ThreadHandle {
        self.os_thread.take();
        self.handle.clone()
    }

    fn join_os_thread(&mut self) {
        if let Some(t) = self.os_thread.take() {
            if t.join().is_err() {
                tracing::error!(thread = %self.id(), "scheduler root panicked");
            }
        }
    }
}

impl Drop for SchedulerThread {
    fn drop(&mut self) {
        if self.os_thread.is_none() {
            return;
        }
        let _ = self.handle.start_shutdown();
        if context::current_scheduler() == Some(self.id()) {
            tracing::warn!(thread = %self.id(), "scheduler dropped from its own fiber, detaching");
            self.os_thread.take();
            return;
        }
        self.join_os_thread();
    }
}

fn spawn_strand<F>(name: String, f: F) -> Option<thread::JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    match thread::Builder::new().name(name.clone()).spawn(f) {
        Ok(t) => Some(t),
        Err(e) => {
            tracing::error!(strand = %name, error = %e, "failed to spawn strand");
            None
        }
    }
}

fn run_root(handle: ThreadHandle, queue: Receiver<Command>) {
    let local = Arc::new(Mutex::new(LocalState::new(handle.inner.active.clone())));
    let (root_tx, root_rx) = strand::inbox::<ToRoot>();
    let (processor_tx, processor_rx) = strand::inbox::<ToProcessor>();
    let (reader_tx, reader_rx) = strand::inbox::<ToReader>();

    let processor = Processor {
        handle: handle.clone(),
        local: local.clone(),
        this: processor_tx.clone(),
        inbox: processor_rx,
        root: root_tx.clone(),
    };
    let reader = Reader {
        handle: handle.clone(),
        local: local.clone(),
        queue,
        inbox: reader_rx,
        processor: processor_tx.clone(),
        root: root_tx,
    };

    let processor_thread = spawn_strand(format!("{}-processor", handle.name()), move || {
        processor.run()
    });
    let reader_thread = spawn_strand(format!("{}-reader", handle.name()), move || reader.run());

    if processor_thread.is_some() && reader_thread.is_some() {
        loop {
            if reader_tx.send(ToReader::Resume).is_err() {
                break;
            }
            match root_rx.recv() {
                Ok(ToRoot::Continue) => {}
                Ok(ToRoot::Stop) | Err(_) => break,
            }
        }
    }

    let _ = processor_tx.send(ToProcessor::Stop);
    let _ = reader_tx.send(ToReader::Stop);
    let released = local.lock().release_strands();
    for t in [processor_thread, reader_thread].into_iter().flatten() {
        let _ = t.join();
    }
    handle.inner.lifecycle.terminate();
    tracing::debug!(thread = %handle.id(), released, "scheduler thread terminated");
}

struct Processor {
    handle: ThreadHandle,
    local: Arc<Mutex<LocalState>>,
    /// Own inbox sender, cloned into every fiber strand.
    this: Sender<ToProcessor>,
    inbox: Receiver<ToProcessor>,
    root: Sender<ToRoot>,
}

impl Processor {
    fn run(self) {
        loop {
            match self.inbox.recv() {
                Ok(ToProcessor::Command(cmd)) => {
                    tracing::trace!(thread = %self.handle.id(), command = cmd.name(), "processing");
                    if !self.process(cmd) {
                        let _ = self.root.send(ToRoot::Stop);
                        return;
                    }
                    if self.root.send(ToRoot::Continue).is_err() {
                        return;
                    }
                }
                Ok(ToProcessor::Resume) => {}
                Ok(ToProcessor::Stop) | Err(_) => return,
            }
        }
    }

    /// Returns false when the run loop must stop.
    fn process(&self, cmd: Command) -> bool {
        match cmd {
            Command::SpawnTask(task) => self.start_fiber(task),
            Command::ResultReady { fiber, waiters } => {
                tracing::trace!(fiber = %fiber, waiters = waiters.len(), "result ready");
                for strand in waiters {
                    if !self.switch_to(strand) {
                        return false;
                    }
                }
                true
            }
            Command::Kill { .. } => {
                tracing::debug!(thread = %self.handle.id(), from = %self.handle.lifecycle(), "killed");
                false
            }
            Command::StartShutdown { .. } => {
                if self.handle.inner.lifecycle.request_shutdown() {
                    tracing::debug!(thread = %self.handle.id(), "shutdown requested");
                }
                true
            }
        }
    }

    fn start_fiber(&self, task: Task) -> bool {
        // Work submitted from outside a fiber gets its own entry in the
        // active set; spawned work is already tracked under its Fiber.
        let owned = task.fiber().is_none().then(FiberId::next);
        let strand = StrandId::next();
        let (wake_tx, wake_rx) = strand::inbox::<Wake>();
        let cx = FiberContext {
            thread: self.handle.clone(),
            local: self.local.clone(),
            processor: self.this.clone(),
            strand,
            wake: wake_rx,
        };
        let name = format!("{}-fiber-{}", self.handle.name(), strand);
        if spawn_strand(name, move || run_fiber(cx, task, owned)).is_none() {
            return true;
        }
        {
            let mut local = self.local.lock();
            if let Some(id) = owned {
                local.add_fiber(id);
            }
            local.add_strand(strand, wake_tx);
        }
        self.switch_to(strand)
    }

    /// Resume `strand` and wait until it hands the baton back. A strand that
    /// already finished is skipped.
    fn switch_to(&self, strand: StrandId) -> bool {
        let wake = self.local.lock().wake_sender(strand);
        match wake {
            Some(tx) if tx.send(Wake::Resume).is_ok() => self.await_baton(),
            _ => true,
        }
    }

    fn await_baton(&self) -> bool {
        loop {
            match self.inbox.recv() {
                Ok(ToProcessor::Resume) => return true,
                Ok(ToProcessor::Command(cmd)) => {
                    tracing::warn!(command = cmd.name(), "command handed over while a fiber runs");
                }
                Ok(ToProcessor::Stop) | Err(_) => return false,
            }
        }
    }
}

fn run_fiber(cx: FiberContext, task: Task, owned: Option<FiberId>) {
    if !matches!(cx.wake.recv(), Ok(Wake::Resume)) {
        return;
    }
    if let Some(hook) = cx.thread.on_thread_start() {
        run_init_hook(hook);
    }
    let local = cx.local.clone();
    let processor = cx.processor.clone();
    let strand = cx.strand;
    match context::install(ThreadContext::cooperative(cx)) {
        Ok(_guard) => {
            if panic::catch_unwind(AssertUnwindSafe(|| task.run())).is_err() {
                tracing::error!(strand = %strand, "completion callback panicked");
            }
        }
        Err(e) => tracing::error!(strand = %strand, error = %e, "fiber context not installed"),
    }
    {
        let mut local = local.lock();
        if let Some(id) = owned {
            local.complete(id);
        }
        local.remove_strand(strand);
    }
    let _ = processor.send(ToProcessor::Resume);
}

struct Reader {
    handle: ThreadHandle,
    local: Arc<Mutex<LocalState>>,
    queue: Receiver<Command>,
    inbox: Receiver<ToReader>,
    processor: Sender<ToProcessor>,
    root: Sender<ToRoot>,
}

impl Reader {
    fn run(self) {
        while let Ok(ToReader::Resume) = self.inbox.recv() {
            if self.quiescent() {
                tracing::debug!(thread = %self.handle.id(), "quiescent after shutdown request");
                let _ = self.root.send(ToRoot::Stop);
                return;
            }
            let handed = match self.queue.recv() {
                Ok(cmd) => self.processor.send(ToProcessor::Command(cmd)).is_ok(),
                Err(_) => false,
            };
            if !handed {
                let _ = self.root.send(ToRoot::Stop);
                return;
            }
        }
    }

    fn quiescent(&self) -> bool {
        self.handle.inner.lifecycle.is_shutdown_requested() && self.local.lock().is_idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::fiber::Fiber;
    use std::sync::atomic::AtomicBool;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::default().set_native_workers(1)).unwrap()
    }

    #[test]
    fn local_state_tracks_active_set() {
        let active = Arc::new(AtomicUsize::new(0));
        let mut local = LocalState::new(active.clone());
        let id = FiberId::next();
        local.add_fiber(id);
        assert_eq!(active.load(Ordering::Acquire), 1);
        let s = StrandId::next();
        local.add_waiter(id, s);
        local.add_waiter(id, s);
        assert_eq!(local.complete(id), Some(vec![s]));
        assert_eq!(active.load(Ordering::Acquire), 0);
        assert!(local.is_idle());
        assert_eq!(local.complete(id), None);
    }

    #[test]
    fn block_on_runs_in_a_fiber() {
        let rt = runtime();
        let sched = rt.start_scheduler().unwrap();
        let id = sched.id();
        let seen = sched
            .block_on(move || Ok(context::current_thread()?.id()))
            .unwrap();
        assert_eq!(seen, id);
        sched.shutdown();
    }

    #[test]
    fn thread_names_carry_prefix() {
        let rt = Runtime::new(
            RuntimeConfig::default()
                .set_native_workers(1)
                .set_thread_name_prefix("t"),
        )
        .unwrap();
        let sched = rt.start_scheduler().unwrap();
        let name = sched
            .block_on(|| Ok(thread::current().name().map(str::to_string)))
            .unwrap()
            .unwrap();
        assert!(name.starts_with(&format!("t-sched-{}-fiber-", sched.id())));
    }

    #[test]
    fn block_on_from_own_fiber_is_refused() {
        let rt = runtime();
        let sched = Arc::new(rt.start_scheduler().unwrap());
        let inner = sched.clone();
        let err = sched
            .block_on(move || inner.block_on(|| Ok(1)).map_err(BoxError::from))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Usage(UsageError::BlockOnOwnThread)));
    }

    #[test]
    fn submit_completion_runs() {
        let rt = runtime();
        let sched = rt.start_scheduler().unwrap();
        let (tx, rx) = crossbeam_channel::bounded(1);
        sched
            .submit(|| Ok(21 * 2), move |r| tx.send(r.unwrap()).unwrap())
            .unwrap();
        assert_eq!(rx.recv().unwrap(), 42);
        sched.shutdown();
    }

    #[test]
    fn commands_after_termination_fail() {
        let rt = runtime();
        let sched = rt.start_scheduler().unwrap();
        let handle = sched.handle().clone();
        sched.shutdown();
        assert_eq!(handle.lifecycle(), Lifecycle::Terminated);
        assert!(matches!(handle.start_shutdown(), Err(BridgeError::Terminated(_))));
        assert!(matches!(handle.submit(|| Ok(()), |_| {}), Err(BridgeError::Terminated(_))));
    }

    #[test]
    fn hook_runs_on_start() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let rt = Runtime::builder()
            .config(RuntimeConfig::default().set_native_workers(1))
            .on_thread_start(move || flag.store(true, Ordering::SeqCst))
            .build()
            .unwrap();
        let sched = rt.start_scheduler().unwrap();
        sched.block_on(|| Ok(())).unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn hook_state_is_visible_to_fibers() {
        thread_local! {
            static PREPARED: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
        }
        let rt = Runtime::builder()
            .config(RuntimeConfig::default().set_native_workers(1))
            .on_thread_start(|| PREPARED.with(|p| p.set(true)))
            .build()
            .unwrap();
        let sched = rt.start_scheduler().unwrap();
        let (outer, inner) = sched
            .block_on(|| {
                let outer = PREPARED.with(|p| p.get());
                let inner = crate::spawn::spawn(|| Ok(PREPARED.with(|p| p.get())))?.join()?;
                Ok((outer, inner))
            })
            .unwrap();
        assert!(outer);
        assert!(inner);
    }

    #[test]
    fn panicking_hook_does_not_wedge_the_thread() {
        let rt = Runtime::builder()
            .config(RuntimeConfig::default().set_native_workers(1))
            .on_thread_start(|| panic!("hook failed"))
            .build()
            .unwrap();
        let sched = rt.start_scheduler().unwrap();
        let handle = sched.handle().clone();
        assert_eq!(sched.block_on(|| Ok(1)).unwrap(), 1);
        sched.shutdown();
        assert!(handle.wait_terminated(Duration::from_secs(5)));
    }

    #[test]
    fn submitted_work_counts_as_active() {
        let rt = runtime();
        let sched = rt.start_scheduler().unwrap();
        let handle = sched.handle().clone();
        let (started_tx, started_rx) = crossbeam_channel::bounded(1);
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(1);
        handle
            .submit(
                move || {
                    let _ = started_tx.send(());
                    let _ = gate_rx.recv();
                    Ok(())
                },
                |_| {},
            )
            .unwrap();
        started_rx.recv().unwrap();
        assert_eq!(handle.active_fibers(), 1);
        gate_tx.send(()).unwrap();
        sched.shutdown();
        assert_eq!(handle.active_fibers(), 0);
    }

    #[test]
    fn fiber_spawned_from_fiber_is_owned_by_caller_thread() {
        let rt = runtime();
        let sched = rt.start_scheduler().unwrap();
        let id = sched.id();
        let owner = sched
            .block_on(|| {
                let f: Fiber<u8> = crate::spawn::spawn(|| Ok(1))?;
                let owner = f.owner();
                f.join()?;
                Ok(owner)
            })
            .unwrap();
        assert_eq!(owner, id);
    }
}
