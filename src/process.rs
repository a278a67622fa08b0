//! Kernel-side record of one process

use crate::{
    errors::RuntimeError,
    protocol::{exit, ProcessInfo, Signal, VPid},
    stream::{ByteReader, ByteWriter},
};
use bytes::Bytes;
use futures_util::future::AbortHandle;
use std::{
    borrow::Cow,
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
    time::Duration,
};
use tokio::sync::{watch, Notify};

/// Where a process is in its lifecycle
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ProcessState {
    /// Execution context exists but hasn't finished its handshake
    Created,
    /// Handshake observed
    Ready,
    /// Handed back to whoever spawned it
    Running,
    /// Terminal; holds the exit status
    Exited(i32),
}

impl ProcessState {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProcessState::Exited(code) => Some(*code),
            _ => None,
        }
    }
}

/// Status of an exited process
///
/// Much like [std::process::ExitStatus]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ExitStatus {
    pub(crate) code: i32,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == exit::EXIT_OK
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    /// Signal that terminated the process, following the 128+signal convention
    pub fn signal(&self) -> Option<Signal> {
        if self.code > exit::EXIT_SIGNAL_BASE {
            Some(Signal((self.code - exit::EXIT_SIGNAL_BASE) as u32))
        } else {
            None
        }
    }
}

/// Output from an exited process
///
/// Much like [std::process::Output]
#[derive(Clone, Eq, PartialEq)]
pub struct Output {
    pub status: ExitStatus,
    pub stdout: Bytes,
    pub stderr: Bytes,
}

impl Output {
    /// Equivalent to `String::from_utf8_lossy(output.stdout)`
    pub fn stdout_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    /// Equivalent to `String::from_utf8_lossy(output.stderr)`
    pub fn stderr_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Output")
            .field("status", &self.status)
            .field("stdout", &self.stdout_str())
            .field("stderr", &self.stderr_str())
            .finish()
    }
}

/// Unwaited child exit statuses kept per process
const MAX_EXITED_CHILDREN: usize = 1024;

/// A process as the kernel sees it
///
/// Holds the host ends of the process's stdio until somebody takes them,
/// the write-once exit status, and weak links to the children it spawned.
pub struct ProcessHandle {
    info: ProcessInfo,
    parent: Weak<ProcessHandle>,
    state: Mutex<watch::Sender<ProcessState>>,
    watch: watch::Receiver<ProcessState>,
    stdin: Mutex<Option<ByteWriter>>,
    stdout: Mutex<Option<ByteReader>>,
    stderr: Mutex<Option<ByteReader>>,
    children: Mutex<Vec<Weak<ProcessHandle>>>,
    exited_children: Mutex<HashMap<VPid, i32>>,
    context: Mutex<Option<AbortHandle>>,
    inflight: AtomicUsize,
    idle: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.info.pid)
            .field("argv", &self.info.argv)
            .field("state", &self.state())
            .finish()
    }
}

/// Counts one syscall as in flight until dropped
pub(crate) struct InflightGuard<'a> {
    process: &'a ProcessHandle,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.process.inflight.fetch_sub(1, Ordering::SeqCst);
        self.process.idle.notify_waiters();
    }
}

impl ProcessHandle {
    pub(crate) fn new(
        info: ProcessInfo,
        parent: Weak<ProcessHandle>,
        stdin: ByteWriter,
        stdout: ByteReader,
        stderr: ByteReader,
    ) -> Self {
        let (state, watch) = watch::channel(ProcessState::Created);
        ProcessHandle {
            info,
            parent,
            state: Mutex::new(state),
            watch,
            stdin: Mutex::new(Some(stdin)),
            stdout: Mutex::new(Some(stdout)),
            stderr: Mutex::new(Some(stderr)),
            children: Mutex::new(Vec::new()),
            exited_children: Mutex::new(HashMap::new()),
            context: Mutex::new(None),
            inflight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    pub fn pid(&self) -> VPid {
        self.info.pid
    }

    pub fn ppid(&self) -> VPid {
        self.info.ppid
    }

    pub fn info(&self) -> &ProcessInfo {
        &self.info
    }

    pub fn state(&self) -> ProcessState {
        *self.watch.borrow()
    }

    /// Take the writer feeding this process's standard input
    pub fn take_stdin(&self) -> Option<ByteWriter> {
        lock(&self.stdin).take()
    }

    /// Take the reader draining this process's standard output
    pub fn take_stdout(&self) -> Option<ByteReader> {
        lock(&self.stdout).take()
    }

    /// Take the reader draining this process's standard error
    pub fn take_stderr(&self) -> Option<ByteReader> {
        lock(&self.stderr).take()
    }

    /// Live children, in the order they were spawned
    pub fn children(&self) -> Vec<Arc<ProcessHandle>> {
        lock(&self.children)
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Link a new child so it shares this process's fate
    ///
    /// Fails once this process has exited. `terminate` resolves the exit
    /// before it walks the children, so a child is either adopted in time
    /// to be killed or refused here.
    pub(crate) fn adopt(&self, child: &Arc<ProcessHandle>) -> bool {
        let mut children = lock(&self.children);
        if self.state().exit_code().is_some() {
            return false;
        }
        children.retain(|weak| weak.strong_count() > 0);
        children.push(Arc::downgrade(child));
        true
    }

    /// Keep a child's exit status until the parent collects it
    ///
    /// Only the most recent [MAX_EXITED_CHILDREN] statuses are kept, and
    /// none once this process has exited itself.
    fn record_exit(&self, child: VPid, code: i32) {
        if self.state().exit_code().is_some() {
            return;
        }
        let mut exited = lock(&self.exited_children);
        if exited.len() >= MAX_EXITED_CHILDREN {
            // pids only grow, so the smallest is the oldest
            if let Some(oldest) = exited.keys().min().copied() {
                exited.remove(&oldest);
            }
        }
        exited.insert(child, code);
    }

    /// Collect the status of a child that was spawned by this process
    ///
    /// Live children are waited for. Children that already exited are
    /// reaped once; a second wait on the same pid finds nothing.
    pub(crate) async fn wait_child(&self, pid: VPid) -> Option<i32> {
        let live = self.children().into_iter().find(|child| child.pid() == pid);
        if let Some(child) = live {
            child.wait().await;
        }
        // whoever takes the record reaps the child
        lock(&self.exited_children).remove(&pid)
    }

    pub(crate) fn set_context(&self, context: AbortHandle) {
        if self.state().exit_code().is_some() {
            context.abort();
        } else {
            *lock(&self.context) = Some(context);
        }
    }

    /// Move forward in the lifecycle; returns false if that would go backwards
    fn advance(&self, next: ProcessState) -> bool {
        let state = lock(&self.state);
        let current = *self.watch.borrow();
        let allowed = match (current, next) {
            (ProcessState::Exited(_), _) => false,
            (_, ProcessState::Exited(_)) => true,
            (ProcessState::Created, ProcessState::Ready) => true,
            (ProcessState::Ready, ProcessState::Running) => true,
            _ => false,
        };
        if allowed {
            if let (ProcessState::Exited(code), Some(parent)) = (next, self.parent.upgrade()) {
                // recorded before anyone can observe the exit
                parent.record_exit(self.info.pid, code);
            }
            // the handle keeps its own receiver, so this can't fail
            let _ = state.send(next);
        }
        allowed
    }

    pub(crate) fn mark_ready(&self) -> bool {
        self.advance(ProcessState::Ready)
    }

    pub(crate) fn mark_running(&self) -> bool {
        self.advance(ProcessState::Running)
    }

    /// Wait for the readiness handshake, or for the exit code if the
    /// process never got that far
    pub async fn wait_ready(&self) -> Result<(), i32> {
        let mut watch = self.watch.clone();
        loop {
            let state = *watch.borrow();
            match state {
                ProcessState::Created => {}
                ProcessState::Exited(code) => return Err(code),
                _ => return Ok(()),
            }
            if watch.changed().await.is_err() {
                return Err(exit::EXIT_FAULT);
            }
        }
    }

    /// Wait for the process to exit, and return its exit status
    pub async fn wait(&self) -> ExitStatus {
        let mut watch = self.watch.clone();
        loop {
            let state = *watch.borrow();
            if let Some(code) = state.exit_code() {
                return ExitStatus { code };
            }
            if watch.changed().await.is_err() {
                return ExitStatus {
                    code: exit::EXIT_FAULT,
                };
            }
        }
    }

    /// Capture the process's output and wait for it to finish
    ///
    /// This captures stderr and stdout if they have not been taken from the
    /// handle. If stdin has not been taken, it is closed.
    pub async fn output(&self) -> Result<Output, RuntimeError> {
        drop(self.take_stdin());
        let capture = |reader: Option<ByteReader>| {
            tokio::spawn(async move {
                match reader {
                    Some(mut reader) => reader.read_to_end().await,
                    None => Ok(Bytes::new()),
                }
            })
        };
        let stdout = capture(self.take_stdout());
        let stderr = capture(self.take_stderr());
        log::trace!("output wait starting");
        let status = self.wait().await;
        let stdout = stdout.await??;
        let stderr = stderr.await??;
        Ok(Output {
            status,
            stdout,
            stderr,
        })
    }

    /// Terminate the process as if by `signal`
    ///
    /// Returns false if it had already exited.
    pub fn kill(&self, signal: Signal) -> bool {
        self.terminate(exit::killed(signal))
    }

    /// Resolve the exit status right away and tear the execution context down
    ///
    /// The context's own stream ends go away with it. Children are killed
    /// in turn, which cascades down the whole spawn tree.
    pub(crate) fn terminate(&self, code: i32) -> bool {
        if !self.advance(ProcessState::Exited(code)) {
            return false;
        }
        log::debug!("pid {} exited with status {}", self.info.pid, code);
        if let Some(context) = lock(&self.context).take() {
            context.abort();
        }
        // nothing can read from an exited process
        drop(self.take_stdin());
        // nor wait for its children
        lock(&self.exited_children).clear();
        for child in self.children() {
            child.kill(Signal::SIGKILL);
        }
        self.idle.notify_waiters();
        true
    }

    pub(crate) fn begin_syscall(&self) -> InflightGuard<'_> {
        self.inflight.fetch_add(1, Ordering::SeqCst);
        InflightGuard { process: self }
    }

    /// Exit with `code` once other in-flight syscalls have finished
    ///
    /// `own` is how many in-flight syscalls belong to the caller itself. If
    /// the rest are still pending after `grace`, the process is terminated
    /// with a fault status instead.
    pub(crate) async fn settle(&self, code: i32, grace: Duration, own: usize) {
        let drained = tokio::time::timeout(grace, async {
            loop {
                let idle = self.idle.notified();
                if self.inflight.load(Ordering::SeqCst) <= own || self.state().exit_code().is_some() {
                    return;
                }
                idle.await;
            }
        })
        .await;
        match drained {
            Ok(()) => self.terminate(code),
            Err(_) => {
                log::warn!(
                    "pid {} still had syscalls pending after {:?}",
                    self.info.pid,
                    grace
                );
                self.terminate(exit::EXIT_FAULT)
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::pipe;
    use std::collections::BTreeMap;
    use tokio::runtime::Runtime;

    fn handle(pid: u32) -> Arc<ProcessHandle> {
        child_of(None, pid)
    }

    fn child_of(parent: Option<&Arc<ProcessHandle>>, pid: u32) -> Arc<ProcessHandle> {
        let (stdin, _) = pipe(16);
        let (_, stdout) = pipe(16);
        let (_, stderr) = pipe(16);
        Arc::new(ProcessHandle::new(
            ProcessInfo {
                pid: VPid(pid),
                ppid: parent.map_or(VPid(0), |p| p.pid()),
                uid: 0,
                gid: 0,
                cwd: "/".to_string(),
                env: BTreeMap::new(),
                argv: vec!["test".to_string()],
                entrypoint: "memory:///test.bin".to_string(),
            },
            parent.map_or_else(Weak::new, Arc::downgrade),
            stdin,
            stdout,
            stderr,
        ))
    }

    #[test]
    fn lifecycle_only_moves_forward() {
        let process = handle(1);
        assert_eq!(process.state(), ProcessState::Created);
        assert!(!process.mark_running());
        assert!(process.mark_ready());
        assert!(process.mark_running());
        assert!(!process.mark_ready());
        assert!(process.terminate(3));
        assert!(!process.terminate(4));
        assert!(!process.kill(Signal::SIGTERM));
        assert_eq!(process.state(), ProcessState::Exited(3));
        assert!(process.take_stdin().is_none());
    }

    #[test]
    fn kill_cascades_to_descendants() {
        Runtime::new().unwrap().block_on(async {
            let parent = handle(1);
            let child = handle(2);
            let grandchild = handle(3);
            parent.adopt(&child);
            child.adopt(&grandchild);
            assert!(parent.kill(Signal::SIGTERM));
            assert_eq!(parent.wait().await.code(), 143);
            assert_eq!(child.wait().await.code(), 137);
            assert_eq!(grandchild.wait().await.signal(), Some(Signal::SIGKILL));
        });
    }

    #[test]
    fn exited_parents_refuse_children() {
        let parent = handle(1);
        let early = child_of(Some(&parent), 2);
        assert!(parent.adopt(&early));
        assert!(parent.kill(Signal::SIGTERM));
        assert_eq!(early.state(), ProcessState::Exited(137));

        let late = child_of(Some(&parent), 3);
        assert!(!parent.adopt(&late));
        assert!(parent.children().iter().all(|child| child.pid() != VPid(3)));
    }

    #[test]
    fn exit_records_are_bounded() {
        Runtime::new().unwrap().block_on(async {
            let parent = handle(1);
            let count = MAX_EXITED_CHILDREN as u32 + 5;
            for pid in 2..2 + count {
                child_of(Some(&parent), pid).terminate(0);
            }
            assert_eq!(lock(&parent.exited_children).len(), MAX_EXITED_CHILDREN);
            // the oldest records went first
            assert_eq!(parent.wait_child(VPid(2)).await, None);
            assert_eq!(parent.wait_child(VPid(count + 1)).await, Some(0));

            child_of(Some(&parent), count + 2).terminate(0);
            parent.terminate(0);
            assert!(lock(&parent.exited_children).is_empty());
            child_of(Some(&parent), count + 3).terminate(0);
            assert!(lock(&parent.exited_children).is_empty());
        });
    }

    #[test]
    fn children_are_reaped_once() {
        Runtime::new().unwrap().block_on(async {
            let parent = handle(1);
            let live = child_of(Some(&parent), 2);
            let exited = child_of(Some(&parent), 3);
            parent.adopt(&live);
            parent.adopt(&exited);
            exited.terminate(1);
            drop(exited);

            let waiter = {
                let parent = parent.clone();
                tokio::spawn(async move { parent.wait_child(VPid(2)).await })
            };
            live.terminate(7);
            assert_eq!(waiter.await.unwrap(), Some(7));
            assert_eq!(parent.wait_child(VPid(2)).await, None);

            assert_eq!(parent.wait_child(VPid(3)).await, Some(1));
            assert_eq!(parent.wait_child(VPid(3)).await, None);
            assert_eq!(parent.wait_child(VPid(9)).await, None);
        });
    }

    #[test]
    fn settle_waits_for_syscalls() {
        Runtime::new().unwrap().block_on(async {
            let process = handle(1);
            let guard = process.begin_syscall();
            let settle = {
                let process = process.clone();
                tokio::spawn(async move { process.settle(0, Duration::from_secs(5), 0).await })
            };
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert_eq!(process.state(), ProcessState::Created);
            drop(guard);
            settle.await.unwrap();
            assert_eq!(process.wait().await.code(), 0);

            let stuck = handle(2);
            let _guard = stuck.begin_syscall();
            stuck.settle(0, Duration::from_millis(20), 0).await;
            assert_eq!(stuck.wait().await.code(), exit::EXIT_FAULT);
        });
    }
}
