//! The kernel: process table, spawning, and the virtual filesystem every
//! process shares

mod builder;

pub use self::builder::{KernelBuilder, PathSearch};

use self::builder::Settings;
use crate::{
    errors::{RuntimeError, SpawnError, VFSError},
    filesystem::{Driver, OverlayFS, VPath},
    ipcserver::SyscallService,
    local::{self, Bootstrap},
    pipeline::Spawner,
    process::ProcessHandle,
    program::ContextFactory,
    protocol::{exit, ErrorKind, Failure, ProcessInfo, Signal, SpawnRequest, VPid},
    rpc,
    stream::pipe,
    transfer::Spawned,
};
use async_trait::async_trait;
use futures_util::future::{AbortHandle, Abortable};
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
    time::Duration,
};

/// Owner of every process and the filesystem they share
///
/// Pids are handed out in increasing order starting at 1, and are never
/// reused while the kernel lives. A process is in the table from the moment
/// its execution context exists until its exit status resolves.
pub struct Kernel {
    vfs: Arc<OverlayFS>,
    factory: Arc<dyn ContextFactory>,
    settings: Settings,
    next_pid: AtomicU32,
    table: Mutex<HashMap<VPid, Arc<ProcessHandle>>>,
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("mounts", &self.vfs.mounts())
            .field("processes", &self.processes())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Kernel {
    /// Start a [KernelBuilder]
    pub fn builder() -> KernelBuilder {
        KernelBuilder::new()
    }

    pub(crate) fn new(
        vfs: Arc<OverlayFS>,
        factory: Arc<dyn ContextFactory>,
        settings: Settings,
    ) -> Self {
        Kernel {
            vfs,
            factory,
            settings,
            next_pid: AtomicU32::new(1),
            table: Mutex::new(HashMap::new()),
        }
    }

    /// The overlay all processes see, for mounting or direct access
    pub fn vfs(&self) -> &Arc<OverlayFS> {
        &self.vfs
    }

    pub fn default_extension(&self) -> &str {
        &self.settings.default_extension
    }

    pub(crate) fn grace_period(&self) -> Duration {
        self.settings.grace_period
    }

    /// Mount another driver while the kernel is running
    pub fn mount<P: Into<VPath>>(&self, path: P, driver: Arc<dyn Driver>) -> Result<(), VFSError> {
        self.vfs.mount(&path.into(), driver)
    }

    /// Live processes, sorted by pid
    pub fn processes(&self) -> Vec<Arc<ProcessHandle>> {
        let mut processes: Vec<_> = lock(&self.table).values().cloned().collect();
        processes.sort_by_key(|process| process.pid());
        processes
    }

    pub fn process(&self, pid: VPid) -> Option<Arc<ProcessHandle>> {
        lock(&self.table).get(&pid).cloned()
    }

    /// Terminate a live process as if by `signal`
    pub fn kill(&self, pid: VPid, signal: Signal) -> Result<(), RuntimeError> {
        let process = self.process(pid).ok_or(RuntimeError::NoSuchProcess(pid))?;
        log::info!("kill({}, {:?})", pid, signal);
        process.kill(signal);
        Ok(())
    }

    /// Spawn a process on behalf of the host
    ///
    /// Host processes have ppid 0 and nobody else's lifetime bounds theirs.
    pub async fn spawn(self: &Arc<Self>, request: SpawnRequest) -> Result<Arc<ProcessHandle>, SpawnError> {
        self.spawn_child(None, request).await
    }

    /// Spawn a process as a child of `parent`, or of the host if there is none
    ///
    /// Returns once the new process has finished its readiness handshake.
    pub(crate) async fn spawn_child(
        self: &Arc<Self>,
        parent: Option<&Arc<ProcessHandle>>,
        mut request: SpawnRequest,
    ) -> Result<Arc<ProcessHandle>, SpawnError> {
        if request.argv.is_empty() {
            request.argv.push(request.entrypoint.clone());
        }
        let path = self.resolve_entrypoint(&request).await?;
        let locator = self.vfs.resolve_uri(&path).await?;
        let image = self.vfs.read_file(&path, 0, None).await?.read_to_end().await.map_err(VFSError::from)?;
        let program = self.factory.load(&locator, image).await?;

        let pid = VPid(self.next_pid.fetch_add(1, Ordering::SeqCst));
        let (uid, gid) = parent.map_or((0, 0), |p| (p.info().uid, p.info().gid));
        let info = ProcessInfo {
            pid,
            ppid: parent.map_or(VPid(0), |p| p.pid()),
            uid,
            gid,
            cwd: request.cwd,
            env: request.env,
            argv: request.argv,
            entrypoint: locator,
        };
        log::info!("spawn {} {:?} from {}", pid, info.argv, info.entrypoint);

        let hwm = self.settings.high_water_mark;
        let (stdin_writer, stdin_reader) = pipe(hwm);
        let (stdout_writer, stdout_reader) = pipe(hwm);
        let (stderr_writer, stderr_reader) = pipe(hwm);
        let handle = Arc::new(ProcessHandle::new(
            info.clone(),
            parent.map_or_else(Weak::new, Arc::downgrade),
            stdin_writer,
            stdout_reader,
            stderr_reader,
        ));
        if let Some(parent) = parent {
            if !parent.adopt(&handle) {
                log::debug!("pid {} exited before its child {} could start", parent.pid(), pid);
                return Err(SpawnError::Crashed(exit::killed(Signal::SIGKILL)));
            }
        }
        lock(&self.table).insert(pid, handle.clone());

        let (kernel_port, process_port) = rpc::channel();
        let service = Arc::new(SyscallService::new(Arc::downgrade(self), handle.clone()));
        rpc::expose(kernel_port, service);

        let bootstrap = Bootstrap {
            info,
            stdin: stdin_reader,
            stdout: stdout_writer,
            stderr: stderr_writer,
        };
        let (abort, registration) = AbortHandle::new_pair();
        let context = tokio::spawn(Abortable::new(
            local::run(program, process_port, bootstrap),
            registration,
        ));
        handle.set_context(abort);
        self.supervise(handle.clone(), context);

        match handle.wait_ready().await {
            Ok(()) => {
                handle.mark_running();
                Ok(handle)
            }
            Err(code) => Err(SpawnError::Crashed(code)),
        }
    }

    /// Follow an execution context until the process it belongs to exits
    fn supervise(
        self: &Arc<Self>,
        handle: Arc<ProcessHandle>,
        context: tokio::task::JoinHandle<Result<i32, futures_util::future::Aborted>>,
    ) {
        let kernel = Arc::downgrade(self);
        let grace = self.settings.grace_period;
        tokio::spawn(async move {
            let code = match context.await {
                Ok(Ok(code)) => code,
                Ok(Err(_aborted)) => exit::EXIT_FAULT,
                Err(err) => {
                    log::error!("pid {} context failed, {}", handle.pid(), err);
                    exit::EXIT_FAULT
                }
            };
            handle.settle(code, grace, 0).await;
            let status = handle.wait().await;
            if let Some(kernel) = kernel.upgrade() {
                lock(&kernel.table).remove(&handle.pid());
            }
            log::debug!("pid {} reaped with status {}", handle.pid(), status.code());
        });
    }

    /// Find the file a spawn request refers to
    ///
    /// Entrypoints containing `/` are paths relative to the request's cwd.
    /// Bare names are searched for in each `PATH` directory, with the default
    /// extension appended if the name has none.
    pub async fn resolve_entrypoint(&self, request: &SpawnRequest) -> Result<VPath, SpawnError> {
        let name = request.entrypoint.as_str();
        if name.is_empty() {
            return Err(SpawnError::NotFound(String::new()));
        }
        if name.contains('/') {
            let path = VPath::resolve(&request.cwd, name);
            return match self.vfs.access(&path).await {
                Ok(true) => Ok(path),
                _ => Err(SpawnError::NotFound(name.to_string())),
            };
        }
        let file_name = if name.contains('.') {
            name.to_string()
        } else {
            format!("{}.{}", name, self.settings.default_extension)
        };
        let mut dirs: Vec<&str> = request
            .env
            .get("PATH")
            .map(|path| path.split(':').filter(|dir| !dir.is_empty()).collect())
            .unwrap_or_default();
        if self.settings.path_search == PathSearch::ReverseOrder {
            dirs.reverse();
        }
        for dir in dirs {
            let candidate = VPath::resolve(&request.cwd, dir).join(&file_name);
            log::trace!("trying {}", candidate);
            if let Ok(true) = self.vfs.access(&candidate).await {
                return Ok(candidate);
            }
        }
        Err(SpawnError::NotFound(name.to_string()))
    }
}

/// [Spawner] for commands the host runs directly
///
/// Keeps each spawned handle until it's waited for, so a status can be
/// collected even after the process has left the kernel's table.
pub struct HostSpawner {
    kernel: Arc<Kernel>,
    spawned: Mutex<HashMap<VPid, Arc<ProcessHandle>>>,
}

impl HostSpawner {
    pub fn new(kernel: Arc<Kernel>) -> Self {
        HostSpawner {
            kernel,
            spawned: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Spawner for HostSpawner {
    async fn spawn(
        &self,
        entrypoint: &str,
        argv: Vec<String>,
        cwd: &str,
        env: BTreeMap<String, String>,
    ) -> Result<Spawned, Failure> {
        let mut request = SpawnRequest::new(entrypoint).cwd(cwd).envs(env);
        request.argv = argv;
        let handle = self.kernel.spawn(request).await?;
        let missing = || Failure::new(ErrorKind::Transport, "stdio already taken");
        let spawned = Spawned {
            pid: handle.pid(),
            stdin: handle.take_stdin().ok_or_else(missing)?,
            stdout: handle.take_stdout().ok_or_else(missing)?,
            stderr: handle.take_stderr().ok_or_else(missing)?,
        };
        lock(&self.spawned).insert(handle.pid(), handle);
        Ok(spawned)
    }

    async fn wait(&self, pid: VPid) -> Result<i32, Failure> {
        let handle = lock(&self.spawned).remove(&pid);
        let handle = handle.ok_or(RuntimeError::NoSuchProcess(pid))?;
        Ok(handle.wait().await.code())
    }

    async fn kill(&self, pid: VPid, signal: Signal) -> Result<(), Failure> {
        Ok(self.kernel.kill(pid, signal)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        filesystem::MemoryFS,
        program::{FnProgram, ProgramRegistry},
        protocol::WriteMode,
    };
    use tokio::runtime::Runtime;

    async fn kernel(order: PathSearch) -> Arc<Kernel> {
        let registry = ProgramRegistry::new()
            .with("first", FnProgram::new(|_| async { Ok(1) }))
            .with("second", FnProgram::new(|_| async { Ok(2) }))
            .with("hang", FnProgram::new(|_| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(0)
            }));
        let kernel = Kernel::builder()
            .path_search(order)
            .context_factory(Arc::new(registry))
            .build()
            .unwrap();
        let fs = kernel.vfs().clone();
        for (path, target) in &[
            ("/a/tool.bin", "first"),
            ("/b/tool.bin", "second"),
            ("/a/hang.bin", "hang"),
        ] {
            let mut writer = fs
                .write_file(&VPath::parse(path), WriteMode::Override, true)
                .await
                .unwrap();
            writer.write(ProgramRegistry::stub(target)).await.unwrap();
            writer.close();
        }
        kernel
    }

    fn request(name: &str) -> SpawnRequest {
        SpawnRequest::new(name).env("PATH", "/a::/b")
    }

    #[test]
    fn path_search_order() {
        Runtime::new().unwrap().block_on(async {
            let forward = kernel(PathSearch::DeclarationOrder).await;
            let reverse = kernel(PathSearch::ReverseOrder).await;
            assert_eq!(
                forward.resolve_entrypoint(&request("tool")).await.unwrap().to_string(),
                "/a/tool.bin"
            );
            assert_eq!(
                reverse.resolve_entrypoint(&request("tool")).await.unwrap().to_string(),
                "/b/tool.bin"
            );
            assert_eq!(
                forward.resolve_entrypoint(&request("/b/tool.bin")).await.unwrap().to_string(),
                "/b/tool.bin"
            );
            assert_eq!(
                forward.resolve_entrypoint(&request("missing")).await.err(),
                Some(SpawnError::NotFound("missing".to_string()))
            );
        });
    }

    #[test]
    fn pids_increase_and_exits_leave_the_table() {
        Runtime::new().unwrap().block_on(async {
            let kernel = kernel(PathSearch::DeclarationOrder).await;
            let first = kernel.spawn(request("tool")).await.unwrap();
            let second = kernel.spawn(request("tool")).await.unwrap();
            assert_eq!(first.pid(), VPid(1));
            assert_eq!(second.pid(), VPid(2));
            assert_eq!(first.ppid(), VPid(0));
            assert_eq!(first.wait().await.code(), 1);
            assert_eq!(second.output().await.unwrap().status.code(), 1);
            while !kernel.processes().is_empty() {
                tokio::task::yield_now().await;
            }
            assert!(kernel.kill(VPid(1), Signal::SIGTERM).is_err());
        });
    }

    #[test]
    fn kill_resolves_status() {
        Runtime::new().unwrap().block_on(async {
            let kernel = kernel(PathSearch::DeclarationOrder).await;
            let hang = kernel.spawn(request("hang")).await.unwrap();
            assert_eq!(kernel.processes().len(), 1);
            kernel.kill(hang.pid(), Signal::SIGINT).unwrap();
            assert_eq!(hang.wait().await.code(), 130);
        });
    }

    #[test]
    fn unloadable_images_fail_to_spawn() {
        Runtime::new().unwrap().block_on(async {
            let kernel = Kernel::builder()
                .mount("/data", Arc::new(MemoryFS::new()))
                .build()
                .unwrap();
            let mut writer = kernel
                .vfs()
                .write_file(&VPath::parse("/data/text"), WriteMode::Override, true)
                .await
                .unwrap();
            writer.write(&b"just words"[..]).await.unwrap();
            writer.close();
            let err = kernel.spawn(SpawnRequest::new("/data/text")).await.unwrap_err();
            assert_eq!(err.exit_code(), exit::EXIT_NOT_EXECUTABLE);
        });
    }
}
