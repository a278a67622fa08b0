//! Process-side handle: descriptor table and syscall bindings
//!
//! A [LocalProcess] is what a hosted [Program] sees. It owns the process's
//! stdio ends and everything it opened, and reaches the kernel only through
//! its syscall channel.

use crate::{
    errors::{IPCError, ProcessError},
    filesystem::VPath,
    pipeline::Spawner,
    program::Program,
    protocol::{
        exit, Call, DirEntry, ErrorKind, Failure, ProcessInfo, Signal, SyscallName, VPid, WriteMode,
    },
    rpc::{Client, Port},
    stream::{ByteReader, ByteWriter, EntryStream},
    transfer::{Envelope, Spawned},
};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{FutureExt, StreamExt};
use serde_json::{json, Value};
use std::{
    collections::{BTreeMap, HashMap},
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard},
};

/// Descriptor of standard input
pub const STDIN: u32 = 0;
/// Descriptor of standard output
pub const STDOUT: u32 = 1;
/// Descriptor of standard error
pub const STDERR: u32 = 2;

/// Everything a new execution context starts with
pub struct Bootstrap {
    pub info: ProcessInfo,
    pub stdin: ByteReader,
    pub stdout: ByteWriter,
    pub stderr: ByteWriter,
}

/// One open resource in the descriptor table
struct Descriptor {
    uri: String,
    reader: Option<ByteReader>,
    writer: Option<ByteWriter>,
    entries: Option<EntryStream>,
}

impl Descriptor {
    fn new(uri: String) -> Self {
        Descriptor {
            uri,
            reader: None,
            writer: None,
            entries: None,
        }
    }

    fn reader(uri: String, reader: ByteReader) -> Self {
        Descriptor {
            reader: Some(reader),
            ..Descriptor::new(uri)
        }
    }

    fn writer(uri: String, writer: ByteWriter) -> Self {
        Descriptor {
            writer: Some(writer),
            ..Descriptor::new(uri)
        }
    }

    fn entries(uri: String, entries: EntryStream) -> Self {
        Descriptor {
            entries: Some(entries),
            ..Descriptor::new(uri)
        }
    }
}

/// Shared so a read in progress keeps its resource alive after `close()`
type SharedDescriptor = Arc<tokio::sync::Mutex<Descriptor>>;

struct FdTable {
    next: u32,
    open: HashMap<u32, SharedDescriptor>,
}

impl FdTable {
    fn insert(&mut self, descriptor: Descriptor) -> u32 {
        let fd = self.next;
        self.next += 1;
        self.open
            .insert(fd, Arc::new(tokio::sync::Mutex::new(descriptor)));
        fd
    }
}

struct Inner {
    info: ProcessInfo,
    cwd: Mutex<String>,
    env: Mutex<BTreeMap<String, String>>,
    syscalls: Client<Call, Envelope, Failure>,
    fds: Mutex<FdTable>,
}

/// Handle a hosted program uses to talk to the kernel
///
/// Cheap to clone; all clones share one descriptor table.
#[derive(Clone)]
pub struct LocalProcess {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Options for [LocalProcess::spawn()]; anything left unset is inherited
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    argv: Vec<String>,
    cwd: Option<String>,
    env: Option<BTreeMap<String, String>>,
}

impl SpawnOptions {
    pub fn new() -> Self {
        SpawnOptions::default()
    }

    /// Full argv, including argv\[0\]; defaults to `[entrypoint]`
    pub fn argv<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv = argv.into_iter().map(Into::into).collect();
        self
    }

    pub fn cwd<S: Into<String>>(mut self, cwd: S) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Replace the whole environment rather than inheriting it
    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }
}

impl LocalProcess {
    /// Connect to the kernel through `port`
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach<P: Port>(port: P, bootstrap: Bootstrap) -> Self {
        let Bootstrap {
            info,
            stdin,
            stdout,
            stderr,
        } = bootstrap;
        let mut open = HashMap::new();
        open.insert(STDIN, Descriptor::reader("stdin:".to_string(), stdin));
        open.insert(STDOUT, Descriptor::writer("stdout:".to_string(), stdout));
        open.insert(STDERR, Descriptor::writer("stderr:".to_string(), stderr));
        let open = open
            .into_iter()
            .map(|(fd, descriptor)| (fd, Arc::new(tokio::sync::Mutex::new(descriptor))))
            .collect();
        LocalProcess {
            inner: Arc::new(Inner {
                cwd: Mutex::new(info.cwd.clone()),
                env: Mutex::new(info.env.clone()),
                info,
                syscalls: Client::attach(port),
                fds: Mutex::new(FdTable {
                    next: STDERR + 1,
                    open,
                }),
            }),
        }
    }

    pub fn pid(&self) -> VPid {
        self.inner.info.pid
    }

    pub fn ppid(&self) -> VPid {
        self.inner.info.ppid
    }

    pub fn uid(&self) -> u32 {
        self.inner.info.uid
    }

    pub fn gid(&self) -> u32 {
        self.inner.info.gid
    }

    pub fn argv(&self) -> &[String] {
        &self.inner.info.argv
    }

    /// Name this program was started as, for messages
    pub fn name(&self) -> &str {
        self.inner
            .info
            .argv
            .first()
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// Locator of the program image this process is running
    pub fn entrypoint(&self) -> &str {
        &self.inner.info.entrypoint
    }

    /// Current identity and environment
    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            cwd: self.cwd(),
            env: self.env(),
            ..self.inner.info.clone()
        }
    }

    pub fn cwd(&self) -> String {
        lock(&self.inner.cwd).clone()
    }

    /// Change the working directory, resolving `path` against the current one
    pub fn set_cwd(&self, path: &str) {
        let resolved = self.resolve(path);
        *lock(&self.inner.cwd) = resolved;
    }

    pub fn getenv(&self, key: &str) -> Option<String> {
        lock(&self.inner.env).get(key).cloned()
    }

    pub fn setenv<K: Into<String>, V: Into<String>>(&self, key: K, value: V) {
        lock(&self.inner.env).insert(key.into(), value.into());
    }

    pub fn unsetenv(&self, key: &str) {
        lock(&self.inner.env).remove(key);
    }

    pub fn env(&self) -> BTreeMap<String, String> {
        lock(&self.inner.env).clone()
    }

    /// Absolute normalized form of `path`, relative to the working directory
    pub fn resolve(&self, path: &str) -> String {
        VPath::resolve(&self.cwd(), path).to_string()
    }

    /// Issue a raw syscall
    pub async fn syscall(&self, call: Call) -> Result<Envelope, ProcessError> {
        Ok(self.inner.syscalls.call(call).await?)
    }

    async fn call(&self, name: SyscallName, args: Vec<Value>) -> Result<Envelope, ProcessError> {
        self.syscall(Call::new(name, args)).await
    }

    /// Complete the readiness handshake with the kernel
    pub(crate) async fn ready(&self) -> Result<(), ProcessError> {
        self.call(SyscallName::Ready, vec![]).await?;
        Ok(())
    }

    pub async fn access(&self, path: &str) -> Result<bool, ProcessError> {
        let path = self.resolve(path);
        Ok(self.call(SyscallName::Access, vec![json!(path)]).await?.unpack()?)
    }

    pub async fn resolve_uri(&self, path: &str) -> Result<String, ProcessError> {
        let path = self.resolve(path);
        Ok(self.call(SyscallName::ResolveUri, vec![json!(path)]).await?.unpack()?)
    }

    pub async fn read_dir(&self, path: &str) -> Result<EntryStream, ProcessError> {
        let path = self.resolve(path);
        Ok(self.call(SyscallName::ReadDir, vec![json!(path)]).await?.unpack()?)
    }

    pub async fn read_file(
        &self,
        path: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<ByteReader, ProcessError> {
        let path = self.resolve(path);
        let args = vec![json!(path), json!(offset), json!(length)];
        Ok(self.call(SyscallName::ReadFile, args).await?.unpack()?)
    }

    pub async fn write_file(
        &self,
        path: &str,
        mode: WriteMode,
        create: bool,
    ) -> Result<ByteWriter, ProcessError> {
        let path = self.resolve(path);
        let args = vec![json!(path), json!(mode), json!(create)];
        Ok(self.call(SyscallName::WriteFile, args).await?.unpack()?)
    }

    /// Remove a file, or a directory tree if `recursive`
    pub async fn unlink(&self, path: &str, recursive: bool) -> Result<(), ProcessError> {
        let path = self.resolve(path);
        self.call(SyscallName::DeleteNode, vec![json!(path), json!(recursive)])
            .await?;
        Ok(())
    }

    /// Start a child process
    pub async fn spawn(&self, entrypoint: &str, options: SpawnOptions) -> Result<Spawned, ProcessError> {
        let argv = if options.argv.is_empty() {
            vec![entrypoint.to_string()]
        } else {
            options.argv
        };
        let cwd = options.cwd.map(|cwd| self.resolve(&cwd)).unwrap_or_else(|| self.cwd());
        let env = options.env.unwrap_or_else(|| self.env());
        let args = vec![json!(entrypoint), json!(argv), json!(cwd), json!(env)];
        Ok(self.call(SyscallName::Spawn, args).await?.unpack()?)
    }

    /// Send `signal` to another process, or to this one if `pid` is `None`
    pub async fn kill(&self, signal: Signal, pid: Option<VPid>) -> Result<(), ProcessError> {
        self.call(SyscallName::Kill, vec![json!(signal), json!(pid)])
            .await?;
        Ok(())
    }

    /// Wait for a child to exit, returning its exit status
    pub async fn wait(&self, pid: VPid) -> Result<i32, ProcessError> {
        Ok(self.call(SyscallName::Wait, vec![json!(pid)]).await?.unpack()?)
    }

    /// Ask the kernel to end this process
    ///
    /// Doesn't wait for a reply; the kernel tears the process down.
    pub fn exit(&self, code: i32) -> Result<(), ProcessError> {
        let call = Call::new(SyscallName::Exit, vec![json!(code)]);
        Ok(self.inner.syscalls.post(call)?)
    }

    fn descriptor(&self, fd: u32) -> Result<SharedDescriptor, ProcessError> {
        lock(&self.inner.fds)
            .open
            .get(&fd)
            .cloned()
            .ok_or(ProcessError::BadDescriptor(fd))
    }

    fn insert(&self, descriptor: Descriptor) -> u32 {
        lock(&self.inner.fds).insert(descriptor)
    }

    /// Open a file for reading, returning its descriptor
    pub async fn open_read(&self, path: &str) -> Result<u32, ProcessError> {
        let reader = self.read_file(path, 0, None).await?;
        let uri = format!("file://{}", self.resolve(path));
        Ok(self.insert(Descriptor::reader(uri, reader)))
    }

    /// Open a file for writing, returning its descriptor
    pub async fn open_write(&self, path: &str, mode: WriteMode, create: bool) -> Result<u32, ProcessError> {
        let writer = self.write_file(path, mode, create).await?;
        let uri = format!("file://{}", self.resolve(path));
        Ok(self.insert(Descriptor::writer(uri, writer)))
    }

    /// Open a directory listing, returning its descriptor
    pub async fn open_dir(&self, path: &str) -> Result<u32, ProcessError> {
        let entries = self.read_dir(path).await?;
        let uri = format!("dir://{}", self.resolve(path));
        Ok(self.insert(Descriptor::entries(uri, entries)))
    }

    /// Next chunk from a readable descriptor, or `None` at end of stream
    pub async fn read(&self, fd: u32) -> Result<Option<Bytes>, ProcessError> {
        let descriptor = self.descriptor(fd)?;
        let mut descriptor = descriptor.lock().await;
        let reader = descriptor
            .reader
            .as_mut()
            .ok_or(ProcessError::BadDescriptor(fd))?;
        Ok(reader.read().await?)
    }

    /// Write everything in `data` to a writable descriptor
    pub async fn write<B: AsRef<[u8]>>(&self, fd: u32, data: B) -> Result<(), ProcessError> {
        let descriptor = self.descriptor(fd)?;
        let mut descriptor = descriptor.lock().await;
        let writer = descriptor
            .writer
            .as_mut()
            .ok_or(ProcessError::BadDescriptor(fd))?;
        Ok(writer.write_all(data.as_ref()).await?)
    }

    /// Next entry from a directory descriptor, or `None` when the listing is done
    pub async fn next_entry(&self, fd: u32) -> Result<Option<DirEntry>, ProcessError> {
        let descriptor = self.descriptor(fd)?;
        let mut descriptor = descriptor.lock().await;
        let entries = descriptor
            .entries
            .as_mut()
            .ok_or(ProcessError::BadDescriptor(fd))?;
        match entries.next().await {
            None => Ok(None),
            Some(entry) => Ok(Some(entry?)),
        }
    }

    /// Locator of the resource behind a descriptor
    pub async fn resource_uri(&self, fd: u32) -> Result<String, ProcessError> {
        let descriptor = self.descriptor(fd)?;
        let uri = descriptor.lock().await.uri.clone();
        Ok(uri)
    }

    /// Release a descriptor
    ///
    /// The underlying stream ends once nothing else is still using it.
    pub fn close(&self, fd: u32) -> Result<(), ProcessError> {
        lock(&self.inner.fds)
            .open
            .remove(&fd)
            .map(drop)
            .ok_or(ProcessError::BadDescriptor(fd))
    }

    /// Release every descriptor, including stdio
    pub fn close_all(&self) {
        let open = std::mem::take(&mut lock(&self.inner.fds).open);
        drop(open);
    }

    /// Descriptors currently open, in ascending order
    pub fn descriptors(&self) -> Vec<u32> {
        let mut fds: Vec<u32> = lock(&self.inner.fds).open.keys().copied().collect();
        fds.sort_unstable();
        fds
    }

    /// Remove a descriptor from the table, unless an operation still holds it
    fn take(&self, fd: u32) -> Result<Descriptor, ProcessError> {
        let mut fds = lock(&self.inner.fds);
        let shared = fds.open.remove(&fd).ok_or(ProcessError::BadDescriptor(fd))?;
        // new holders only come from the table, which is locked
        match Arc::try_unwrap(shared) {
            Ok(descriptor) => Ok(descriptor.into_inner()),
            Err(shared) => {
                fds.open.insert(fd, shared);
                Err(ProcessError::BusyDescriptor(fd))
            }
        }
    }

    /// Take the raw standard input stream out of the descriptor table
    pub fn stdin(&self) -> Result<ByteReader, ProcessError> {
        self.take(STDIN)?
            .reader
            .ok_or(ProcessError::BadDescriptor(STDIN))
    }

    /// Take the raw standard output stream out of the descriptor table
    pub fn stdout(&self) -> Result<ByteWriter, ProcessError> {
        self.take(STDOUT)?
            .writer
            .ok_or(ProcessError::BadDescriptor(STDOUT))
    }

    /// Take the raw standard error stream out of the descriptor table
    pub fn stderr(&self) -> Result<ByteWriter, ProcessError> {
        self.take(STDERR)?
            .writer
            .ok_or(ProcessError::BadDescriptor(STDERR))
    }
}

#[async_trait]
impl Spawner for LocalProcess {
    async fn spawn(
        &self,
        entrypoint: &str,
        argv: Vec<String>,
        cwd: &str,
        env: BTreeMap<String, String>,
    ) -> Result<Spawned, Failure> {
        let options = SpawnOptions::new().argv(argv).cwd(cwd).env(env);
        LocalProcess::spawn(self, entrypoint, options)
            .await
            .map_err(into_failure)
    }

    async fn wait(&self, pid: VPid) -> Result<i32, Failure> {
        LocalProcess::wait(self, pid).await.map_err(into_failure)
    }

    async fn kill(&self, pid: VPid, signal: Signal) -> Result<(), Failure> {
        LocalProcess::kill(self, signal, Some(pid))
            .await
            .map_err(into_failure)
    }
}

fn into_failure(err: ProcessError) -> Failure {
    match err {
        ProcessError::Syscall(failure) => failure,
        ProcessError::IPC(err) => err.into(),
        other => Failure::new(ErrorKind::Transport, other.to_string()),
    }
}

/// Body of an execution context: handshake, run, clean up, exit
///
/// Returns the exit status the program finished with.
pub(crate) async fn run<P: Port>(program: Arc<dyn Program>, port: P, bootstrap: Bootstrap) -> i32 {
    let pid = bootstrap.info.pid;
    let process = LocalProcess::attach(port, bootstrap);
    if let Err(err) = process.ready().await {
        log::warn!("pid {} failed its readiness handshake, {}", pid, err);
        return exit::EXIT_FAULT;
    }
    let result = AssertUnwindSafe(program.main(process.clone()))
        .catch_unwind()
        .await;
    let code = match result {
        Ok(Ok(code)) => code,
        Ok(Err(err)) => {
            log::error!("pid {} crashed, {}", pid, err);
            let message = format!("{}: {}\n", process.name(), err);
            if let Err(err) = process.write(STDERR, message).await {
                log::trace!("pid {} couldn't report its crash, {}", pid, err);
            }
            exit::EXIT_FAULT
        }
        Err(_) => {
            log::error!("pid {} panicked", pid);
            exit::EXIT_FAULT
        }
    };
    process.close_all();
    match process.exit(code) {
        Ok(()) | Err(ProcessError::IPC(IPCError::Disconnected)) => {}
        Err(err) => log::warn!("pid {} couldn't send its exit status, {}", pid, err),
    }
    code
}
