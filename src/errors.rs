//! Error types you might see while setting up or running processes

use crate::protocol::{exit, ErrorKind, Failure, VPid};
use thiserror::Error;

/// Errors from the virtual filesystem layer, convertible to a wire error kind
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum VFSError {
    /// no such file or directory
    #[error("not found")]
    NotFound,

    /// expected a directory, found another node type
    #[error("expected a directory, found another node type")]
    NotADirectory,

    /// expected a file, found a directory
    #[error("expected a file, found a directory")]
    IsADirectory,

    /// directory is not empty
    #[error("directory is not empty")]
    NotEmpty,

    /// access denied by the driver or the host
    #[error("access denied")]
    AccessDenied,

    /// node is in use and can't be removed
    #[error("resource busy")]
    Busy,

    /// a driver is already mounted at this exact path
    #[error("a filesystem is already mounted at {0}")]
    AlreadyMounted(String),

    /// unexpected status from an HTTP server
    #[error("unexpected HTTP status {0}")]
    Http(u16),

    /// the host or network failed underneath a driver
    #[error("transport error: {0}")]
    Transport(String),

    /// byte stream failed while moving file content
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),
}

impl VFSError {
    /// Closed wire error kind for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            VFSError::NotFound => ErrorKind::NotFound,
            VFSError::NotADirectory => ErrorKind::NotADirectory,
            VFSError::IsADirectory => ErrorKind::IsADirectory,
            VFSError::NotEmpty => ErrorKind::NotEmpty,
            VFSError::AccessDenied => ErrorKind::AccessDenied,
            VFSError::Busy => ErrorKind::Busy,
            VFSError::AlreadyMounted(_) => ErrorKind::AlreadyExists,
            VFSError::Http(_) => ErrorKind::Transport,
            VFSError::Transport(_) => ErrorKind::Transport,
            VFSError::Stream(_) => ErrorKind::Transport,
        }
    }

    /// Classify an error from the host filesystem
    ///
    /// `expect_directory` picks between the two ways a type mismatch can
    /// be reported, the same way the host would for the operation at hand.
    pub fn from_host(err: &std::io::Error, expect_directory: bool) -> Self {
        match err.raw_os_error() {
            Some(libc::ENOENT) => VFSError::NotFound,
            Some(libc::ENOTDIR) if expect_directory => VFSError::NotADirectory,
            Some(libc::ENOTDIR) => VFSError::IsADirectory,
            Some(libc::EISDIR) if expect_directory => VFSError::NotADirectory,
            Some(libc::EISDIR) => VFSError::IsADirectory,
            Some(libc::ENOTEMPTY) => VFSError::NotEmpty,
            Some(libc::EACCES) | Some(libc::EPERM) | Some(libc::EROFS) => VFSError::AccessDenied,
            Some(libc::EBUSY) => VFSError::Busy,
            _ => match err.kind() {
                std::io::ErrorKind::NotFound => VFSError::NotFound,
                std::io::ErrorKind::PermissionDenied => VFSError::AccessDenied,
                _ => VFSError::Transport(err.to_string()),
            },
        }
    }
}

impl From<Failure> for VFSError {
    fn from(failure: Failure) -> Self {
        match failure.kind {
            ErrorKind::NotFound => VFSError::NotFound,
            ErrorKind::NotADirectory => VFSError::NotADirectory,
            ErrorKind::IsADirectory => VFSError::IsADirectory,
            ErrorKind::NotEmpty => VFSError::NotEmpty,
            ErrorKind::AccessDenied => VFSError::AccessDenied,
            ErrorKind::Busy => VFSError::Busy,
            _ => VFSError::Transport(failure.message),
        }
    }
}

impl From<VFSError> for Failure {
    fn from(err: VFSError) -> Self {
        Failure::new(err.kind(), err.to_string())
    }
}

/// Errors that end a byte stream early
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum StreamError {
    /// the writing side gave up, no more bytes will arrive
    #[error("stream aborted: {0}")]
    Aborted(String),

    /// the reading side gave up, nobody will read further bytes
    #[error("stream canceled: {0}")]
    Canceled(String),

    /// the writing side already closed the stream
    #[error("stream closed")]
    Closed,
}

impl StreamError {
    /// Reason text to forward to the opposite end of a pipe
    pub fn reason(&self) -> String {
        match self {
            StreamError::Aborted(reason) => reason.clone(),
            StreamError::Canceled(reason) => reason.clone(),
            StreamError::Closed => "closed".to_string(),
        }
    }
}

/// Errors in the message channel underneath syscalls
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum IPCError {
    /// connection lost unexpectedly
    #[error("connection lost unexpectedly")]
    Disconnected,

    /// message did not have the expected structure
    #[error("malformed message: {0}")]
    Malformed(String),

    /// message refers to a resource slot that doesn't exist or was already taken
    #[error("message refers to unknown resource slot {0}")]
    UnknownResource(usize),

    /// resource slot holds a different kind of resource than expected
    #[error("resource slot {0} holds a {1}, expected a {2}")]
    ResourceType(usize, &'static str, &'static str),

    /// the handler for a request panicked before answering
    #[error("request handler panicked")]
    HandlerPanicked,
}

impl From<IPCError> for Failure {
    fn from(err: IPCError) -> Self {
        Failure::new(ErrorKind::Transport, err.to_string())
    }
}

impl From<serde_json::Error> for IPCError {
    fn from(err: serde_json::Error) -> Self {
        IPCError::Malformed(err.to_string())
    }
}

/// Result of a call that the remote side may fail with its own error type
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum CallError<E> {
    /// remote side replied with an error
    #[error("{0}")]
    Remote(E),

    /// the call never got a reply
    #[error("ipc error: {0}")]
    IPC(#[from] IPCError),
}

/// Errors raised while the kernel handles one syscall
#[derive(Error, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(into = "Failure")]
pub enum SyscallError {
    /// malformed or unknown syscall; fatal to the caller
    #[error("protocol fault: {0}")]
    Fault(String),

    /// ordinary failure reported back to the caller
    #[error("{0}")]
    Failed(Failure),
}

impl SyscallError {
    pub fn is_fault(&self) -> bool {
        matches!(self, SyscallError::Fault(_))
    }
}

impl From<SyscallError> for Failure {
    fn from(err: SyscallError) -> Self {
        match err {
            SyscallError::Fault(message) => Failure::new(ErrorKind::Invalid, message),
            SyscallError::Failed(failure) => failure,
        }
    }
}

impl From<VFSError> for SyscallError {
    fn from(err: VFSError) -> Self {
        SyscallError::Failed(err.into())
    }
}

impl From<SpawnError> for SyscallError {
    fn from(err: SpawnError) -> Self {
        SyscallError::Failed(err.into())
    }
}

impl From<RuntimeError> for SyscallError {
    fn from(err: RuntimeError) -> Self {
        SyscallError::Failed(err.into())
    }
}

impl From<IPCError> for SyscallError {
    fn from(err: IPCError) -> Self {
        match err {
            // the kernel's fault, not the caller's
            IPCError::HandlerPanicked => SyscallError::Failed(err.into()),
            other => SyscallError::Fault(other.to_string()),
        }
    }
}

/// Errors starting a new process
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum SpawnError {
    /// entrypoint could not be resolved to a file
    #[error("command not found: {0}")]
    NotFound(String),

    /// entrypoint exists but is not a program we can run
    #[error("not executable: {0}")]
    NotExecutable(String),

    /// execution context exited before signaling readiness
    #[error("process exited during startup with status {0}")]
    Crashed(i32),

    /// virtual filesystem error while loading the entrypoint
    #[error("virtual filesystem error while loading the entrypoint: {0}")]
    VFS(#[from] VFSError),

    /// ipc error while connecting the execution context
    #[error("ipc error while connecting the execution context: {0}")]
    IPC(#[from] IPCError),
}

impl SpawnError {
    /// Exit status a shell reports for this failure
    pub fn exit_code(&self) -> i32 {
        match self {
            SpawnError::NotExecutable(_) => exit::EXIT_NOT_EXECUTABLE,
            SpawnError::Crashed(code) => *code,
            _ => exit::EXIT_NOT_FOUND,
        }
    }
}

impl From<SpawnError> for Failure {
    fn from(err: SpawnError) -> Self {
        let kind = match &err {
            SpawnError::NotFound(_) => ErrorKind::NotFound,
            SpawnError::NotExecutable(_) => ErrorKind::NotExecutable,
            SpawnError::VFS(vfs) => vfs.kind(),
            SpawnError::Crashed(_) | SpawnError::IPC(_) => ErrorKind::Transport,
        };
        Failure::new(kind, err.to_string())
    }
}

/// Errors from host-side kernel operations
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// invalid process ID
    #[error("no live process with pid {0}")]
    NoSuchProcess(VPid),

    /// failed to start a process
    #[error("failed to start process: {0}")]
    Spawn(#[from] SpawnError),

    /// virtual filesystem error
    #[error("virtual filesystem error: {0}")]
    VFS(#[from] VFSError),

    /// stream error
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// operation failed on the other side of a syscall channel
    #[error("{0}")]
    Failed(#[from] Failure),

    /// empty command line
    #[error("empty command line")]
    EmptyCommand,

    /// command line syntax error
    #[error("command line syntax error: {0}")]
    Syntax(String),

    /// task join error
    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl RuntimeError {
    /// Exit status a shell reports when a command line fails this way
    pub fn exit_code(&self) -> i32 {
        match self {
            RuntimeError::Spawn(err) => err.exit_code(),
            RuntimeError::Failed(failure) => match failure.kind {
                ErrorKind::NotFound => exit::EXIT_NOT_FOUND,
                ErrorKind::NotExecutable => exit::EXIT_NOT_EXECUTABLE,
                _ => exit::EXIT_FAILURE,
            },
            RuntimeError::EmptyCommand | RuntimeError::Syntax(_) => 2,
            _ => exit::EXIT_FAILURE,
        }
    }
}

impl From<RuntimeError> for Failure {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::NoSuchProcess(_) => Failure::new(ErrorKind::NoSuchProcess, err.to_string()),
            RuntimeError::Spawn(err) => err.into(),
            RuntimeError::VFS(err) => err.into(),
            RuntimeError::Failed(failure) => failure,
            RuntimeError::EmptyCommand | RuntimeError::Syntax(_) => {
                Failure::new(ErrorKind::Invalid, err.to_string())
            }
            other => Failure::new(ErrorKind::Transport, other.to_string()),
        }
    }
}

/// Errors a hosted program sees from its own process handle
#[derive(Error, Debug)]
pub enum ProcessError {
    /// descriptor is not open, or doesn't support this operation
    #[error("bad file descriptor {0}")]
    BadDescriptor(u32),

    /// descriptor is being used by an operation still in progress
    #[error("file descriptor {0} is busy")]
    BusyDescriptor(u32),

    /// syscall returned an error
    #[error("{0}")]
    Syscall(#[from] Failure),

    /// connection to the kernel failed
    #[error("ipc error: {0}")]
    IPC(#[from] IPCError),

    /// stream error
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// program-specific failure
    #[error("{0}")]
    Program(String),
}

impl ProcessError {
    /// Wire error kind if this came back from the kernel
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ProcessError::Syscall(failure) => Some(failure.kind),
            _ => None,
        }
    }
}

impl From<CallError<Failure>> for ProcessError {
    fn from(err: CallError<Failure>) -> Self {
        match err {
            CallError::Remote(failure) => ProcessError::Syscall(failure),
            CallError::IPC(err) => ProcessError::IPC(err),
        }
    }
}

impl From<VFSError> for ProcessError {
    fn from(err: VFSError) -> Self {
        ProcessError::Syscall(err.into())
    }
}
