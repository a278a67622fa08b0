use core::{fmt, str::FromStr};
use std::collections::BTreeMap;

/// Exit codes with a fixed meaning for every process
pub mod exit {
    use super::Signal;

    pub const EXIT_OK: i32 = 0;
    pub const EXIT_FAILURE: i32 = 1;
    pub const EXIT_NOT_EXECUTABLE: i32 = 126;
    pub const EXIT_NOT_FOUND: i32 = 127;
    pub const EXIT_SIGNAL_BASE: i32 = 128;
    pub const EXIT_FAULT: i32 = EXIT_SIGNAL_BASE + Signal::SIGSEGV.0 as i32;

    /// Exit code for a process terminated by a signal
    pub fn killed(signal: Signal) -> i32 {
        EXIT_SIGNAL_BASE + signal.0 as i32
    }
}

#[derive(
    Debug, PartialEq, Eq, Ord, PartialOrd, Copy, Clone, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct VPid(pub u32);

impl fmt::Display for VPid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signal(pub u32);

impl Signal {
    pub const SIGINT: Signal = Signal(2);
    pub const SIGKILL: Signal = Signal(9);
    pub const SIGSEGV: Signal = Signal(11);
    pub const SIGTERM: Signal = Signal(15);
}

/// Type of a node seen in a directory listing
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Directory,
}

/// One directory listing entry, `{"type": "file", "name": "..."}` on the wire
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct DirEntry {
    #[serde(rename = "type")]
    pub kind: FileKind,
    pub name: String,
}

impl DirEntry {
    pub fn file<S: Into<String>>(name: S) -> Self {
        DirEntry {
            kind: FileKind::File,
            name: name.into(),
        }
    }

    pub fn directory<S: Into<String>>(name: S) -> Self {
        DirEntry {
            kind: FileKind::Directory,
            name: name.into(),
        }
    }
}

/// Where new bytes go relative to the existing content of a file
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Prepend to existing content
    Before,
    /// Append to existing content
    After,
    /// Replace existing content
    Override,
}

impl WriteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteMode::Before => "before",
            WriteMode::After => "after",
            WriteMode::Override => "override",
        }
    }
}

impl Default for WriteMode {
    fn default() -> Self {
        WriteMode::Override
    }
}

impl FromStr for WriteMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "before" => Ok(WriteMode::Before),
            "after" => Ok(WriteMode::After),
            "override" => Ok(WriteMode::Override),
            _ => Err(()),
        }
    }
}

/// Closed set of error kinds a syscall can report back to its caller
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "ENOTFOUND")]
    NotFound,
    #[serde(rename = "ENOTADIR")]
    NotADirectory,
    #[serde(rename = "EISDIR")]
    IsADirectory,
    #[serde(rename = "ENOTEMPTY")]
    NotEmpty,
    #[serde(rename = "EACCESS")]
    AccessDenied,
    #[serde(rename = "EBUSY")]
    Busy,
    #[serde(rename = "EEXIST")]
    AlreadyExists,
    #[serde(rename = "EIO")]
    Transport,
    #[serde(rename = "ENOEXEC")]
    NotExecutable,
    #[serde(rename = "ESRCH")]
    NoSuchProcess,
    #[serde(rename = "EINVAL")]
    Invalid,
}

impl ErrorKind {
    /// Short code used on the wire and in messages shown to programs
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "ENOTFOUND",
            ErrorKind::NotADirectory => "ENOTADIR",
            ErrorKind::IsADirectory => "EISDIR",
            ErrorKind::NotEmpty => "ENOTEMPTY",
            ErrorKind::AccessDenied => "EACCESS",
            ErrorKind::Busy => "EBUSY",
            ErrorKind::AlreadyExists => "EEXIST",
            ErrorKind::Transport => "EIO",
            ErrorKind::NotExecutable => "ENOEXEC",
            ErrorKind::NoSuchProcess => "ESRCH",
            ErrorKind::Invalid => "EINVAL",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Application-level error carried in the `err` half of a response
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
}

impl Failure {
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Failure {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Failure {}

/// Identity and environment of one process
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: VPid,
    /// Parent pid, zero for processes spawned by the host
    pub ppid: VPid,
    pub uid: u32,
    pub gid: u32,
    pub cwd: String,
    pub env: BTreeMap<String, String>,
    pub argv: Vec<String>,
    /// Resolved locator of the program image
    pub entrypoint: String,
}

/// Parameters for starting a new process
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub entrypoint: String,
    pub cwd: String,
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl SpawnRequest {
    /// Request with argv `[entrypoint]`, cwd `/` and an empty environment
    pub fn new<S: Into<String>>(entrypoint: S) -> Self {
        let entrypoint = entrypoint.into();
        SpawnRequest {
            argv: vec![entrypoint.clone()],
            entrypoint,
            cwd: "/".to_string(),
            env: BTreeMap::new(),
        }
    }

    /// Append one argument after the existing argv
    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.argv.push(arg.into());
        self
    }

    /// Append arguments after the existing argv
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd<S: Into<String>>(mut self, cwd: S) -> Self {
        self.cwd = cwd.into();
        self
    }

    pub fn env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in vars {
            self.env.insert(key.into(), value.into());
        }
        self
    }
}
