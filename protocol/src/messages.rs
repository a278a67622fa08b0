use crate::types::*;
use core::{fmt, str::FromStr};
use serde_json::Value;

/// Correlation id, unique among the calls pending on one channel
pub type CallId = u64;

/// Any message sent by the calling side of a channel
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct Request<T> {
    pub id: CallId,
    #[serde(rename = "req")]
    pub payload: T,
}

/// Any message sent back by the exposed side of a channel
///
/// On the wire this is either `{"id": n, "ok": ...}` or `{"id": n, "err": ...}`
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Response<T, E> {
    Ok { id: CallId, ok: T },
    Err { id: CallId, err: E },
}

impl<T, E> Response<T, E> {
    pub fn new(id: CallId, result: Result<T, E>) -> Self {
        match result {
            Ok(ok) => Response::Ok { id, ok },
            Err(err) => Response::Err { id, err },
        }
    }

    pub fn id(&self) -> CallId {
        match self {
            Response::Ok { id, .. } => *id,
            Response::Err { id, .. } => *id,
        }
    }

    pub fn into_result(self) -> Result<T, E> {
        match self {
            Response::Ok { ok, .. } => Ok(ok),
            Response::Err { err, .. } => Err(err),
        }
    }
}

/// A named syscall with its positional arguments, not yet validated
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Call {
    pub name: String,
    pub args: Vec<Value>,
}

impl Call {
    pub fn new(name: SyscallName, args: Vec<Value>) -> Self {
        Call {
            name: name.as_str().to_string(),
            args,
        }
    }
}

/// Every syscall the kernel knows how to dispatch
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyscallName {
    Ready,
    Access,
    ResolveUri,
    ReadDir,
    ReadFile,
    WriteFile,
    DeleteNode,
    Spawn,
    Kill,
    Wait,
    Exit,
}

impl SyscallName {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyscallName::Ready => "ready",
            SyscallName::Access => "access",
            SyscallName::ResolveUri => "resolve_uri",
            SyscallName::ReadDir => "read_dir",
            SyscallName::ReadFile => "read_file",
            SyscallName::WriteFile => "write_file",
            SyscallName::DeleteNode => "delete_node",
            SyscallName::Spawn => "spawn",
            SyscallName::Kill => "kill",
            SyscallName::Wait => "wait",
            SyscallName::Exit => "exit",
        }
    }
}

impl fmt::Display for SyscallName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyscallName {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        Ok(match s {
            "ready" => SyscallName::Ready,
            "access" => SyscallName::Access,
            "resolve_uri" => SyscallName::ResolveUri,
            "read_dir" => SyscallName::ReadDir,
            "read_file" => SyscallName::ReadFile,
            "write_file" => SyscallName::WriteFile,
            "delete_node" => SyscallName::DeleteNode,
            "spawn" => SyscallName::Spawn,
            "kill" => SyscallName::Kill,
            "wait" => SyscallName::Wait,
            "exit" => SyscallName::Exit,
            _ => return Err(()),
        })
    }
}

/// Placeholder standing in for a transferred resource inside message data
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct ResourceSlot {
    pub resource: usize,
}

/// Plain-data half of the reply to a `spawn` syscall
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct SpawnReply {
    pub pid: VPid,
    pub stdin: ResourceSlot,
    pub stdout: ResourceSlot,
    pub stderr: ResourceSlot,
}
