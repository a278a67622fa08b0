//! Shape checks on syscall arguments
//!
//! Everything a process sends is untrusted. A call whose name is unknown or
//! whose arguments have the wrong shape never reaches a handler; it becomes
//! a [SyscallError::Fault] instead.

use crate::{
    errors::SyscallError,
    protocol::{Call, Signal, SyscallName, VPid, WriteMode},
};
use serde_json::Value;
use std::{collections::BTreeMap, convert::TryFrom};

/// A syscall whose arguments passed validation
#[derive(Debug, Clone, PartialEq)]
pub enum Syscall {
    Ready,
    Access {
        path: String,
    },
    ResolveUri {
        path: String,
    },
    ReadDir {
        path: String,
    },
    ReadFile {
        path: String,
        offset: u64,
        length: Option<u64>,
    },
    WriteFile {
        path: String,
        mode: WriteMode,
        create: bool,
    },
    DeleteNode {
        path: String,
        recursive: bool,
    },
    Spawn {
        entrypoint: String,
        argv: Vec<String>,
        cwd: Option<String>,
        env: Option<BTreeMap<String, String>>,
    },
    Kill {
        signal: Signal,
        pid: Option<VPid>,
    },
    Wait {
        pid: VPid,
    },
    Exit {
        code: i32,
    },
}

impl Syscall {
    #[allow(dead_code)]
    pub fn name(&self) -> SyscallName {
        match self {
            Syscall::Ready => SyscallName::Ready,
            Syscall::Access { .. } => SyscallName::Access,
            Syscall::ResolveUri { .. } => SyscallName::ResolveUri,
            Syscall::ReadDir { .. } => SyscallName::ReadDir,
            Syscall::ReadFile { .. } => SyscallName::ReadFile,
            Syscall::WriteFile { .. } => SyscallName::WriteFile,
            Syscall::DeleteNode { .. } => SyscallName::DeleteNode,
            Syscall::Spawn { .. } => SyscallName::Spawn,
            Syscall::Kill { .. } => SyscallName::Kill,
            Syscall::Wait { .. } => SyscallName::Wait,
            Syscall::Exit { .. } => SyscallName::Exit,
        }
    }
}

struct Args<'a> {
    name: SyscallName,
    args: &'a [Value],
}

fn fault(name: SyscallName, index: usize, expected: &str) -> SyscallError {
    SyscallError::Fault(format!(
        "argument {} of {} must be {}",
        index, name, expected
    ))
}

impl<'a> Args<'a> {
    fn arity(&self, count: usize) -> Result<(), SyscallError> {
        if self.args.len() == count {
            Ok(())
        } else {
            Err(SyscallError::Fault(format!(
                "{} takes {} arguments, got {}",
                self.name,
                count,
                self.args.len()
            )))
        }
    }

    fn string(&self, index: usize) -> Result<String, SyscallError> {
        match &self.args[index] {
            Value::String(s) => Ok(s.clone()),
            _ => Err(fault(self.name, index, "a string")),
        }
    }

    fn maybe_string(&self, index: usize) -> Result<Option<String>, SyscallError> {
        match &self.args[index] {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s.clone())),
            _ => Err(fault(self.name, index, "a string or null")),
        }
    }

    fn boolean(&self, index: usize) -> Result<bool, SyscallError> {
        self.args[index]
            .as_bool()
            .ok_or_else(|| fault(self.name, index, "a boolean"))
    }

    fn unsigned(&self, index: usize) -> Result<u64, SyscallError> {
        self.args[index]
            .as_u64()
            .ok_or_else(|| fault(self.name, index, "a non-negative integer"))
    }

    fn maybe_unsigned(&self, index: usize) -> Result<Option<u64>, SyscallError> {
        match &self.args[index] {
            Value::Null => Ok(None),
            _ => self.unsigned(index).map(Some),
        }
    }

    fn integer(&self, index: usize) -> Result<i32, SyscallError> {
        self.args[index]
            .as_i64()
            .and_then(|n| i32::try_from(n).ok())
            .ok_or_else(|| fault(self.name, index, "an integer"))
    }

    fn u32(&self, index: usize) -> Result<u32, SyscallError> {
        self.args[index]
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| fault(self.name, index, "a 32-bit unsigned integer"))
    }

    fn maybe_u32(&self, index: usize) -> Result<Option<u32>, SyscallError> {
        match &self.args[index] {
            Value::Null => Ok(None),
            _ => self.u32(index).map(Some),
        }
    }

    fn write_mode(&self, index: usize) -> Result<WriteMode, SyscallError> {
        self.args[index]
            .as_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| fault(self.name, index, "one of \"before\", \"after\", \"override\""))
    }

    fn string_array(&self, index: usize) -> Result<Vec<String>, SyscallError> {
        let expected = || fault(self.name, index, "an array of strings");
        let items = self.args[index].as_array().ok_or_else(expected)?;
        items
            .iter()
            .map(|item| item.as_str().map(str::to_string).ok_or_else(expected))
            .collect()
    }

    fn maybe_string_map(&self, index: usize) -> Result<Option<BTreeMap<String, String>>, SyscallError> {
        let expected = || fault(self.name, index, "an object of strings or null");
        match &self.args[index] {
            Value::Null => Ok(None),
            Value::Object(map) => map
                .iter()
                .map(|(key, value)| match value {
                    Value::String(value) => Ok((key.clone(), value.clone())),
                    _ => Err(expected()),
                })
                .collect::<Result<_, _>>()
                .map(Some),
            _ => Err(expected()),
        }
    }
}

/// Check a raw call, producing a typed syscall or a fault
pub fn syscall(call: &Call) -> Result<Syscall, SyscallError> {
    let name: SyscallName = call
        .name
        .parse()
        .map_err(|()| SyscallError::Fault(format!("unknown syscall {:?}", call.name)))?;
    let args = Args {
        name,
        args: &call.args,
    };
    Ok(match name {
        SyscallName::Ready => {
            args.arity(0)?;
            Syscall::Ready
        }
        SyscallName::Access => {
            args.arity(1)?;
            Syscall::Access {
                path: args.string(0)?,
            }
        }
        SyscallName::ResolveUri => {
            args.arity(1)?;
            Syscall::ResolveUri {
                path: args.string(0)?,
            }
        }
        SyscallName::ReadDir => {
            args.arity(1)?;
            Syscall::ReadDir {
                path: args.string(0)?,
            }
        }
        SyscallName::ReadFile => {
            args.arity(3)?;
            Syscall::ReadFile {
                path: args.string(0)?,
                offset: args.unsigned(1)?,
                length: args.maybe_unsigned(2)?,
            }
        }
        SyscallName::WriteFile => {
            args.arity(3)?;
            Syscall::WriteFile {
                path: args.string(0)?,
                mode: args.write_mode(1)?,
                create: args.boolean(2)?,
            }
        }
        SyscallName::DeleteNode => {
            args.arity(2)?;
            Syscall::DeleteNode {
                path: args.string(0)?,
                recursive: args.boolean(1)?,
            }
        }
        SyscallName::Spawn => {
            args.arity(4)?;
            Syscall::Spawn {
                entrypoint: args.string(0)?,
                argv: args.string_array(1)?,
                cwd: args.maybe_string(2)?,
                env: args.maybe_string_map(3)?,
            }
        }
        SyscallName::Kill => {
            args.arity(2)?;
            Syscall::Kill {
                signal: Signal(args.u32(0)?),
                pid: args.maybe_u32(1)?.map(VPid),
            }
        }
        SyscallName::Wait => {
            args.arity(1)?;
            Syscall::Wait {
                pid: VPid(args.u32(0)?),
            }
        }
        SyscallName::Exit => {
            args.arity(1)?;
            Syscall::Exit {
                code: args.integer(0)?,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(name: &str, args: Value) -> Call {
        Call {
            name: name.to_string(),
            args: serde_json::from_value(args).unwrap(),
        }
    }

    #[test]
    fn accepts_well_formed_calls() {
        assert_eq!(
            syscall(&call("read_file", json!(["/a", 3, null]))),
            Ok(Syscall::ReadFile {
                path: "/a".to_string(),
                offset: 3,
                length: None
            })
        );
        assert_eq!(
            syscall(&call("write_file", json!(["/a", "after", true]))),
            Ok(Syscall::WriteFile {
                path: "/a".to_string(),
                mode: WriteMode::After,
                create: true
            })
        );
        assert_eq!(
            syscall(&call("kill", json!([9, null]))),
            Ok(Syscall::Kill {
                signal: Signal::SIGKILL,
                pid: None
            })
        );
        let spawn = syscall(&call("spawn", json!(["echo", ["echo", "hi"], null, {"A": "b"}]))).unwrap();
        assert_eq!(spawn.name(), SyscallName::Spawn);
    }

    #[test]
    fn rejects_bad_shapes_as_faults() {
        for (name, args) in vec![
            ("access", json!([42])),
            ("access", json!([])),
            ("read_file", json!(["/a", -1, null])),
            ("write_file", json!(["/a", "sideways", true])),
            ("delete_node", json!(["/a", "yes"])),
            ("spawn", json!(["echo", [1], null, null])),
            ("spawn", json!(["echo", [], null, {"A": 1}])),
            ("exit", json!(["0"])),
            ("wait", json!([null])),
            ("format_disk", json!([])),
        ] {
            let err = syscall(&call(name, args)).unwrap_err();
            assert!(err.is_fault(), "{} should fault", name);
        }
    }
}
