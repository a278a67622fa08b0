//! Kernel-side handlers, one per syscall

use crate::{
    errors::{RuntimeError, SyscallError},
    filesystem::{Driver, VPath},
    kernel::Kernel,
    process::ProcessHandle,
    protocol::{Signal, SpawnRequest, VPid, WriteMode},
    transfer::{Envelope, Spawned},
};
use std::{collections::BTreeMap, sync::Arc, time::Duration};

pub async fn access(kernel: &Kernel, path: &str) -> Result<Envelope, SyscallError> {
    let path = VPath::parse(path);
    log::info!("access({})", path);
    Ok(Envelope::pack(kernel.vfs().access(&path).await?))
}

pub async fn resolve_uri(kernel: &Kernel, path: &str) -> Result<Envelope, SyscallError> {
    let path = VPath::parse(path);
    log::info!("resolve_uri({})", path);
    Ok(Envelope::pack(kernel.vfs().resolve_uri(&path).await?))
}

pub async fn read_dir(kernel: &Kernel, path: &str) -> Result<Envelope, SyscallError> {
    let path = VPath::parse(path);
    log::info!("read_dir({})", path);
    Ok(Envelope::pack(kernel.vfs().read_dir(&path).await?))
}

pub async fn read_file(
    kernel: &Kernel,
    path: &str,
    offset: u64,
    length: Option<u64>,
) -> Result<Envelope, SyscallError> {
    let path = VPath::parse(path);
    log::info!("read_file({}, {}, {:?})", path, offset, length);
    Ok(Envelope::pack(
        kernel.vfs().read_file(&path, offset, length).await?,
    ))
}

pub async fn write_file(
    kernel: &Kernel,
    path: &str,
    mode: WriteMode,
    create: bool,
) -> Result<Envelope, SyscallError> {
    let path = VPath::parse(path);
    log::info!("write_file({}, {}, {})", path, mode.as_str(), create);
    Ok(Envelope::pack(
        kernel.vfs().write_file(&path, mode, create).await?,
    ))
}

pub async fn delete_node(
    kernel: &Kernel,
    path: &str,
    recursive: bool,
) -> Result<Envelope, SyscallError> {
    let path = VPath::parse(path);
    log::info!("delete_node({}, {})", path, recursive);
    kernel.vfs().delete_node(&path, recursive).await?;
    Ok(Envelope::pack(()))
}

/// Start a child of `process`, handing its stdio back to the caller
///
/// A missing cwd or environment is inherited from the caller's spawn-time
/// values.
pub async fn spawn(
    kernel: &Arc<Kernel>,
    process: &Arc<ProcessHandle>,
    entrypoint: String,
    argv: Vec<String>,
    cwd: Option<String>,
    env: Option<BTreeMap<String, String>>,
) -> Result<Envelope, SyscallError> {
    log::info!("spawn({:?}, {:?})", entrypoint, argv);
    let parent = process.info();
    let request = SpawnRequest {
        entrypoint,
        argv,
        cwd: cwd.unwrap_or_else(|| parent.cwd.clone()),
        env: env.unwrap_or_else(|| parent.env.clone()),
    };
    let child = kernel.spawn_child(Some(process), request).await?;
    let taken = (child.take_stdin(), child.take_stdout(), child.take_stderr());
    match taken {
        (Some(stdin), Some(stdout), Some(stderr)) => Ok(Envelope::pack(Spawned {
            pid: child.pid(),
            stdin,
            stdout,
            stderr,
        })),
        _ => Err(RuntimeError::NoSuchProcess(child.pid()).into()),
    }
}

/// Deliver a signal; with no pid the caller signals itself
pub fn kill(
    kernel: &Kernel,
    process: &ProcessHandle,
    signal: Signal,
    pid: Option<VPid>,
) -> Result<Envelope, SyscallError> {
    log::info!("kill({:?}, {:?})", signal, pid);
    match pid {
        None => {
            process.kill(signal);
        }
        Some(pid) => kernel.kill(pid, signal)?,
    }
    Ok(Envelope::pack(()))
}

/// Collect the exit status of one of the caller's children
pub async fn wait(process: &ProcessHandle, pid: VPid) -> Result<Envelope, SyscallError> {
    log::info!("wait({})", pid);
    match process.wait_child(pid).await {
        Some(code) => Ok(Envelope::pack(code)),
        None => Err(RuntimeError::NoSuchProcess(pid).into()),
    }
}

/// Exit once the caller's other in-flight syscalls finish
///
/// The exit call itself counts as one of those.
pub async fn exit(
    process: &ProcessHandle,
    code: i32,
    grace: Duration,
) -> Result<Envelope, SyscallError> {
    log::info!("exit({})", code);
    process.settle(code, grace, 1).await;
    Ok(Envelope::pack(()))
}
