//! Kernel end of one process's syscall channel

use crate::{
    errors::SyscallError,
    kernel::Kernel,
    process::ProcessHandle,
    protocol::{exit, Call, ErrorKind, Failure},
    rpc::Service,
    taskcall,
    transfer::Envelope,
    validate::{self, Syscall},
};
use async_trait::async_trait;
use std::sync::{Arc, Weak};

/// Answers syscalls from a single process
///
/// Anything but `ready` waits until the process has finished its handshake.
/// Calls that fail validation are faults, and kill the caller.
pub struct SyscallService {
    kernel: Weak<Kernel>,
    process: Arc<ProcessHandle>,
}

impl SyscallService {
    pub fn new(kernel: Weak<Kernel>, process: Arc<ProcessHandle>) -> Self {
        SyscallService { kernel, process }
    }

    async fn dispatch(&self, kernel: &Arc<Kernel>, syscall: Syscall) -> Result<Envelope, SyscallError> {
        let process = &self.process;
        match syscall {
            Syscall::Ready => {
                if !process.mark_ready() {
                    log::warn!("pid {} repeated its readiness handshake", process.pid());
                }
                Ok(Envelope::pack(()))
            }
            Syscall::Access { path } => taskcall::access(kernel, &path).await,
            Syscall::ResolveUri { path } => taskcall::resolve_uri(kernel, &path).await,
            Syscall::ReadDir { path } => taskcall::read_dir(kernel, &path).await,
            Syscall::ReadFile {
                path,
                offset,
                length,
            } => taskcall::read_file(kernel, &path, offset, length).await,
            Syscall::WriteFile { path, mode, create } => {
                taskcall::write_file(kernel, &path, mode, create).await
            }
            Syscall::DeleteNode { path, recursive } => {
                taskcall::delete_node(kernel, &path, recursive).await
            }
            Syscall::Spawn {
                entrypoint,
                argv,
                cwd,
                env,
            } => taskcall::spawn(kernel, process, entrypoint, argv, cwd, env).await,
            Syscall::Kill { signal, pid } => taskcall::kill(kernel, process, signal, pid),
            Syscall::Wait { pid } => taskcall::wait(process, pid).await,
            Syscall::Exit { code } => taskcall::exit(process, code, kernel.grace_period()).await,
        }
    }
}

#[async_trait]
impl Service for SyscallService {
    type Request = Call;
    type Response = Envelope;
    type Error = SyscallError;

    async fn handle(&self, call: Call) -> Result<Envelope, SyscallError> {
        let pid = self.process.pid();
        log::debug!(">{} {:x?}", pid, call);
        let syscall = validate::syscall(&call)?;
        let _inflight = self.process.begin_syscall();
        if syscall != Syscall::Ready && self.process.wait_ready().await.is_err() {
            return Err(SyscallError::Failed(Failure::new(
                ErrorKind::Transport,
                "process exited",
            )));
        }
        let kernel = self.kernel.upgrade().ok_or_else(|| {
            SyscallError::Failed(Failure::new(ErrorKind::Transport, "kernel is gone"))
        })?;
        let result = self.dispatch(&kernel, syscall).await;
        log::debug!("<{} {:x?}", pid, result.as_ref().map(|envelope| &envelope.data));
        result
    }

    fn is_fatal(&self, error: &SyscallError) -> bool {
        error.is_fault()
    }

    async fn fault(&self, error: &SyscallError) {
        log::error!("pid {} faulted, {}", self.process.pid(), error);
        self.process.terminate(exit::EXIT_FAULT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        process::ProcessState,
        protocol::{ProcessInfo, SyscallName, VPid},
        rpc::{self, Client},
        stream::pipe,
    };
    use serde_json::json;
    use std::{collections::BTreeMap, time::Duration};
    use tokio::runtime::Runtime;

    fn process() -> Arc<ProcessHandle> {
        let (stdin, _) = pipe(16);
        let (_, stdout) = pipe(16);
        let (_, stderr) = pipe(16);
        let info = ProcessInfo {
            pid: VPid(1),
            ppid: VPid(0),
            uid: 0,
            gid: 0,
            cwd: "/".to_string(),
            env: BTreeMap::new(),
            argv: vec!["early".to_string()],
            entrypoint: "memory:///early.bin".to_string(),
        };
        Arc::new(ProcessHandle::new(info, Weak::new(), stdin, stdout, stderr))
    }

    #[test]
    fn calls_before_ready_wait_for_it() {
        Runtime::new().unwrap().block_on(async {
            let kernel = Kernel::builder().build().unwrap();
            let process = process();
            let (kernel_port, process_port) = rpc::channel();
            let service = SyscallService::new(Arc::downgrade(&kernel), process.clone());
            let _server = rpc::expose(kernel_port, Arc::new(service));
            let client: Client<Call, Envelope, Failure> = Client::attach(process_port);

            let mut early = tokio::spawn({
                let client = client.clone();
                async move { client.call(Call::new(SyscallName::Access, vec![json!("/")])).await }
            });
            assert!(tokio::time::timeout(Duration::from_millis(100), &mut early)
                .await
                .is_err());
            assert_eq!(process.state(), ProcessState::Created);

            client.call(Call::new(SyscallName::Ready, vec![])).await.unwrap();
            let reply = early.await.unwrap().unwrap();
            assert!(reply.unpack::<bool>().unwrap());
            assert_eq!(process.state(), ProcessState::Ready);
        });
    }
}
