use async_trait::async_trait;
use minikernel::{
    commands,
    errors::{ProcessError, VFSError},
    filesystem::{Driver, MemoryFS, VPath},
    protocol::{exit, Call, ErrorKind, Signal, SpawnRequest, SyscallName, VPid, WriteMode},
    stream::{ByteReader, ByteWriter, EntryStream},
    FnProgram, Kernel, ProcessState, ProgramRegistry, SpawnOptions, STDOUT,
};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio::runtime::Runtime;

async fn hang() -> Result<i32, ProcessError> {
    tokio::time::sleep(Duration::from_secs(3600)).await;
    Ok(exit::EXIT_OK)
}

/// Memory filesystem whose access checks take a while
struct SlowFS {
    inner: MemoryFS,
    delay: Duration,
}

#[async_trait]
impl Driver for SlowFS {
    async fn resolve_uri(&self, path: &VPath) -> Result<String, VFSError> {
        self.inner.resolve_uri(path).await
    }

    async fn access(&self, path: &VPath) -> Result<bool, VFSError> {
        tokio::time::sleep(self.delay).await;
        self.inner.access(path).await
    }

    async fn read_dir(&self, path: &VPath) -> Result<EntryStream, VFSError> {
        self.inner.read_dir(path).await
    }

    async fn read_file(
        &self,
        path: &VPath,
        offset: u64,
        length: Option<u64>,
    ) -> Result<ByteReader, VFSError> {
        self.inner.read_file(path, offset, length).await
    }

    async fn write_file(
        &self,
        path: &VPath,
        mode: WriteMode,
        create: bool,
    ) -> Result<ByteWriter, VFSError> {
        self.inner.write_file(path, mode, create).await
    }

    async fn delete_node(&self, path: &VPath, recursive: bool) -> Result<(), VFSError> {
        self.inner.delete_node(path, recursive).await
    }
}

/// Bundled commands plus a few test programs
fn programs() -> ProgramRegistry {
    commands::registry()
        .with("hang", FnProgram::new(|_| hang()))
        .with(
            "bad-syscall",
            FnProgram::new(|process| async move {
                let _ = process
                    .syscall(Call::new(SyscallName::Access, vec![json!(42)]))
                    .await;
                hang().await
            }),
        )
        .with(
            "parent",
            FnProgram::new(|process| async move {
                let child = process.spawn("hang", SpawnOptions::new()).await?;
                process.write(STDOUT, format!("{}\n", child.pid)).await?;
                hang().await
            }),
        )
        .with(
            "reaper",
            FnProgram::new(|process| async move {
                let child = process.spawn("false", SpawnOptions::new()).await?;
                let status = process.wait(child.pid).await?;
                let again = process.wait(child.pid).await;
                match again.map_err(|err| err.kind()) {
                    Err(Some(ErrorKind::NoSuchProcess)) => Ok(status + 10),
                    _ => Ok(exit::EXIT_FAILURE),
                }
            }),
        )
        .with(
            "missing",
            FnProgram::new(|process| async move {
                match process.spawn("no-such-command", SpawnOptions::new()).await {
                    Err(err) if err.kind() == Some(ErrorKind::NotFound) => Ok(42),
                    _ => Ok(exit::EXIT_FAILURE),
                }
            }),
        )
        .with(
            "scribe",
            FnProgram::new(|process| async move {
                let fd = process.open_write("note", WriteMode::Override, true).await?;
                process.write(fd, "hello").await?;
                process.close(fd)?;
                let fd = process.open_write("note", WriteMode::After, false).await?;
                process.write(fd, "world").await?;
                process.close(fd)?;
                let fd = process.open_read("/home/note").await?;
                while let Some(chunk) = process.read(fd).await? {
                    process.write(STDOUT, chunk).await?;
                }
                Ok(exit::EXIT_OK)
            }),
        )
        .with(
            "crash",
            FnProgram::new(|_| async { Err(ProcessError::Program("gave up".to_string())) }),
        )
        .with(
            "slow-parent",
            FnProgram::new(|process| async move {
                process.spawn("/slow/hang.bin", SpawnOptions::new()).await?;
                hang().await
            }),
        )
}

async fn kernel() -> Arc<Kernel> {
    let _ = env_logger::builder().is_test(true).try_init();
    let registry = programs();
    let kernel = Kernel::builder()
        .context_factory(Arc::new(registry.clone()))
        .grace_period(Duration::from_millis(500))
        .build()
        .unwrap();
    registry
        .install(&**kernel.vfs(), &VPath::parse("/bin"), "bin")
        .await
        .unwrap();
    kernel
}

fn request(name: &str) -> SpawnRequest {
    SpawnRequest::new(name).env("PATH", commands::DEFAULT_PATH)
}

#[test]
fn pids_strictly_increase() {
    Runtime::new().unwrap().block_on(async {
        let kernel = kernel().await;
        let mut last = VPid(0);
        for _ in 0..5 {
            let process = kernel.spawn(request("true")).await.unwrap();
            assert!(process.pid() > last);
            last = process.pid();
            assert_eq!(process.state(), ProcessState::Running);
            assert!(process.output().await.unwrap().status.success());
        }
        assert_eq!(last, VPid(5));
    })
}

#[test]
fn echo_output() {
    Runtime::new().unwrap().block_on(async {
        let kernel = kernel().await;
        let process = kernel
            .spawn(request("echo").args(vec!["hello", "world!"]))
            .await
            .unwrap();
        let output = process.output().await.unwrap();
        assert!(output.status.success());
        assert_eq!(output.stdout_str(), "hello world!\n");
        assert_eq!(output.stderr_str(), "");
    })
}

#[test]
fn files_through_descriptors() {
    Runtime::new().unwrap().block_on(async {
        let kernel = kernel().await;
        let process = kernel
            .spawn(request("scribe").cwd("/home"))
            .await
            .unwrap();
        let output = process.output().await.unwrap();
        assert!(output.status.success(), "{:?}", output);
        assert_eq!(output.stdout_str(), "helloworld");
    })
}

#[test]
fn malformed_syscall_kills_the_caller() {
    Runtime::new().unwrap().block_on(async {
        let kernel = kernel().await;
        let process = kernel.spawn(request("bad-syscall")).await.unwrap();
        let status = process.wait().await;
        assert_eq!(status.code(), exit::EXIT_FAULT);
        assert_eq!(status.signal(), Some(Signal::SIGSEGV));
    })
}

#[test]
fn uncaught_errors_are_faults() {
    Runtime::new().unwrap().block_on(async {
        let kernel = kernel().await;
        let process = kernel.spawn(request("crash")).await.unwrap();
        let output = process.output().await.unwrap();
        assert_eq!(output.status.code(), exit::EXIT_FAULT);
        assert_eq!(output.stderr_str(), "crash: gave up\n");
    })
}

#[test]
fn killing_a_parent_kills_its_children() {
    Runtime::new().unwrap().block_on(async {
        let kernel = kernel().await;
        let parent = kernel.spawn(request("parent")).await.unwrap();
        let mut stdout = parent.take_stdout().unwrap();
        let line = stdout.read().await.unwrap().unwrap();
        let child_pid = VPid(String::from_utf8_lossy(&line).trim().parse().unwrap());
        let child = kernel.process(child_pid).unwrap();
        assert_eq!(child.ppid(), parent.pid());
        assert_eq!(parent.children().len(), 1);

        kernel.kill(parent.pid(), Signal::SIGTERM).unwrap();
        assert_eq!(parent.wait().await.code(), 143);
        let status = tokio::time::timeout(Duration::from_secs(1), child.wait())
            .await
            .unwrap();
        assert_eq!(status.code(), 137);
        assert_eq!(status.signal(), Some(Signal::SIGKILL));
    })
}

#[test]
fn children_spawned_while_the_parent_dies_are_refused() {
    Runtime::new().unwrap().block_on(async {
        let kernel = kernel().await;
        let slow = MemoryFS::new();
        programs().install(&slow, &VPath::root(), "bin").await.unwrap();
        kernel
            .mount(
                "/slow",
                Arc::new(SlowFS {
                    inner: slow,
                    delay: Duration::from_millis(300),
                }),
            )
            .unwrap();

        let parent = kernel.spawn(request("slow-parent")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        kernel.kill(parent.pid(), Signal::SIGTERM).unwrap();
        assert_eq!(parent.wait().await.code(), 143);

        // the spawn finishes its slow lookup after the parent is gone
        tokio::time::sleep(Duration::from_millis(500)).await;
        let live: Vec<_> = kernel
            .processes()
            .into_iter()
            .filter(|process| process.state().exit_code().is_none())
            .map(|process| (process.pid(), process.ppid()))
            .collect();
        assert!(live.is_empty(), "{:?}", live);
        assert!(parent.children().is_empty());
    })
}

#[test]
fn children_are_waited_for_once() {
    Runtime::new().unwrap().block_on(async {
        let kernel = kernel().await;
        let process = kernel.spawn(request("reaper")).await.unwrap();
        assert_eq!(process.wait().await.code(), 11);
    })
}

#[test]
fn failed_spawns_are_reported_to_the_program() {
    Runtime::new().unwrap().block_on(async {
        let kernel = kernel().await;
        let process = kernel.spawn(request("missing")).await.unwrap();
        assert_eq!(process.wait().await.code(), 42);

        let err = kernel.spawn(request("no-such-command")).await.unwrap_err();
        assert_eq!(err.exit_code(), exit::EXIT_NOT_FOUND);
    })
}

#[test]
fn shell_reads_lines() {
    Runtime::new().unwrap().block_on(async {
        let kernel = kernel().await;
        let shell = kernel.spawn(request("sh")).await.unwrap();
        let mut stdin = shell.take_stdin().unwrap();
        stdin
            .write("GREETING=hi\nexport OTHER=x\necho \"hi there\"\nenv | cat\ncd /bin\npwd\nnope\nexit 5\n")
            .await
            .unwrap();
        drop(stdin);
        let output = shell.output().await.unwrap();
        assert_eq!(output.status.code(), 5);
        assert_eq!(
            output.stdout_str(),
            "hi there\nGREETING=hi\nOTHER=x\nPATH=/bin\n/bin\n"
        );
        assert_eq!(output.stderr_str(), "sh: ENOTFOUND: command not found: nope\n");
    })
}

#[test]
fn listings_include_dot_entries() {
    Runtime::new().unwrap().block_on(async {
        let kernel = kernel().await;
        let plain = kernel.spawn(request("ls").arg("/")).await.unwrap();
        assert_eq!(plain.output().await.unwrap().stdout_str(), "bin/\n");
        let all = kernel
            .spawn(request("ls").args(vec!["-a", "/bin"]))
            .await
            .unwrap();
        let output = all.output().await.unwrap();
        let output = output.stdout_str();
        assert!(output.starts_with("./\n../\n"), "{:?}", output);
        assert!(output.contains("\nls.bin\n"), "{:?}", output);
    })
}
