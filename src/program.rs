//! Programs, and how the kernel turns an executable file into one

use crate::{
    errors::{ProcessError, SpawnError, VFSError},
    filesystem::{Driver, VPath},
    local::LocalProcess,
    protocol::WriteMode,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::{collections::BTreeMap, fmt, future::Future, pin::Pin, sync::Arc};

/// Code that runs inside a process
#[async_trait]
pub trait Program: Send + Sync + 'static {
    /// Run to completion, returning the exit status
    ///
    /// An `Err` is an uncaught fault, and the process exits with a fault
    /// status.
    async fn main(&self, process: LocalProcess) -> Result<i32, ProcessError>;
}

type BoxedMain =
    Box<dyn Fn(LocalProcess) -> Pin<Box<dyn Future<Output = Result<i32, ProcessError>> + Send>> + Send + Sync>;

/// [Program] made from an async closure
pub struct FnProgram {
    main: BoxedMain,
}

impl FnProgram {
    pub fn new<F, Fut>(main: F) -> Self
    where
        F: Fn(LocalProcess) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<i32, ProcessError>> + Send + 'static,
    {
        FnProgram {
            main: Box::new(move |process| Box::pin(main(process))),
        }
    }
}

#[async_trait]
impl Program for FnProgram {
    async fn main(&self, process: LocalProcess) -> Result<i32, ProcessError> {
        (self.main)(process).await
    }
}

/// Turns the content of an executable file into a runnable program
#[async_trait]
pub trait ContextFactory: Send + Sync + 'static {
    /// `locator` is where the image came from, `image` is the file's content
    async fn load(&self, locator: &str, image: Bytes) -> Result<Arc<dyn Program>, SpawnError>;
}

/// Prefix marking an executable file as a reference to a registered program
pub const STUB_PREFIX: &str = "#!";

/// Set of named programs, loadable from `#!name` stub files
#[derive(Default, Clone)]
pub struct ProgramRegistry {
    programs: BTreeMap<String, Arc<dyn Program>>,
}

impl fmt::Debug for ProgramRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set().entries(self.programs.keys()).finish()
    }
}

impl ProgramRegistry {
    pub fn new() -> Self {
        ProgramRegistry::default()
    }

    /// Add a program, replacing any earlier one with the same name
    pub fn register<S: Into<String>, P: Program>(&mut self, name: S, program: P) -> &mut Self {
        self.programs.insert(name.into(), Arc::new(program));
        self
    }

    /// Builder-style [ProgramRegistry::register()]
    pub fn with<S: Into<String>, P: Program>(mut self, name: S, program: P) -> Self {
        self.register(name, program);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Program>> {
        self.programs.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.programs.keys().map(String::as_str)
    }

    /// Content of the stub file that refers to `name`
    pub fn stub(name: &str) -> Bytes {
        Bytes::from(format!("{}{}\n", STUB_PREFIX, name))
    }

    /// Write a stub named `<name>.<extension>` into `dir` for every program
    pub async fn install(
        &self,
        fs: &dyn Driver,
        dir: &VPath,
        extension: &str,
    ) -> Result<(), VFSError> {
        for name in self.names() {
            let path = dir.join(&format!("{}.{}", name, extension));
            log::trace!("installing {}", path);
            let mut writer = fs.write_file(&path, WriteMode::Override, true).await?;
            writer.write(ProgramRegistry::stub(name)).await?;
            writer.close();
        }
        Ok(())
    }
}

#[async_trait]
impl ContextFactory for ProgramRegistry {
    async fn load(&self, locator: &str, image: Bytes) -> Result<Arc<dyn Program>, SpawnError> {
        let not_executable = || SpawnError::NotExecutable(locator.to_string());
        let first_line = image.split(|b| *b == b'\n').next().unwrap_or_default();
        let first_line = std::str::from_utf8(first_line).map_err(|_| not_executable())?;
        let name = first_line
            .strip_prefix(STUB_PREFIX)
            .map(str::trim)
            .ok_or_else(not_executable)?;
        self.get(name).ok_or_else(not_executable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{filesystem::MemoryFS, protocol::exit};
    use tokio::runtime::Runtime;

    fn registry() -> ProgramRegistry {
        ProgramRegistry::new()
            .with("ok", FnProgram::new(|_| async { Ok(exit::EXIT_OK) }))
            .with("fail", FnProgram::new(|_| async { Ok(exit::EXIT_FAILURE) }))
    }

    #[test]
    fn loads_stubs() {
        Runtime::new().unwrap().block_on(async {
            let registry = registry();
            assert!(registry.load("memory:///bin/ok.bin", Bytes::from("#!ok\n")).await.is_ok());
            assert!(registry.load("x", Bytes::from("#!fail")).await.is_ok());
            assert_eq!(
                registry.load("x", Bytes::from("#!nope\n")).await.err(),
                Some(SpawnError::NotExecutable("x".to_string()))
            );
            assert!(registry.load("x", Bytes::from("plain text")).await.is_err());
            assert!(registry.load("x", Bytes::from(vec![0xff, 0xfe])).await.is_err());
        });
    }

    #[test]
    fn installs_into_a_directory() {
        Runtime::new().unwrap().block_on(async {
            let fs = MemoryFS::new();
            registry().install(&fs, &VPath::parse("/bin"), "bin").await.unwrap();
            let mut reader = fs.read_file(&VPath::parse("/bin/ok.bin"), 0, None).await.unwrap();
            assert_eq!(reader.read_to_end().await.unwrap(), &b"#!ok\n"[..]);
            assert_eq!(fs.access(&VPath::parse("/bin/fail.bin")).await, Ok(true));
        });
    }
}
