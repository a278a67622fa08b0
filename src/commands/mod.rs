//! Bundled programs, enough to make a usable system

mod basic;
mod files;
mod sh;

use crate::{
    errors::VFSError,
    filesystem::{MemoryFS, VPath},
    kernel::{Kernel, KernelBuilder},
    local::{LocalProcess, STDERR},
    program::{FnProgram, ProgramRegistry},
};
use std::sync::Arc;

/// Where [boot()] installs the bundled programs
pub const BIN_DIR: &str = "/bin";

/// `PATH` that finds the bundled programs
pub const DEFAULT_PATH: &str = "/bin";

/// Report a problem on stderr, prefixed with the program's name
async fn complain(process: &LocalProcess, message: &str) {
    let line = format!("{}: {}\n", process.name(), message);
    if let Err(err) = process.write(STDERR, line).await {
        log::debug!("pid {} couldn't report an error, {}", process.pid(), err);
    }
}

/// Every bundled program, by name
pub fn registry() -> ProgramRegistry {
    ProgramRegistry::new()
        .with("cat", FnProgram::new(files::cat))
        .with("echo", FnProgram::new(basic::echo))
        .with("env", FnProgram::new(basic::env))
        .with("false", FnProgram::new(basic::fail))
        .with("ls", FnProgram::new(files::ls))
        .with("pwd", FnProgram::new(basic::pwd))
        .with("rm", FnProgram::new(files::rm))
        .with("sh", FnProgram::new(sh::sh))
        .with("sleep", FnProgram::new(basic::sleep))
        .with("tee", FnProgram::new(files::tee))
        .with("true", FnProgram::new(basic::succeed))
}

/// Build a kernel that runs the bundled programs
///
/// A fresh memory filesystem is mounted at [BIN_DIR] and filled with stubs
/// for every program, so nothing is written to the other mounts.
pub async fn boot(builder: KernelBuilder) -> Result<Arc<Kernel>, VFSError> {
    let registry = registry();
    let kernel = builder.context_factory(Arc::new(registry.clone())).build()?;
    let bin = VPath::parse(BIN_DIR);
    kernel.mount(bin.clone(), Arc::new(MemoryFS::new()))?;
    registry
        .install(&**kernel.vfs(), &bin, kernel.default_extension())
        .await?;
    Ok(kernel)
}
