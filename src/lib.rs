//! A minimal multi-process operating environment
//!
//! A [Kernel] owns a table of processes and an overlay of filesystem
//! drivers. Each process runs in its own task and reaches the kernel only
//! by sending syscalls over a message channel, while its stdio are
//! backpressured byte pipes that can be chained into pipelines.

#[macro_use]
extern crate serde;

pub use minikernel_protocol as protocol;

pub mod commands;
pub mod errors;
pub mod filesystem;
pub mod pipeline;
pub mod rpc;
pub mod stream;
pub mod transfer;

mod ipcserver;
mod kernel;
mod local;
mod process;
mod program;
mod taskcall;
mod validate;

pub use crate::{
    kernel::{HostSpawner, Kernel, KernelBuilder, PathSearch},
    local::{Bootstrap, LocalProcess, SpawnOptions, STDERR, STDIN, STDOUT},
    process::{ExitStatus, Output, ProcessHandle, ProcessState},
    program::{ContextFactory, FnProgram, Program, ProgramRegistry, STUB_PREFIX},
    transfer::Spawned,
};
