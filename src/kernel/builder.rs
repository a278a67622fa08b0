use crate::{
    errors::VFSError,
    filesystem::{Driver, MemoryFS, OverlayFS, VPath},
    kernel::Kernel,
    program::{ContextFactory, ProgramRegistry},
    stream::DEFAULT_HIGH_WATER_MARK,
};
use std::{sync::Arc, time::Duration};

/// Order in which `PATH` directories are searched for an entrypoint
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PathSearch {
    /// First matching directory in declaration order wins
    DeclarationOrder,
    /// Directories are tried last to first, so the last match wins
    ReverseOrder,
}

impl Default for PathSearch {
    fn default() -> Self {
        PathSearch::DeclarationOrder
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub high_water_mark: usize,
    pub grace_period: Duration,
    pub path_search: PathSearch,
    pub default_extension: String,
}

/// Setup for kernels, starting at [Kernel::builder()] and ending with
/// [KernelBuilder::build()]
pub struct KernelBuilder {
    settings: Settings,
    factory: Option<Arc<dyn ContextFactory>>,
    mounts: Vec<(VPath, Arc<dyn Driver>)>,
}

impl Default for KernelBuilder {
    fn default() -> Self {
        KernelBuilder::new()
    }
}

impl KernelBuilder {
    pub fn new() -> Self {
        KernelBuilder {
            settings: Settings {
                high_water_mark: DEFAULT_HIGH_WATER_MARK,
                grace_period: Duration::from_secs(5),
                path_search: PathSearch::default(),
                default_extension: "bin".to_string(),
            },
            factory: None,
            mounts: Vec::new(),
        }
    }

    /// Buffering limit for every process's stdio pipes, in bytes
    pub fn high_water_mark(mut self, bytes: usize) -> Self {
        self.settings.high_water_mark = bytes;
        self
    }

    /// How long an exiting process may wait for its in-flight syscalls
    ///
    /// Syscalls still pending after this long make the process exit with a
    /// fault status instead.
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.settings.grace_period = grace;
        self
    }

    pub fn path_search(mut self, order: PathSearch) -> Self {
        self.settings.path_search = order;
        self
    }

    /// Extension appended to entrypoint names that have none during `PATH` search
    pub fn default_extension<S: Into<String>>(mut self, extension: S) -> Self {
        self.settings.default_extension = extension.into();
        self
    }

    /// Loader that turns executable files into programs
    ///
    /// By default this is an empty [ProgramRegistry], which can't run anything.
    pub fn context_factory(mut self, factory: Arc<dyn ContextFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Mount a driver at `path` once the kernel is built
    ///
    /// If nothing is mounted at the root, an empty [MemoryFS] is.
    pub fn mount<P: Into<VPath>>(mut self, path: P, driver: Arc<dyn Driver>) -> Self {
        self.mounts.push((path.into(), driver));
        self
    }

    /// Construct a kernel using the settings in this builder
    pub fn build(self) -> Result<Arc<Kernel>, VFSError> {
        let vfs = Arc::new(OverlayFS::new());
        if !self.mounts.iter().any(|(path, _)| path.is_root()) {
            vfs.mount(&VPath::root(), Arc::new(MemoryFS::new()))?;
        }
        for (path, driver) in self.mounts {
            vfs.mount(&path, driver)?;
        }
        let factory = self
            .factory
            .unwrap_or_else(|| Arc::new(ProgramRegistry::new()));
        Ok(Arc::new(Kernel::new(vfs, factory, self.settings)))
    }
}
