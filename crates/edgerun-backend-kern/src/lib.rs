//! kern delegate backend.
//!
//! Registers under the fixed name `"kern"` and offloads delegated subgraphs
//! to the kern tensor-compute library. One shared scratch workspace is
//! created when the backend is constructed and amortized across every
//! delegate handle for the remainder of the process.

pub mod engine;
mod executor;
mod native;
pub mod workspace;

use std::sync::Arc;

use edgerun::backend::registry;
use edgerun::backend::spec::{
    ArgValue, BackendDelegate, BackendExecutionContext, BackendInitContext, CompileSpec,
    DelegateError, DelegateHandle, DelegateResult, ProcessedBlob,
};

use crate::engine::{status, ComputeEngine, EngineStatus};
use crate::executor::PlanExecutor;
use crate::workspace::{AccessPolicy, SharedWorkspace};

pub const BACKEND_NAME: &str = "kern";

pub struct KernBackend {
    engine: Arc<dyn ComputeEngine>,
    workspace: Option<Arc<SharedWorkspace>>,
    // status::OK when the workspace is live; otherwise the status that kept
    // it from being created, re-surfaced by every subsequent init.
    workspace_status: EngineStatus,
}

impl KernBackend {
    /// Backend over the native kern runtime, workspace guard policy taken
    /// from the environment.
    pub fn new() -> Self {
        Self::with_engine(native::native_engine(), workspace::policy_from_env())
    }

    /// Backend over an injected engine. There is no retry path: the engine
    /// is initialized and the shared workspace created here, once, and the
    /// outcome stands for the lifetime of this instance.
    pub fn with_engine(engine: Arc<dyn ComputeEngine>, policy: AccessPolicy) -> Self {
        let init = engine.initialize();
        if init != status::OK {
            tracing::error!("failed to initialize kern engine, status {init:#06x}");
            return Self {
                engine,
                workspace: None,
                workspace_status: init,
            };
        }

        match SharedWorkspace::create(engine.as_ref(), policy) {
            Ok(shared) => {
                tracing::debug!("created shared kern workspace");
                Self {
                    engine,
                    workspace: Some(Arc::new(shared)),
                    workspace_status: status::OK,
                }
            }
            Err(create) => {
                tracing::error!("failed to create shared kern workspace, status {create:#06x}");
                Self {
                    engine,
                    workspace: None,
                    workspace_status: create,
                }
            }
        }
    }

    fn build_executor(
        &self,
        context: &BackendInitContext<'_>,
        processed: &ProcessedBlob,
    ) -> DelegateResult<DelegateHandle> {
        let mut executor = context
            .runtime_allocator()
            .alloc(PlanExecutor::idle())
            .map_err(|_| DelegateError::allocation("kern plan executor"))?;

        let workspace = self.workspace.as_ref().ok_or_else(|| {
            tracing::error!(
                "kern workspace missing, status {:#06x}",
                self.workspace_status
            );
            DelegateError::resource_creation(self.workspace_status)
        })?;

        match self.engine.compile(processed.data(), workspace.raw()) {
            Ok(plan) => {
                executor.install(plan, Arc::clone(workspace));
                Ok(DelegateHandle::new(executor.erase()))
            }
            Err(compile) => {
                // The executor never became visible to the caller; tear it
                // down here since destroy() will not be called for it.
                drop(executor);
                tracing::error!("kern graph compilation failed, status {compile:#06x}");
                Err(DelegateError::compile(compile))
            }
        }
    }
}

impl Default for KernBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendDelegate for KernBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn is_available(&self) -> bool {
        self.engine.initialize() == status::OK
    }

    fn init(
        &self,
        context: &BackendInitContext<'_>,
        mut processed: ProcessedBlob,
        _compile_specs: &[CompileSpec],
    ) -> DelegateResult<DelegateHandle> {
        let result = self.build_executor(context, &processed);
        // The serialized graph is not needed once compilation has been
        // attempted; release it on success and failure paths alike.
        processed.release();
        result
    }

    fn execute(
        &self,
        _context: &BackendExecutionContext<'_>,
        handle: &mut DelegateHandle,
        args: &mut [ArgValue],
    ) -> DelegateResult<()> {
        let executor = handle.downcast_mut::<PlanExecutor>().ok_or_else(|| {
            DelegateError::internal("execute called with a handle not created by the kern backend")
        })?;

        executor.prepare_args(args)?;
        executor.forward()?;
        executor.resize_outputs(args)
    }

    fn destroy(&self, handle: Option<DelegateHandle>) {
        let Some(handle) = handle else {
            return;
        };
        #[cfg(feature = "plan-profiling")]
        if let Some(executor) = handle.downcast_ref::<PlanExecutor>() {
            executor.log_avg_timings();
        }
        drop(handle);
    }
}

/// Register the kern backend with the global delegate registry.
///
/// Invoked through the registry's registrar slice by
/// `edgerun::backend::registry::ensure_registered`, but can also be called
/// directly by start-up code.
pub fn register_kern_backend() {
    if let Err(err) = registry::register_delegate(BACKEND_NAME, Arc::new(KernBackend::new())) {
        tracing::debug!("kern backend registration skipped: {err}");
    }
}

#[edgerun::linkme::distributed_slice(edgerun::backend::registry::DELEGATE_REGISTRARS)]
static REGISTER_KERN_BACKEND: fn() = register_kern_backend;
