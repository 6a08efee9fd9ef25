//! Boundary with the kern tensor-compute library.
//!
//! Everything the delegate needs from the native library goes through
//! [`ComputeEngine`] and [`ExecutionPlan`], so the engine (and with it the
//! shared workspace it hands out) is injectable: production code binds the
//! native runtime, tests script a stub.

use edgerun::backend::spec::DType;

/// Status code as surfaced by kern runtime entry points. Zero is success;
/// failure codes are logged in hexadecimal.
pub type EngineStatus = u32;

pub mod status {
    use super::EngineStatus;

    pub const OK: EngineStatus = 0x0000;
    pub const UNSUPPORTED_HARDWARE: EngineStatus = 0x0001;
    pub const OUT_OF_MEMORY: EngineStatus = 0x0002;
    pub const INVALID_PARAMETER: EngineStatus = 0x0003;
    pub const INVALID_STATE: EngineStatus = 0x0004;
    pub const INTERNAL_ERROR: EngineStatus = 0x0005;
}

/// Opaque scratch-memory handle created by the engine.
///
/// The native pointer is stored as usize so workspace owners can satisfy
/// Send/Sync bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawWorkspace(usize);

impl RawWorkspace {
    pub fn new(raw: usize) -> Self {
        Self(raw)
    }

    pub fn as_raw(&self) -> usize {
        self.0
    }
}

/// Entry points of the kern compute library used by the delegate.
pub trait ComputeEngine: Send + Sync {
    /// Bring the engine up. The native entry point is idempotent: probing
    /// repeatedly is safe, leaks nothing, and reports the same status for a
    /// fixed environment.
    fn initialize(&self) -> EngineStatus;

    /// Create a scratch workspace that execution plans amortize across
    /// compilations and runs.
    fn create_workspace(&self) -> Result<RawWorkspace, EngineStatus>;

    /// Compile a serialized subgraph into a runnable plan bound to the given
    /// workspace. The graph encoding is owned by the kern compiler tooling
    /// and is opaque on this side of the boundary.
    fn compile(
        &self,
        graph: &[u8],
        workspace: &RawWorkspace,
    ) -> Result<Box<dyn ExecutionPlan>, EngineStatus>;
}

/// One compiled, runnable subgraph plus its argument-binding surface.
pub trait ExecutionPlan: Send {
    fn input_count(&self) -> usize;

    fn output_count(&self) -> usize;

    /// Stage one input, propagating shapes that vary call to call.
    fn set_input(
        &mut self,
        index: usize,
        dtype: DType,
        dims: &[usize],
        data: &[u8],
    ) -> Result<(), EngineStatus>;

    fn run(&mut self) -> Result<(), EngineStatus>;

    /// Shape of an output; only final once `run` has completed.
    fn output_dims(&self, index: usize) -> Result<Vec<usize>, EngineStatus>;

    /// Copy an output into `out`, which must hold exactly the output's byte
    /// length.
    fn read_output(&self, index: usize, out: &mut [u8]) -> Result<(), EngineStatus>;
}
