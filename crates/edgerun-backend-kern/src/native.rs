//! Runtime binding to the native kern compute library.
//!
//! The library is loaded once per process through `libloading` and its entry
//! points resolved into a typed symbol table. When the library cannot be
//! loaded the engine reports an unsupported-hardware status and the backend
//! stays registered but unavailable.

use std::ffi::c_void;
use std::sync::{Arc, OnceLock};

use libloading::Library;

use edgerun::backend::spec::DType;

use crate::engine::{status, ComputeEngine, EngineStatus, ExecutionPlan, RawWorkspace};

type KernStatus = u32;
type KernWorkspace = *mut c_void;
type KernPlan = *mut c_void;

type KernInitializeFn = unsafe extern "C" fn() -> KernStatus;
type KernCreateWorkspaceFn = unsafe extern "C" fn(workspace: *mut KernWorkspace) -> KernStatus;
type KernCompileGraphFn = unsafe extern "C" fn(
    data: *const u8,
    len: usize,
    workspace: KernWorkspace,
    plan: *mut KernPlan,
) -> KernStatus;
type KernPlanInputCountFn = unsafe extern "C" fn(plan: KernPlan) -> usize;
type KernPlanOutputCountFn = unsafe extern "C" fn(plan: KernPlan) -> usize;
type KernPlanSetInputFn = unsafe extern "C" fn(
    plan: KernPlan,
    index: usize,
    dtype: u32,
    rank: usize,
    dims: *const usize,
    data: *const u8,
    len: usize,
) -> KernStatus;
type KernPlanInvokeFn = unsafe extern "C" fn(plan: KernPlan) -> KernStatus;
type KernPlanOutputRankFn =
    unsafe extern "C" fn(plan: KernPlan, index: usize, rank: *mut usize) -> KernStatus;
type KernPlanOutputDimsFn =
    unsafe extern "C" fn(plan: KernPlan, index: usize, dims: *mut usize) -> KernStatus;
type KernPlanReadOutputFn =
    unsafe extern "C" fn(plan: KernPlan, index: usize, data: *mut u8, len: usize) -> KernStatus;
type KernPlanDestroyFn = unsafe extern "C" fn(plan: KernPlan);

struct RuntimeFns {
    initialize: KernInitializeFn,
    create_workspace: KernCreateWorkspaceFn,
    compile_graph: KernCompileGraphFn,
    plan_input_count: KernPlanInputCountFn,
    plan_output_count: KernPlanOutputCountFn,
    plan_set_input: KernPlanSetInputFn,
    plan_invoke: KernPlanInvokeFn,
    plan_output_rank: KernPlanOutputRankFn,
    plan_output_dims: KernPlanOutputDimsFn,
    plan_read_output: KernPlanReadOutputFn,
    plan_destroy: KernPlanDestroyFn,
}

struct LoadedRuntime {
    _lib: Library,
    fns: RuntimeFns,
}

impl LoadedRuntime {
    fn load() -> Result<Self, String> {
        let lib = load_kern_library()?;
        let fns = RuntimeFns {
            initialize: load_symbol(&lib, b"kern_initialize\0")?,
            create_workspace: load_symbol(&lib, b"kern_create_workspace\0")?,
            compile_graph: load_symbol(&lib, b"kern_compile_graph\0")?,
            plan_input_count: load_symbol(&lib, b"kern_plan_input_count\0")?,
            plan_output_count: load_symbol(&lib, b"kern_plan_output_count\0")?,
            plan_set_input: load_symbol(&lib, b"kern_plan_set_input\0")?,
            plan_invoke: load_symbol(&lib, b"kern_plan_invoke\0")?,
            plan_output_rank: load_symbol(&lib, b"kern_plan_output_rank\0")?,
            plan_output_dims: load_symbol(&lib, b"kern_plan_output_dims\0")?,
            plan_read_output: load_symbol(&lib, b"kern_plan_read_output\0")?,
            plan_destroy: load_symbol(&lib, b"kern_plan_destroy\0")?,
        };
        Ok(Self { _lib: lib, fns })
    }
}

static KERN_RUNTIME: OnceLock<Result<Arc<LoadedRuntime>, String>> = OnceLock::new();

fn runtime() -> Result<Arc<LoadedRuntime>, EngineStatus> {
    let loaded = KERN_RUNTIME.get_or_init(|| match LoadedRuntime::load() {
        Ok(runtime) => Ok(Arc::new(runtime)),
        Err(message) => Err(message),
    });
    match loaded {
        Ok(runtime) => Ok(Arc::clone(runtime)),
        Err(message) => {
            tracing::debug!("kern runtime unavailable: {message}");
            Err(status::UNSUPPORTED_HARDWARE)
        }
    }
}

/// Production engine backed by the process-wide kern runtime.
pub(crate) struct NativeEngine;

pub(crate) fn native_engine() -> Arc<dyn ComputeEngine> {
    Arc::new(NativeEngine)
}

impl ComputeEngine for NativeEngine {
    fn initialize(&self) -> EngineStatus {
        match runtime() {
            // SAFETY: No arguments; the entry point is documented idempotent.
            Ok(runtime) => unsafe { (runtime.fns.initialize)() },
            Err(load_status) => load_status,
        }
    }

    fn create_workspace(&self) -> Result<RawWorkspace, EngineStatus> {
        let runtime = runtime()?;
        let mut workspace: KernWorkspace = std::ptr::null_mut();
        // SAFETY: `workspace` is a valid out pointer for the call.
        let call = unsafe { (runtime.fns.create_workspace)(&mut workspace as *mut KernWorkspace) };
        check(call)?;
        if workspace.is_null() {
            return Err(status::INTERNAL_ERROR);
        }
        Ok(RawWorkspace::new(workspace as usize))
    }

    fn compile(
        &self,
        graph: &[u8],
        workspace: &RawWorkspace,
    ) -> Result<Box<dyn ExecutionPlan>, EngineStatus> {
        let runtime = runtime()?;
        let mut plan: KernPlan = std::ptr::null_mut();
        // SAFETY: The graph slice outlives the call and the workspace handle
        // was produced by `create_workspace` and is never released.
        let call = unsafe {
            (runtime.fns.compile_graph)(
                graph.as_ptr(),
                graph.len(),
                workspace.as_raw() as KernWorkspace,
                &mut plan as *mut KernPlan,
            )
        };
        check(call)?;
        if plan.is_null() {
            return Err(status::INTERNAL_ERROR);
        }
        Ok(Box::new(NativePlan {
            runtime,
            plan: plan as usize,
        }))
    }
}

struct NativePlan {
    runtime: Arc<LoadedRuntime>,
    // Stored as usize so the plan can satisfy the Send bound on ExecutionPlan.
    plan: usize,
}

impl NativePlan {
    fn plan_ptr(&self) -> KernPlan {
        self.plan as KernPlan
    }
}

impl Drop for NativePlan {
    fn drop(&mut self) {
        if self.plan != 0 {
            // SAFETY: Plan belongs to this runtime and is destroyed once on drop.
            unsafe { (self.runtime.fns.plan_destroy)(self.plan_ptr()) };
            self.plan = 0;
        }
    }
}

impl ExecutionPlan for NativePlan {
    fn input_count(&self) -> usize {
        // SAFETY: Plan pointer is live until drop.
        unsafe { (self.runtime.fns.plan_input_count)(self.plan_ptr()) }
    }

    fn output_count(&self) -> usize {
        // SAFETY: Plan pointer is live until drop.
        unsafe { (self.runtime.fns.plan_output_count)(self.plan_ptr()) }
    }

    fn set_input(
        &mut self,
        index: usize,
        dtype: DType,
        dims: &[usize],
        data: &[u8],
    ) -> Result<(), EngineStatus> {
        // SAFETY: dims/data slices are valid for the duration of the call.
        let call = unsafe {
            (self.runtime.fns.plan_set_input)(
                self.plan_ptr(),
                index,
                dtype_code(dtype),
                dims.len(),
                dims.as_ptr(),
                data.as_ptr(),
                data.len(),
            )
        };
        check(call)
    }

    fn run(&mut self) -> Result<(), EngineStatus> {
        // SAFETY: Plan pointer is live; inputs were staged by set_input.
        check(unsafe { (self.runtime.fns.plan_invoke)(self.plan_ptr()) })
    }

    fn output_dims(&self, index: usize) -> Result<Vec<usize>, EngineStatus> {
        let mut rank = 0usize;
        // SAFETY: `rank` is a valid out pointer.
        check(unsafe { (self.runtime.fns.plan_output_rank)(self.plan_ptr(), index, &mut rank) })?;
        let mut dims = vec![0usize; rank];
        // SAFETY: `dims` holds exactly `rank` elements as queried above.
        check(unsafe {
            (self.runtime.fns.plan_output_dims)(self.plan_ptr(), index, dims.as_mut_ptr())
        })?;
        Ok(dims)
    }

    fn read_output(&self, index: usize, out: &mut [u8]) -> Result<(), EngineStatus> {
        // SAFETY: `out` is valid and writable for `out.len()` bytes.
        check(unsafe {
            (self.runtime.fns.plan_read_output)(
                self.plan_ptr(),
                index,
                out.as_mut_ptr(),
                out.len(),
            )
        })
    }
}

fn check(call: KernStatus) -> Result<(), EngineStatus> {
    if call == status::OK {
        Ok(())
    } else {
        Err(call)
    }
}

fn dtype_code(dtype: DType) -> u32 {
    match dtype {
        DType::F32 => 0,
        DType::F16 => 1,
        DType::I32 => 2,
        DType::I8 => 3,
        DType::U8 => 4,
    }
}

fn load_kern_library() -> Result<Library, String> {
    for candidate in library_candidates() {
        // SAFETY: Dynamic library probe only; no symbols are invoked here.
        if let Ok(lib) = unsafe { Library::new(&candidate) } {
            return Ok(lib);
        }
    }
    Err(format!(
        "failed to load kern library (tried {})",
        library_candidates().join(", ")
    ))
}

fn library_candidates() -> Vec<String> {
    if let Ok(value) = std::env::var("EDGERUN_KERN_LIB") {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return vec![trimmed.to_string()];
        }
    }
    ["libkern.so.1", "libkern.so", "kern.dll", "libkern.dylib"]
        .iter()
        .map(|name| name.to_string())
        .collect()
}

fn load_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> Result<T, String> {
    // SAFETY: Caller provides the expected symbol type from the kern API.
    let sym = unsafe { lib.get::<T>(name) }.map_err(|err| {
        format!(
            "failed to resolve kern symbol {}: {err}",
            String::from_utf8_lossy(name)
        )
    })?;
    Ok(*sym)
}
