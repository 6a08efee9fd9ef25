//! Delegate interface between the edgerun runtime and compute backends.
//!
//! A backend delegate executes a subset of a compiled model graph on behalf
//! of the runtime. The runtime discovers delegates through the registry,
//! calls [`BackendDelegate::init`] once per delegated-subgraph occurrence to
//! obtain an opaque handle, runs the handle with [`BackendDelegate::execute`]
//! zero or more times, and releases it exactly once with
//! [`BackendDelegate::destroy`]. All failures cross this boundary as typed
//! [`DelegateError`] values; nothing panics across it.

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::arena::{ArenaBox, ScopedArena};

/// Scalar element types carried by delegate argument tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F16,
    I32,
    I8,
    U8,
}

impl DType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F16 => 2,
            DType::I8 | DType::U8 => 1,
        }
    }
}

/// Owned tensor slot in a delegate argument list.
///
/// Output slots may start with a placeholder shape; the delegate resizes them
/// in place once the true shape is known after a run.
#[derive(Debug, Clone, PartialEq)]
pub struct ArgTensor {
    dtype: DType,
    dims: Vec<usize>,
    data: Vec<u8>,
}

impl ArgTensor {
    /// Zero-filled tensor of the given shape.
    pub fn new(dtype: DType, dims: &[usize]) -> Self {
        let mut tensor = Self {
            dtype,
            dims: Vec::new(),
            data: Vec::new(),
        };
        tensor.resize(dims);
        tensor
    }

    pub fn from_f32(dims: &[usize], values: &[f32]) -> Self {
        let mut tensor = Self::new(DType::F32, dims);
        debug_assert_eq!(tensor.element_count(), values.len());
        for (chunk, value) in tensor.data.chunks_exact_mut(4).zip(values) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        tensor
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn element_count(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn byte_len(&self) -> usize {
        self.element_count() * self.dtype.size_in_bytes()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Change the shape in place, reusing the existing storage where possible.
    /// Newly exposed bytes are zeroed.
    pub fn resize(&mut self, dims: &[usize]) {
        self.dims.clear();
        self.dims.extend_from_slice(dims);
        let byte_len = self.byte_len();
        self.data.resize(byte_len, 0);
    }

    /// Decode the storage as little-endian f32 values. `None` unless the
    /// tensor dtype is [`DType::F32`].
    pub fn to_f32_vec(&self) -> Option<Vec<f32>> {
        if self.dtype != DType::F32 {
            return None;
        }
        Some(
            self.data
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    I64(i64),
    F64(f64),
    Bool(bool),
}

/// Tagged argument slot supplied to [`BackendDelegate::execute`].
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Tensor(ArgTensor),
    Scalar(Scalar),
}

impl ArgValue {
    pub fn as_tensor(&self) -> Option<&ArgTensor> {
        match self {
            ArgValue::Tensor(tensor) => Some(tensor),
            ArgValue::Scalar(_) => None,
        }
    }

    pub fn as_tensor_mut(&mut self) -> Option<&mut ArgTensor> {
        match self {
            ArgValue::Tensor(tensor) => Some(tensor),
            ArgValue::Scalar(_) => None,
        }
    }
}

/// Opaque compile-time option forwarded to a delegate at `init`.
///
/// The runtime treats these as passthrough data owned by the pairing of
/// graph compiler and backend; delegates that do not understand a key are
/// free to ignore it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileSpec {
    pub key: String,
    pub value: Vec<u8>,
}

/// Serialized backend-specific subgraph, owned by the runtime until a
/// delegate consumes it during `init`.
///
/// The delegate must call [`ProcessedBlob::release`] exactly once before
/// `init` returns, on success and failure paths alike, so the runtime can
/// reclaim the serialized bytes early. `Drop` fires the release hook as a
/// backstop if a delegate failed to do so.
pub struct ProcessedBlob {
    bytes: Vec<u8>,
    released: bool,
    on_release: Option<Box<dyn FnOnce() + Send>>,
}

impl ProcessedBlob {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            released: false,
            on_release: None,
        }
    }

    /// Attach an observer invoked when the blob is released. Used by the
    /// runtime to reclaim the backing mapping, and by tests to count
    /// releases.
    pub fn with_release_hook(
        bytes: impl Into<Vec<u8>>,
        on_release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            bytes: bytes.into(),
            released: false,
            on_release: Some(Box::new(on_release)),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Signal that the serialized bytes are no longer needed. The backing
    /// storage is dropped and the release hook fires; later calls are no-ops.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.bytes = Vec::new();
        if let Some(on_release) = self.on_release.take() {
            on_release();
        }
    }
}

impl fmt::Debug for ProcessedBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessedBlob")
            .field("len", &self.bytes.len())
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for ProcessedBlob {
    fn drop(&mut self) {
        self.release();
    }
}

/// Per-`init` context. The scoped allocator it supplies outlives every
/// handle allocated from it.
pub struct BackendInitContext<'a> {
    arena: &'a ScopedArena,
}

impl<'a> BackendInitContext<'a> {
    pub fn new(arena: &'a ScopedArena) -> Self {
        Self { arena }
    }

    pub fn runtime_allocator(&self) -> &'a ScopedArena {
        self.arena
    }
}

/// Per-`execute` context. Supplies a scratch scope for delegates that stage
/// per-call temporaries; its contents do not survive the call.
pub struct BackendExecutionContext<'a> {
    temp: &'a ScopedArena,
}

impl<'a> BackendExecutionContext<'a> {
    pub fn new(temp: &'a ScopedArena) -> Self {
        Self { temp }
    }

    pub fn temp_allocator(&self) -> &'a ScopedArena {
        self.temp
    }
}

/// Opaque reference to one live execution plan, valid from a successful
/// `init` until the matching `destroy`.
pub struct DelegateHandle {
    plan: ArenaBox<dyn Any + Send>,
}

impl DelegateHandle {
    pub fn new(plan: ArenaBox<dyn Any + Send>) -> Self {
        Self { plan }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.plan.downcast_ref::<T>()
    }

    pub fn downcast_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.plan.downcast_mut::<T>()
    }
}

impl fmt::Debug for DelegateHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegateHandle").finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum DelegateError {
    #[error("scoped allocator exhausted while building {what}")]
    Allocation { what: &'static str },
    #[error("shared backend workspace unavailable, status {status:#06x}")]
    ResourceCreation { status: u32 },
    #[error("delegate compilation failed, status {status:#06x}")]
    Compile { status: u32 },
    #[error("delegate execution failed: {message}")]
    Execution { message: String },
    #[error("internal delegate error: {message}")]
    Internal { message: String },
}

impl DelegateError {
    pub fn allocation(what: &'static str) -> Self {
        DelegateError::Allocation { what }
    }

    pub fn resource_creation(status: u32) -> Self {
        DelegateError::ResourceCreation { status }
    }

    pub fn compile(status: u32) -> Self {
        DelegateError::Compile { status }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        DelegateError::Execution {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        DelegateError::Internal {
            message: message.into(),
        }
    }
}

/// Convenience alias for results returned by delegate operations.
pub type DelegateResult<T> = Result<T, DelegateError>;

/// Four-operation lifecycle contract implemented by every backend delegate.
///
/// All operations are synchronous and are driven by the runtime's own
/// threads; a delegate imposes no scheduling of its own. The runtime
/// guarantees at most one in-flight `execute` per handle. `init` and
/// `destroy` for different handles may run concurrently.
pub trait BackendDelegate: Send + Sync {
    /// Stable name this delegate registers under.
    fn name(&self) -> &str;

    /// Whether the backing compute library can currently be used. Safe to
    /// probe repeatedly; has no ordering dependency on the other operations.
    fn is_available(&self) -> bool;

    /// Turn a serialized subgraph into a runnable handle. The delegate must
    /// release `processed` exactly once before returning, and must never
    /// return a half-built handle: on failure everything allocated for the
    /// attempt is torn down first.
    fn init(
        &self,
        context: &BackendInitContext<'_>,
        processed: ProcessedBlob,
        compile_specs: &[CompileSpec],
    ) -> DelegateResult<DelegateHandle>;

    /// Run a handle against a fresh argument list: input slots first, then
    /// output slots. Output slots whose shapes are only known after the run
    /// are resized in place.
    fn execute(
        &self,
        context: &BackendExecutionContext<'_>,
        handle: &mut DelegateHandle,
        args: &mut [ArgValue],
    ) -> DelegateResult<()>;

    /// Release a handle. `None` is a no-op; a `Some` handle is finalized and
    /// its scoped allocation returned. This is the only legal release path
    /// for a live handle.
    fn destroy(&self, handle: Option<DelegateHandle>);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn blob_release_fires_hook_exactly_once() {
        let releases = Arc::new(AtomicUsize::new(0));
        let observer = Arc::clone(&releases);
        let mut blob = ProcessedBlob::with_release_hook(vec![1, 2, 3], move || {
            observer.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!blob.is_released());
        blob.release();
        blob.release();
        assert!(blob.is_released());
        assert!(blob.data().is_empty());
        drop(blob);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn blob_drop_backstops_missing_release() {
        let releases = Arc::new(AtomicUsize::new(0));
        let observer = Arc::clone(&releases);
        let blob = ProcessedBlob::with_release_hook(vec![7], move || {
            observer.fetch_add(1, Ordering::SeqCst);
        });

        drop(blob);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn tensor_resize_is_in_place_and_zero_fills() {
        let mut tensor = ArgTensor::from_f32(&[2], &[1.5, -2.0]);
        assert_eq!(tensor.byte_len(), 8);

        tensor.resize(&[2, 2]);
        assert_eq!(tensor.dims(), &[2, 2]);
        assert_eq!(tensor.byte_len(), 16);
        assert_eq!(
            tensor.to_f32_vec().unwrap(),
            vec![1.5, -2.0, 0.0, 0.0],
            "existing prefix is preserved and new bytes are zeroed"
        );

        tensor.resize(&[1]);
        assert_eq!(tensor.to_f32_vec().unwrap(), vec![1.5]);
    }

    #[test]
    fn scalar_slots_are_not_tensors() {
        let mut value = ArgValue::Scalar(Scalar::I64(9));
        assert!(value.as_tensor().is_none());
        assert!(value.as_tensor_mut().is_none());

        let mut tensor = ArgValue::Tensor(ArgTensor::new(DType::U8, &[3]));
        assert_eq!(tensor.as_tensor().unwrap().byte_len(), 3);
        assert!(tensor.as_tensor_mut().is_some());
    }
}
