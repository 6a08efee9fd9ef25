//! Delegate lifecycle conformance checks, driven against a kern backend
//! wired to the scriptable stub engine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use edgerun::backend::arena::ScopedArena;
use edgerun::backend::spec::{
    ArgTensor, ArgValue, BackendDelegate, BackendExecutionContext, BackendInitContext, CompileSpec,
    DType, DelegateError, DelegateHandle, ProcessedBlob, Scalar,
};
use edgerun_backend_kern::engine::status;
use edgerun_backend_kern::workspace::AccessPolicy;
use edgerun_backend_kern::KernBackend;

use crate::stub_engine::{graph_blob, StubEngine, StubOp};

fn counted_blob(bytes: Vec<u8>, releases: &Arc<AtomicUsize>) -> ProcessedBlob {
    let observer = Arc::clone(releases);
    ProcessedBlob::with_release_hook(bytes, move || {
        observer.fetch_add(1, Ordering::SeqCst);
    })
}

fn init_handle(
    backend: &KernBackend,
    arena: &ScopedArena,
    blob: ProcessedBlob,
) -> DelegateHandle {
    let context = BackendInitContext::new(arena);
    backend
        .init(&context, blob, &[])
        .expect("init should succeed for a well-formed graph")
}

fn execute(
    backend: &KernBackend,
    handle: &mut DelegateHandle,
    args: &mut [ArgValue],
) -> Result<(), DelegateError> {
    let temp = ScopedArena::new();
    let context = BackendExecutionContext::new(&temp);
    backend.execute(&context, handle, args)
}

pub fn availability_probe_is_idempotent() {
    let engine = StubEngine::working();
    let backend = KernBackend::with_engine(engine.clone(), AccessPolicy::Unguarded);
    let constructed = engine.init_calls();

    for _ in 0..5 {
        assert!(backend.is_available());
    }

    assert_eq!(engine.init_calls(), constructed + 5);
    assert_eq!(
        engine.workspaces_created(),
        1,
        "probing availability must not touch workspace state"
    );
}

/// When the compute library cannot initialize at all, availability is
/// false and every init fails fast with the recorded status.
pub fn unavailable_engine_fails_init_fast() {
    let engine = StubEngine::failing_init(status::UNSUPPORTED_HARDWARE);
    let backend = KernBackend::with_engine(engine.clone(), AccessPolicy::Unguarded);

    assert!(!backend.is_available());
    assert_eq!(engine.workspaces_created(), 0);

    let arena = ScopedArena::new();
    let context = BackendInitContext::new(&arena);
    let releases = Arc::new(AtomicUsize::new(0));
    let blob = counted_blob(graph_blob(StubOp::Copy, 1, 1), &releases);

    let err = backend.init(&context, blob, &[]).unwrap_err();
    assert!(matches!(
        err,
        DelegateError::ResourceCreation {
            status: status::UNSUPPORTED_HARDWARE
        }
    ));
    assert_eq!(releases.load(Ordering::SeqCst), 1);
    assert_eq!(arena.live(), 0);
}

/// The engine comes up but workspace creation fails: the backend stays
/// available while every init is refused with the recorded status.
pub fn workspace_creation_failure_surfaces_on_init() {
    let engine = StubEngine::failing_workspace(status::OUT_OF_MEMORY);
    let backend = KernBackend::with_engine(engine, AccessPolicy::Unguarded);

    assert!(backend.is_available());

    let arena = ScopedArena::new();
    let context = BackendInitContext::new(&arena);
    for _ in 0..2 {
        let releases = Arc::new(AtomicUsize::new(0));
        let blob = counted_blob(graph_blob(StubOp::Copy, 1, 1), &releases);
        let err = backend.init(&context, blob, &[]).unwrap_err();
        assert!(matches!(
            err,
            DelegateError::ResourceCreation {
                status: status::OUT_OF_MEMORY
            }
        ));
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }
    assert_eq!(arena.live(), 0);
}

/// Full lifecycle: one handle, two executions with fresh bindings, one
/// destroy that returns the handle's allocation.
pub fn lifecycle_roundtrip_executes_twice() {
    let engine = StubEngine::working();
    let backend = KernBackend::with_engine(engine, AccessPolicy::Unguarded);
    assert!(backend.is_available());

    let arena = ScopedArena::new();
    let releases = Arc::new(AtomicUsize::new(0));
    let context = BackendInitContext::new(&arena);
    let opaque_spec = CompileSpec {
        key: "kern/tuning".to_string(),
        value: vec![0xde, 0xad],
    };
    let mut handle = backend
        .init(
            &context,
            counted_blob(graph_blob(StubOp::Scale2, 1, 1), &releases),
            &[opaque_spec],
        )
        .expect("init");
    assert_eq!(releases.load(Ordering::SeqCst), 1);
    assert_eq!(arena.live(), 1);

    let mut args = vec![
        ArgValue::Tensor(ArgTensor::from_f32(&[2, 2], &[1.0, 2.0, 3.0, 4.0])),
        ArgValue::Tensor(ArgTensor::new(DType::F32, &[])),
    ];
    execute(&backend, &mut handle, &mut args).expect("first execute");
    let output = args[1].as_tensor().unwrap();
    assert_eq!(output.dims(), &[2, 2]);
    assert_eq!(output.to_f32_vec().unwrap(), vec![2.0, 4.0, 6.0, 8.0]);

    // Fresh bindings each call: a different shape and payload goes through
    // the same handle.
    args[0] = ArgValue::Tensor(ArgTensor::from_f32(&[3], &[-1.0, 0.5, 10.0]));
    execute(&backend, &mut handle, &mut args).expect("second execute");
    let output = args[1].as_tensor().unwrap();
    assert_eq!(output.dims(), &[3]);
    assert_eq!(output.to_f32_vec().unwrap(), vec![-2.0, 1.0, 20.0]);

    backend.destroy(Some(handle));
    assert_eq!(arena.live(), 0, "destroy returns the handle's allocation");
}

/// A corrupt graph fails compilation without leaking the attempted
/// handle, and the blob is released exactly once.
pub fn compile_failure_releases_blob_and_handle() {
    let engine = StubEngine::working();
    let backend = KernBackend::with_engine(engine, AccessPolicy::Unguarded);

    let arena = ScopedArena::with_capacity(4);
    let context = BackendInitContext::new(&arena);
    let releases = Arc::new(AtomicUsize::new(0));
    let blob = counted_blob(b"definitely not a kern graph".to_vec(), &releases);

    let err = backend.init(&context, blob, &[]).unwrap_err();
    assert!(matches!(
        err,
        DelegateError::Compile {
            status: status::INVALID_PARAMETER
        }
    ));
    assert_eq!(releases.load(Ordering::SeqCst), 1);
    assert_eq!(arena.live(), 0, "no allocation survives a failed init");
    assert_eq!(arena.allocated(), 1, "the executor was allocated, then torn down");
}

/// Allocator exhaustion aborts init before anything is built; the blob is
/// still released.
pub fn allocator_exhaustion_aborts_init() {
    let engine = StubEngine::working();
    let backend = KernBackend::with_engine(engine.clone(), AccessPolicy::Unguarded);

    let arena = ScopedArena::with_capacity(0);
    let context = BackendInitContext::new(&arena);
    let releases = Arc::new(AtomicUsize::new(0));
    let blob = counted_blob(graph_blob(StubOp::Copy, 1, 1), &releases);

    let err = backend.init(&context, blob, &[]).unwrap_err();
    assert!(matches!(err, DelegateError::Allocation { .. }));
    assert_eq!(releases.load(Ordering::SeqCst), 1);
    assert_eq!(
        engine.compiled_workspaces().len(),
        0,
        "nothing was compiled for an aborted init"
    );
}

/// Every handle observes the identical shared workspace, created at most
/// once, and sequential executions on different handles stay independent.
pub fn handles_share_one_workspace() {
    let engine = StubEngine::working();
    let backend = KernBackend::with_engine(engine.clone(), AccessPolicy::Unguarded);

    let arena = ScopedArena::new();
    let mut first = init_handle(&backend, &arena, ProcessedBlob::new(graph_blob(StubOp::Scale2, 1, 1)));
    let mut second = init_handle(&backend, &arena, ProcessedBlob::new(graph_blob(StubOp::Sum, 2, 1)));

    assert_eq!(engine.workspaces_created(), 1);
    let observed = engine.compiled_workspaces();
    assert_eq!(observed.len(), 2);
    assert_eq!(observed[0], observed[1], "both compilations saw one workspace");

    let mut first_args = vec![
        ArgValue::Tensor(ArgTensor::from_f32(&[2], &[4.0, 5.0])),
        ArgValue::Tensor(ArgTensor::new(DType::F32, &[])),
    ];
    execute(&backend, &mut first, &mut first_args).expect("first handle");
    assert_eq!(
        first_args[1].as_tensor().unwrap().to_f32_vec().unwrap(),
        vec![8.0, 10.0]
    );

    let mut second_args = vec![
        ArgValue::Tensor(ArgTensor::from_f32(&[2], &[1.0, 2.0])),
        ArgValue::Tensor(ArgTensor::from_f32(&[2], &[10.0, 20.0])),
        ArgValue::Tensor(ArgTensor::new(DType::F32, &[])),
    ];
    execute(&backend, &mut second, &mut second_args).expect("second handle");
    assert_eq!(
        second_args[2].as_tensor().unwrap().to_f32_vec().unwrap(),
        vec![11.0, 22.0]
    );

    backend.destroy(Some(first));
    backend.destroy(Some(second));
    assert_eq!(arena.live(), 0);
}

/// Destroying a null handle is a no-op and never fails.
pub fn destroy_null_handle_is_noop() {
    let engine = StubEngine::working();
    let backend = KernBackend::with_engine(engine, AccessPolicy::Unguarded);
    backend.destroy(None);
    backend.destroy(None);
}

/// Execute updates every output slot in place without reallocating the
/// argument array itself.
pub fn output_slots_resized_in_place() {
    let engine = StubEngine::working();
    let backend = KernBackend::with_engine(engine, AccessPolicy::Unguarded);

    let arena = ScopedArena::new();
    let mut handle = init_handle(&backend, &arena, ProcessedBlob::new(graph_blob(StubOp::Copy, 2, 2)));

    let mut args = vec![
        ArgValue::Tensor(ArgTensor::from_f32(&[1, 3], &[7.0, 8.0, 9.0])),
        ArgValue::Tensor(ArgTensor::from_f32(&[2], &[0.25, 0.75])),
        ArgValue::Tensor(ArgTensor::new(DType::F32, &[])),
        ArgValue::Tensor(ArgTensor::new(DType::F32, &[])),
    ];
    let slots_before = args.as_ptr();

    execute(&backend, &mut handle, &mut args).expect("execute");

    assert!(std::ptr::eq(slots_before, args.as_ptr()));
    assert_eq!(args.len(), 4);
    let first_out = args[2].as_tensor().unwrap();
    assert_eq!(first_out.dims(), &[1, 3]);
    assert_eq!(first_out.to_f32_vec().unwrap(), vec![7.0, 8.0, 9.0]);
    let second_out = args[3].as_tensor().unwrap();
    assert_eq!(second_out.dims(), &[2]);
    assert_eq!(second_out.to_f32_vec().unwrap(), vec![0.25, 0.75]);

    backend.destroy(Some(handle));
}

/// After a failed execute the handle's status is unknown; it must still be
/// legal to destroy it.
pub fn execution_failure_leaves_handle_destroyable() {
    let engine = StubEngine::working();
    let backend = KernBackend::with_engine(engine, AccessPolicy::Unguarded);

    let arena = ScopedArena::new();
    let mut handle = init_handle(&backend, &arena, ProcessedBlob::new(graph_blob(StubOp::Sum, 2, 1)));

    // Mismatched input shapes make the forward run fail.
    let mut args = vec![
        ArgValue::Tensor(ArgTensor::from_f32(&[2], &[1.0, 2.0])),
        ArgValue::Tensor(ArgTensor::from_f32(&[3], &[1.0, 2.0, 3.0])),
        ArgValue::Tensor(ArgTensor::new(DType::F32, &[])),
    ];
    let err = execute(&backend, &mut handle, &mut args).unwrap_err();
    assert!(matches!(err, DelegateError::Execution { .. }));

    backend.destroy(Some(handle));
    assert_eq!(arena.live(), 0);
}

pub fn argument_arity_mismatch_is_reported() {
    let engine = StubEngine::working();
    let backend = KernBackend::with_engine(engine, AccessPolicy::Unguarded);

    let arena = ScopedArena::new();
    let mut handle = init_handle(&backend, &arena, ProcessedBlob::new(graph_blob(StubOp::Copy, 1, 1)));

    let mut args = vec![ArgValue::Tensor(ArgTensor::from_f32(&[1], &[1.0]))];
    let err = execute(&backend, &mut handle, &mut args).unwrap_err();
    assert!(matches!(err, DelegateError::Execution { .. }));

    backend.destroy(Some(handle));
}

pub fn scalar_in_input_slot_is_rejected() {
    let engine = StubEngine::working();
    let backend = KernBackend::with_engine(engine, AccessPolicy::Unguarded);

    let arena = ScopedArena::new();
    let mut handle = init_handle(&backend, &arena, ProcessedBlob::new(graph_blob(StubOp::Copy, 1, 1)));

    let mut args = vec![
        ArgValue::Scalar(Scalar::I64(3)),
        ArgValue::Tensor(ArgTensor::new(DType::F32, &[])),
    ];
    let err = execute(&backend, &mut handle, &mut args).unwrap_err();
    assert!(matches!(err, DelegateError::Execution { .. }));

    backend.destroy(Some(handle));
}

/// A serialized workspace gate still yields correct results for interleaved
/// handles; the policy only changes who holds the gate during a run.
pub fn serialized_policy_executes_correctly() {
    let engine = StubEngine::working();
    let backend = KernBackend::with_engine(engine, AccessPolicy::Serialized);

    let arena = ScopedArena::new();
    let mut handle = init_handle(&backend, &arena, ProcessedBlob::new(graph_blob(StubOp::Scale2, 1, 1)));

    let mut args = vec![
        ArgValue::Tensor(ArgTensor::from_f32(&[2], &[6.0, -3.0])),
        ArgValue::Tensor(ArgTensor::new(DType::F32, &[])),
    ];
    execute(&backend, &mut handle, &mut args).expect("execute under gate");
    assert_eq!(
        args[1].as_tensor().unwrap().to_f32_vec().unwrap(),
        vec![12.0, -6.0]
    );

    backend.destroy(Some(handle));
}
