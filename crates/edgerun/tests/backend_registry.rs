use std::sync::Arc;

use edgerun::backend::registry::{
    ensure_registered, get_delegate, has_delegate, list_delegates, register_delegate,
    RegistryError,
};
use edgerun::backend::spec::{
    ArgValue, BackendDelegate, BackendExecutionContext, BackendInitContext, CompileSpec,
    DelegateError, DelegateHandle, DelegateResult, ProcessedBlob,
};

struct NullDelegate;

impl BackendDelegate for NullDelegate {
    fn name(&self) -> &str {
        "null"
    }

    fn is_available(&self) -> bool {
        false
    }

    fn init(
        &self,
        _context: &BackendInitContext<'_>,
        mut processed: ProcessedBlob,
        _compile_specs: &[CompileSpec],
    ) -> DelegateResult<DelegateHandle> {
        processed.release();
        Err(DelegateError::internal("null delegate has no compiler"))
    }

    fn execute(
        &self,
        _context: &BackendExecutionContext<'_>,
        _handle: &mut DelegateHandle,
        _args: &mut [ArgValue],
    ) -> DelegateResult<()> {
        Err(DelegateError::internal("null delegate has no executor"))
    }

    fn destroy(&self, _handle: Option<DelegateHandle>) {}
}

#[test]
fn test_delegate_registry() {
    // No backend crates are linked into this test; running the registrars is
    // still safe and must be idempotent.
    ensure_registered();
    ensure_registered();

    register_delegate("null", Arc::new(NullDelegate)).unwrap();

    let delegates = list_delegates();
    assert!(has_delegate("null"), "null delegate not registered");
    assert!(delegates.contains(&"null".to_string()));

    let delegate = get_delegate("null").expect("failed to resolve null delegate");
    assert_eq!(delegate.name(), "null");
    assert!(!delegate.is_available());

    // A name can be claimed once per process.
    let err = register_delegate("null", Arc::new(NullDelegate)).unwrap_err();
    assert!(matches!(err, RegistryError::DuplicateName { name } if name == "null"));

    assert!(!has_delegate("nonexistent"));
    assert!(get_delegate("nonexistent").is_none());
}
