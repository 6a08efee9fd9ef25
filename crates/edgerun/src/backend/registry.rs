//! Process-wide registry of backend delegates.
//!
//! The runtime's graph partitioner looks delegates up here by their fixed
//! names. Backend crates contribute a registrar function to
//! [`DELEGATE_REGISTRARS`]; application start-up code runs them all through
//! [`ensure_registered`] instead of relying on static-initialization
//! ordering. A name can be claimed once per process; re-registration is
//! rejected explicitly.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use thiserror::Error;

use super::spec::BackendDelegate;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("backend delegate '{name}' is already registered")]
    DuplicateName { name: String },
}

struct DelegateRegistry {
    delegates: RwLock<HashMap<String, Arc<dyn BackendDelegate>>>,
}

impl DelegateRegistry {
    fn new() -> Self {
        Self {
            delegates: RwLock::new(HashMap::new()),
        }
    }

    fn register(
        &self,
        name: String,
        delegate: Arc<dyn BackendDelegate>,
    ) -> Result<(), RegistryError> {
        let mut delegates = self.delegates.write().unwrap();
        if delegates.contains_key(&name) {
            return Err(RegistryError::DuplicateName { name });
        }
        delegates.insert(name, delegate);
        Ok(())
    }

    fn get(&self, name: &str) -> Option<Arc<dyn BackendDelegate>> {
        self.delegates.read().unwrap().get(name).cloned()
    }

    fn list(&self) -> Vec<String> {
        self.delegates.read().unwrap().keys().cloned().collect()
    }

    fn has(&self, name: &str) -> bool {
        self.delegates.read().unwrap().contains_key(name)
    }
}

static GLOBAL_REGISTRY: OnceLock<DelegateRegistry> = OnceLock::new();

fn global_registry() -> &'static DelegateRegistry {
    GLOBAL_REGISTRY.get_or_init(DelegateRegistry::new)
}

/// Registrar functions contributed by backend crates at link time.
#[linkme::distributed_slice]
pub static DELEGATE_REGISTRARS: [fn()] = [..];

static REGISTRARS_RUN: OnceLock<()> = OnceLock::new();

/// Run every contributed registrar exactly once. Call from application
/// start-up before resolving delegates by name.
pub fn ensure_registered() {
    REGISTRARS_RUN.get_or_init(|| {
        for registrar in DELEGATE_REGISTRARS.iter() {
            registrar();
        }
    });
}

/// Register one delegate instance under a fixed name.
///
/// Exactly one instance per backend exists per process; the registry owns it
/// for the remainder of the process lifetime.
pub fn register_delegate(
    name: impl Into<String>,
    delegate: Arc<dyn BackendDelegate>,
) -> Result<(), RegistryError> {
    global_registry().register(name.into(), delegate)
}

pub fn get_delegate(name: &str) -> Option<Arc<dyn BackendDelegate>> {
    global_registry().get(name)
}

pub fn list_delegates() -> Vec<String> {
    global_registry().list()
}

pub fn has_delegate(name: &str) -> bool {
    global_registry().has(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::{
        ArgValue, BackendDelegate, BackendExecutionContext, BackendInitContext, CompileSpec,
        DelegateError, DelegateHandle, DelegateResult, ProcessedBlob,
    };

    struct InertDelegate;

    impl BackendDelegate for InertDelegate {
        fn name(&self) -> &str {
            "inert"
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
            Err(DelegateError::internal("inert delegate cannot compile"))
        }

        fn execute(
            &self,
            _context: &BackendExecutionContext<'_>,
            _handle: &mut DelegateHandle,
            _args: &mut [ArgValue],
        ) -> DelegateResult<()> {
            Err(DelegateError::internal("inert delegate cannot execute"))
        }

        fn destroy(&self, _handle: Option<DelegateHandle>) {}
    }

    #[test]
    fn registration_round_trip() {
        register_delegate("inert-round-trip", Arc::new(InertDelegate)).unwrap();

        assert!(has_delegate("inert-round-trip"));
        assert!(list_delegates().contains(&"inert-round-trip".to_string()));
        let delegate = get_delegate("inert-round-trip").unwrap();
        assert_eq!(delegate.name(), "inert");
    }

    #[test]
    fn duplicate_names_are_rejected() {
        register_delegate("inert-duplicate", Arc::new(InertDelegate)).unwrap();
        let err = register_delegate("inert-duplicate", Arc::new(InertDelegate)).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateName { name } if name == "inert-duplicate"));
    }

    #[test]
    fn unknown_names_resolve_to_nothing() {
        assert!(!has_delegate("no-such-backend"));
        assert!(get_delegate("no-such-backend").is_none());
    }
}
