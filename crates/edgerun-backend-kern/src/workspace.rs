//! Shared scratch workspace for kern execution plans.
//!
//! One workspace is created per process, at backend construction, and every
//! delegate handle draws from it. It lives for the remainder of the process;
//! there is no release path. By default forward runs are not serialized
//! internally: the host runtime owns the decision to serialize
//! workspace-touching calls, and a mutex here would force unrelated model
//! executions through one gate. `EDGERUN_KERN_WORKSPACE_GUARD` opts into an
//! internal gate for hosts that want it.

use std::sync::{Mutex, MutexGuard, OnceLock};

use crate::engine::{ComputeEngine, EngineStatus, RawWorkspace};

/// How concurrent forward runs touching the shared workspace are serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessPolicy {
    /// No internal lock; the host runtime serializes workspace-touching
    /// calls when concurrent use is possible.
    #[default]
    Unguarded,
    /// Every forward run holds an internal mutex for its duration.
    Serialized,
}

#[derive(Debug)]
pub struct SharedWorkspace {
    raw: RawWorkspace,
    gate: Option<Mutex<()>>,
}

impl SharedWorkspace {
    pub fn create(engine: &dyn ComputeEngine, policy: AccessPolicy) -> Result<Self, EngineStatus> {
        let raw = engine.create_workspace()?;
        let gate = match policy {
            AccessPolicy::Unguarded => None,
            AccessPolicy::Serialized => Some(Mutex::new(())),
        };
        Ok(Self { raw, gate })
    }

    pub fn raw(&self) -> &RawWorkspace {
        &self.raw
    }

    pub fn policy(&self) -> AccessPolicy {
        if self.gate.is_some() {
            AccessPolicy::Serialized
        } else {
            AccessPolicy::Unguarded
        }
    }

    /// Hold the workspace for one forward run. Under
    /// [`AccessPolicy::Unguarded`] this is free and never blocks.
    pub fn acquire(&self) -> WorkspaceGuard<'_> {
        WorkspaceGuard {
            _gate: self
                .gate
                .as_ref()
                .map(|gate| gate.lock().expect("workspace gate poisoned")),
        }
    }
}

pub struct WorkspaceGuard<'a> {
    _gate: Option<MutexGuard<'a, ()>>,
}

/// Access policy selected by the environment, resolved once per process.
pub fn policy_from_env() -> AccessPolicy {
    static POLICY: OnceLock<AccessPolicy> = OnceLock::new();
    *POLICY.get_or_init(|| match std::env::var("EDGERUN_KERN_WORKSPACE_GUARD") {
        Ok(value) if !value.trim().is_empty() => parse_policy(&value),
        _ => AccessPolicy::Unguarded,
    })
}

fn parse_policy(value: &str) -> AccessPolicy {
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "1" | "true" | "yes" | "on" | "serialize" | "serialized" => AccessPolicy::Serialized,
        _ => AccessPolicy::Unguarded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{status, ExecutionPlan};

    struct FixedEngine {
        workspace: Result<usize, EngineStatus>,
    }

    impl ComputeEngine for FixedEngine {
        fn initialize(&self) -> EngineStatus {
            status::OK
        }

        fn create_workspace(&self) -> Result<RawWorkspace, EngineStatus> {
            self.workspace.map(RawWorkspace::new)
        }

        fn compile(
            &self,
            _graph: &[u8],
            _workspace: &RawWorkspace,
        ) -> Result<Box<dyn ExecutionPlan>, EngineStatus> {
            Err(status::INVALID_STATE)
        }
    }

    #[test]
    fn parse_policy_accepts_boolean_and_named_forms() {
        assert_eq!(parse_policy("serialize"), AccessPolicy::Serialized);
        assert_eq!(parse_policy(" SERIALIZED "), AccessPolicy::Serialized);
        assert_eq!(parse_policy("on"), AccessPolicy::Serialized);
        assert_eq!(parse_policy("1"), AccessPolicy::Serialized);
        assert_eq!(parse_policy("off"), AccessPolicy::Unguarded);
        assert_eq!(parse_policy("garbage"), AccessPolicy::Unguarded);
    }

    #[test]
    fn create_propagates_engine_failure() {
        let engine = FixedEngine {
            workspace: Err(status::OUT_OF_MEMORY),
        };
        let err = SharedWorkspace::create(&engine, AccessPolicy::Unguarded).unwrap_err();
        assert_eq!(err, status::OUT_OF_MEMORY);
    }

    #[test]
    fn guard_reflects_policy() {
        let engine = FixedEngine {
            workspace: Ok(0x40),
        };

        let unguarded = SharedWorkspace::create(&engine, AccessPolicy::Unguarded).unwrap();
        assert_eq!(unguarded.policy(), AccessPolicy::Unguarded);
        let first = unguarded.acquire();
        // Without a gate, overlapping acquires are permitted.
        let second = unguarded.acquire();
        drop((first, second));

        let serialized = SharedWorkspace::create(&engine, AccessPolicy::Serialized).unwrap();
        assert_eq!(serialized.policy(), AccessPolicy::Serialized);
        assert_eq!(serialized.raw().as_raw(), 0x40);
        drop(serialized.acquire());
    }
}
