//! Execution-plan wrapper living behind a delegate handle.

use std::sync::Arc;

#[cfg(feature = "plan-profiling")]
use std::time::{Duration, Instant};

use edgerun::backend::spec::{ArgValue, DelegateError, DelegateResult};

use crate::engine::ExecutionPlan;
use crate::workspace::SharedWorkspace;

/// One delegated subgraph's runnable state: the compiled kern plan, a
/// reference to the shared workspace it runs against, and run counters.
///
/// Allocated idle from the init context's scoped allocator and completed by
/// `install` once compilation succeeds, so a caller can never observe a
/// half-built plan.
pub struct PlanExecutor {
    state: Option<PlanState>,
    #[cfg(feature = "plan-profiling")]
    timings: RunTimings,
}

struct PlanState {
    plan: Box<dyn ExecutionPlan>,
    workspace: Arc<SharedWorkspace>,
}

#[cfg(feature = "plan-profiling")]
#[derive(Default)]
struct RunTimings {
    runs: u64,
    total: Duration,
}

impl PlanExecutor {
    /// Not-yet-compiled executor.
    pub(crate) fn idle() -> Self {
        Self {
            state: None,
            #[cfg(feature = "plan-profiling")]
            timings: RunTimings::default(),
        }
    }

    pub(crate) fn install(&mut self, plan: Box<dyn ExecutionPlan>, workspace: Arc<SharedWorkspace>) {
        self.state = Some(PlanState { plan, workspace });
    }

    fn compiled(&self) -> DelegateResult<&PlanState> {
        self.state
            .as_ref()
            .ok_or_else(|| DelegateError::internal("kern execution plan was never compiled"))
    }

    fn compiled_mut(&mut self) -> DelegateResult<&mut PlanState> {
        self.state
            .as_mut()
            .ok_or_else(|| DelegateError::internal("kern execution plan was never compiled"))
    }

    /// Bind a fresh argument list into the plan's input slots, propagating
    /// input shapes that vary call to call. Arity is `input_count` tensor
    /// slots followed by `output_count` tensor slots.
    pub(crate) fn prepare_args(&mut self, args: &[ArgValue]) -> DelegateResult<()> {
        let state = self.compiled_mut()?;
        let inputs = state.plan.input_count();
        let outputs = state.plan.output_count();
        if args.len() != inputs + outputs {
            return Err(DelegateError::execution(format!(
                "kern argument arity mismatch: plan expects {inputs} inputs and {outputs} outputs, got {} slots",
                args.len()
            )));
        }

        for (index, value) in args[..inputs].iter().enumerate() {
            let tensor = value.as_tensor().ok_or_else(|| {
                DelegateError::execution(format!("kern input slot {index} must be a tensor"))
            })?;
            state
                .plan
                .set_input(index, tensor.dtype(), tensor.dims(), tensor.data())
                .map_err(|status| {
                    DelegateError::execution(format!(
                        "failed to bind kern input {index}, status {status:#06x}"
                    ))
                })?;
        }
        Ok(())
    }

    /// Run the compiled plan while holding the shared workspace.
    pub(crate) fn forward(&mut self) -> DelegateResult<()> {
        #[cfg(feature = "plan-profiling")]
        let started = Instant::now();

        let run = {
            let state = self.compiled_mut()?;
            let workspace = Arc::clone(&state.workspace);
            let _held = workspace.acquire();
            state.plan.run()
        };
        run.map_err(|status| {
            DelegateError::execution(format!("kern forward run failed, status {status:#06x}"))
        })?;

        #[cfg(feature = "plan-profiling")]
        {
            self.timings.runs += 1;
            self.timings.total += started.elapsed();
        }
        Ok(())
    }

    /// Reconcile output slots whose shapes were only known after the run:
    /// resize each in place and copy the plan's output bytes out.
    pub(crate) fn resize_outputs(&self, args: &mut [ArgValue]) -> DelegateResult<()> {
        let state = self.compiled()?;
        let inputs = state.plan.input_count();
        for index in 0..state.plan.output_count() {
            let dims = state.plan.output_dims(index).map_err(|status| {
                DelegateError::execution(format!(
                    "failed to query kern output {index} shape, status {status:#06x}"
                ))
            })?;
            let slot = args
                .get_mut(inputs + index)
                .and_then(ArgValue::as_tensor_mut)
                .ok_or_else(|| {
                    DelegateError::execution(format!("kern output slot {index} must be a tensor"))
                })?;
            slot.resize(&dims);
            state
                .plan
                .read_output(index, slot.data_mut())
                .map_err(|status| {
                    DelegateError::execution(format!(
                        "failed to read kern output {index}, status {status:#06x}"
                    ))
                })?;
        }
        Ok(())
    }

    #[cfg(feature = "plan-profiling")]
    pub(crate) fn log_avg_timings(&self) {
        if self.timings.runs == 0 {
            return;
        }
        let avg = self.timings.total / self.timings.runs as u32;
        tracing::info!(
            "kern plan ran {} time(s), avg forward {:?}, total {:?}",
            self.timings.runs,
            avg,
            self.timings.total
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgerun::backend::spec::{ArgTensor, DType};

    #[test]
    fn idle_executor_rejects_every_operation() {
        let mut executor = PlanExecutor::idle();
        let mut args = vec![ArgValue::Tensor(ArgTensor::new(DType::F32, &[1]))];

        assert!(matches!(
            executor.prepare_args(&args),
            Err(DelegateError::Internal { .. })
        ));
        assert!(matches!(executor.forward(), Err(DelegateError::Internal { .. })));
        assert!(matches!(
            executor.resize_outputs(&mut args),
            Err(DelegateError::Internal { .. })
        ));
    }
}
