//! Scriptable compute engine for exercising the delegate lifecycle without
//! the native kern runtime.
//!
//! The stub consumes a small framed graph encoding of its own and evaluates
//! a handful of deterministic f32 operations, so suite tests can verify that
//! executed outputs reflect real computation. It also counts every entry
//! point and records which workspace each compilation observed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use edgerun::backend::spec::DType;
use edgerun_backend_kern::engine::{
    status, ComputeEngine, EngineStatus, ExecutionPlan, RawWorkspace,
};

const GRAPH_MAGIC: &[u8; 4] = b"KERN";
const GRAPH_VERSION: u8 = 1;

/// Operation encoded in a stub graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubOp {
    /// Each output mirrors the input with the same index (modulo arity).
    Copy,
    /// Each output is the matching input with every f32 element doubled.
    Scale2,
    /// The single output is the elementwise sum of all inputs.
    Sum,
}

impl StubOp {
    fn code(self) -> u8 {
        match self {
            StubOp::Copy => 0,
            StubOp::Scale2 => 1,
            StubOp::Sum => 2,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(StubOp::Copy),
            1 => Some(StubOp::Scale2),
            2 => Some(StubOp::Sum),
            _ => None,
        }
    }
}

/// Serialize a well-formed stub graph.
pub fn graph_blob(op: StubOp, inputs: u8, outputs: u8) -> Vec<u8> {
    let mut blob = Vec::with_capacity(8);
    blob.extend_from_slice(GRAPH_MAGIC);
    blob.push(GRAPH_VERSION);
    blob.push(op.code());
    blob.push(inputs);
    blob.push(outputs);
    blob
}

pub struct StubEngine {
    init_status: EngineStatus,
    workspace_status: EngineStatus,
    init_calls: AtomicUsize,
    workspaces_created: AtomicUsize,
    compiled_workspaces: Mutex<Vec<usize>>,
}

impl StubEngine {
    pub fn working() -> Arc<Self> {
        Arc::new(Self::with_statuses(status::OK, status::OK))
    }

    pub fn failing_init(init_status: EngineStatus) -> Arc<Self> {
        Arc::new(Self::with_statuses(init_status, status::OK))
    }

    pub fn failing_workspace(workspace_status: EngineStatus) -> Arc<Self> {
        Arc::new(Self::with_statuses(status::OK, workspace_status))
    }

    fn with_statuses(init_status: EngineStatus, workspace_status: EngineStatus) -> Self {
        Self {
            init_status,
            workspace_status,
            init_calls: AtomicUsize::new(0),
            workspaces_created: AtomicUsize::new(0),
            compiled_workspaces: Mutex::new(Vec::new()),
        }
    }

    /// How many times `initialize` has been probed.
    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn workspaces_created(&self) -> usize {
        self.workspaces_created.load(Ordering::SeqCst)
    }

    /// Workspace identity observed by each compilation, in order.
    pub fn compiled_workspaces(&self) -> Vec<usize> {
        self.compiled_workspaces.lock().unwrap().clone()
    }
}

impl ComputeEngine for StubEngine {
    fn initialize(&self) -> EngineStatus {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        self.init_status
    }

    fn create_workspace(&self) -> Result<RawWorkspace, EngineStatus> {
        if self.workspace_status != status::OK {
            return Err(self.workspace_status);
        }
        let ordinal = self.workspaces_created.fetch_add(1, Ordering::SeqCst);
        Ok(RawWorkspace::new(0x1000 + ordinal))
    }

    fn compile(
        &self,
        graph: &[u8],
        workspace: &RawWorkspace,
    ) -> Result<Box<dyn ExecutionPlan>, EngineStatus> {
        self.compiled_workspaces
            .lock()
            .unwrap()
            .push(workspace.as_raw());
        let plan = StubPlan::parse(graph)?;
        Ok(Box::new(plan))
    }
}

#[derive(Debug)]
struct StagedInput {
    dims: Vec<usize>,
    values: Vec<f32>,
}

#[derive(Debug)]
struct StagedOutput {
    dims: Vec<usize>,
    data: Vec<u8>,
}

#[derive(Debug)]
pub struct StubPlan {
    op: StubOp,
    input_count: usize,
    output_count: usize,
    inputs: Vec<Option<StagedInput>>,
    outputs: Vec<StagedOutput>,
}

impl StubPlan {
    fn parse(graph: &[u8]) -> Result<Self, EngineStatus> {
        if graph.len() != 8 || &graph[..4] != GRAPH_MAGIC || graph[4] != GRAPH_VERSION {
            return Err(status::INVALID_PARAMETER);
        }
        let op = StubOp::from_code(graph[5]).ok_or(status::INVALID_PARAMETER)?;
        let input_count = graph[6] as usize;
        let output_count = graph[7] as usize;
        if input_count == 0 || output_count == 0 {
            return Err(status::INVALID_PARAMETER);
        }
        if op == StubOp::Sum && output_count != 1 {
            return Err(status::INVALID_PARAMETER);
        }
        let mut inputs = Vec::with_capacity(input_count);
        inputs.resize_with(input_count, || None);
        Ok(Self {
            op,
            input_count,
            output_count,
            inputs,
            outputs: Vec::new(),
        })
    }
}

impl ExecutionPlan for StubPlan {
    fn input_count(&self) -> usize {
        self.input_count
    }

    fn output_count(&self) -> usize {
        self.output_count
    }

    fn set_input(
        &mut self,
        index: usize,
        dtype: DType,
        dims: &[usize],
        data: &[u8],
    ) -> Result<(), EngineStatus> {
        if index >= self.input_count || dtype != DType::F32 {
            return Err(status::INVALID_PARAMETER);
        }
        let elements: usize = dims.iter().product();
        if data.len() != elements * 4 {
            return Err(status::INVALID_PARAMETER);
        }
        let values = data
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        self.inputs[index] = Some(StagedInput {
            dims: dims.to_vec(),
            values,
        });
        Ok(())
    }

    fn run(&mut self) -> Result<(), EngineStatus> {
        if self.inputs.iter().any(Option::is_none) {
            return Err(status::INVALID_STATE);
        }
        let inputs: Vec<&StagedInput> = self.inputs.iter().map(|slot| slot.as_ref().unwrap()).collect();

        let mut outputs = Vec::with_capacity(self.output_count);
        match self.op {
            StubOp::Copy => {
                for index in 0..self.output_count {
                    let source = inputs[index % self.input_count];
                    outputs.push(StagedOutput {
                        dims: source.dims.clone(),
                        data: encode_f32(&source.values),
                    });
                }
            }
            StubOp::Scale2 => {
                for index in 0..self.output_count {
                    let source = inputs[index % self.input_count];
                    let doubled: Vec<f32> = source.values.iter().map(|value| value * 2.0).collect();
                    outputs.push(StagedOutput {
                        dims: source.dims.clone(),
                        data: encode_f32(&doubled),
                    });
                }
            }
            StubOp::Sum => {
                let first = inputs[0];
                if inputs.iter().any(|input| input.dims != first.dims) {
                    return Err(status::INVALID_PARAMETER);
                }
                let mut sum = vec![0.0f32; first.values.len()];
                for input in &inputs {
                    for (accumulator, value) in sum.iter_mut().zip(&input.values) {
                        *accumulator += value;
                    }
                }
                outputs.push(StagedOutput {
                    dims: first.dims.clone(),
                    data: encode_f32(&sum),
                });
            }
        }
        self.outputs = outputs;
        Ok(())
    }

    fn output_dims(&self, index: usize) -> Result<Vec<usize>, EngineStatus> {
        self.outputs
            .get(index)
            .map(|output| output.dims.clone())
            .ok_or(status::INVALID_STATE)
    }

    fn read_output(&self, index: usize, out: &mut [u8]) -> Result<(), EngineStatus> {
        let output = self.outputs.get(index).ok_or(status::INVALID_STATE)?;
        if out.len() != output.data.len() {
            return Err(status::INVALID_PARAMETER);
        }
        out.copy_from_slice(&output.data);
        Ok(())
    }
}

fn encode_f32(values: &[f32]) -> Vec<u8> {
    let mut data = Vec::with_capacity(values.len() * 4);
    for value in values {
        data.extend_from_slice(&value.to_le_bytes());
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_graphs() {
        assert_eq!(
            StubPlan::parse(b"not a kern graph").unwrap_err(),
            status::INVALID_PARAMETER
        );
        assert_eq!(
            StubPlan::parse(&graph_blob(StubOp::Copy, 0, 1)).unwrap_err(),
            status::INVALID_PARAMETER
        );

        let mut wrong_version = graph_blob(StubOp::Copy, 1, 1);
        wrong_version[4] = 9;
        assert_eq!(
            StubPlan::parse(&wrong_version).unwrap_err(),
            status::INVALID_PARAMETER
        );
    }

    #[test]
    fn sum_requires_matching_shapes() {
        let mut plan = StubPlan::parse(&graph_blob(StubOp::Sum, 2, 1)).unwrap();
        plan.set_input(0, DType::F32, &[2], &encode_f32(&[1.0, 2.0]))
            .unwrap();
        plan.set_input(1, DType::F32, &[3], &encode_f32(&[1.0, 2.0, 3.0]))
            .unwrap();
        assert_eq!(plan.run().unwrap_err(), status::INVALID_PARAMETER);
    }

    #[test]
    fn run_before_binding_is_rejected() {
        let mut plan = StubPlan::parse(&graph_blob(StubOp::Copy, 1, 1)).unwrap();
        assert_eq!(plan.run().unwrap_err(), status::INVALID_STATE);
        assert_eq!(plan.output_dims(0).unwrap_err(), status::INVALID_STATE);
    }
}
