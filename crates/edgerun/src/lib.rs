pub use linkme;

pub mod backend;

pub use backend::spec::{
    ArgTensor, ArgValue, BackendDelegate, DType, DelegateError, DelegateHandle, DelegateResult,
};
