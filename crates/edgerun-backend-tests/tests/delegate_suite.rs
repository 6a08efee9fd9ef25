use edgerun_backend_tests::lifecycle;

#[test]
fn availability_probe_is_idempotent() {
    lifecycle::availability_probe_is_idempotent();
}

#[test]
fn unavailable_engine_fails_init_fast() {
    lifecycle::unavailable_engine_fails_init_fast();
}

#[test]
fn workspace_creation_failure_surfaces_on_init() {
    lifecycle::workspace_creation_failure_surfaces_on_init();
}

#[test]
fn lifecycle_roundtrip_executes_twice() {
    lifecycle::lifecycle_roundtrip_executes_twice();
}

#[test]
fn compile_failure_releases_blob_and_handle() {
    lifecycle::compile_failure_releases_blob_and_handle();
}

#[test]
fn allocator_exhaustion_aborts_init() {
    lifecycle::allocator_exhaustion_aborts_init();
}

#[test]
fn handles_share_one_workspace() {
    lifecycle::handles_share_one_workspace();
}

#[test]
fn destroy_null_handle_is_noop() {
    lifecycle::destroy_null_handle_is_noop();
}

#[test]
fn output_slots_resized_in_place() {
    lifecycle::output_slots_resized_in_place();
}

#[test]
fn execution_failure_leaves_handle_destroyable() {
    lifecycle::execution_failure_leaves_handle_destroyable();
}

#[test]
fn argument_arity_mismatch_is_reported() {
    lifecycle::argument_arity_mismatch_is_reported();
}

#[test]
fn scalar_in_input_slot_is_rejected() {
    lifecycle::scalar_in_input_slot_is_rejected();
}

#[test]
fn serialized_policy_executes_correctly() {
    lifecycle::serialized_policy_executes_correctly();
}
