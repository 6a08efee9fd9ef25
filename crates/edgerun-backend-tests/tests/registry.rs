use edgerun::backend::registry::{ensure_registered, get_delegate, has_delegate};
use edgerun::backend::spec::BackendDelegate;

#[test]
fn kern_backend_registers_under_fixed_name() {
    // The kern crate contributes its registrar through the distributed
    // slice; running the registrars must pick it up.
    ensure_registered();

    assert!(has_delegate(edgerun_backend_kern::BACKEND_NAME));
    let delegate = get_delegate("kern").expect("kern delegate registered");
    assert_eq!(delegate.name(), "kern");

    // Re-running is idempotent: the duplicate registration is rejected
    // inside the registrar without disturbing the registered instance.
    ensure_registered();
    edgerun_backend_kern::register_kern_backend();
    assert!(has_delegate("kern"));
}
