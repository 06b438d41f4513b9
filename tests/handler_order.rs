//! Handler installation ordering.
//!
//! Application fault handlers may only be installed once the runtime has
//! captured the signal; this binary never calls init, so the attempt must
//! fail. Lives in its own test binary because other integration tests
//! initialize the process-wide runtime.

use vela::Error;

#[test]
fn application_handler_requires_runtime_first() {
    // SAFETY: a zeroed sigaction is a valid "ignore everything" template.
    let action: libc::sigaction = unsafe { std::mem::zeroed() };
    match vela::install_application_handler(&action) {
        Err(Error::HandlerOrder) => {}
        Err(other) => panic!("expected a handler ordering error, got {other}"),
        Ok(_) => panic!("installation succeeded without a runtime handler"),
    }
}
