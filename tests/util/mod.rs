// Not all functions are used by every test binary.
#![allow(dead_code)]

use std::sync::Once;

/// Initializes the test logger exactly once per process, mirroring the
/// corpus's own `tests/util` helper.
pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}
