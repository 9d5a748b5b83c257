//! Shared constants and builders for integration tests.
//!
//! Integration tests are compiled as separate crates (one per top-level file
//! in `tests/`). Placing shared helpers under `tests/common/` avoids creating
//! an additional integration test binary while still allowing reuse via:
//!
//! ```rust
//! #[path = "common/test_constants.rs"]
//! mod test_constants;
//! ```

use stratus::{StackInputs, StackSnapshot};

/// Stack name used across the integration suites.
pub const STACK_NAME: &str = "web";

/// Image identifier used across the integration suites.
pub const IMAGE_ID: &str = "img-0123456789abcdef0";

/// Key material accepted by the key pair precondition.
pub const PUBLIC_KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIHo test@example";

/// Baseline inputs that validate with the stock defaults.
pub fn base_inputs() -> StackInputs {
    StackInputs {
        name: String::from(STACK_NAME),
        image_id: String::from(IMAGE_ID),
        ..StackInputs::default()
    }
}

/// Builds a validated snapshot after applying the given mutation.
pub fn snapshot_with(mutate: impl FnOnce(&mut StackInputs)) -> StackSnapshot {
    let mut inputs = base_inputs();
    mutate(&mut inputs);
    inputs
        .validate()
        .unwrap_or_else(|err| panic!("inputs should validate: {err}"))
}
