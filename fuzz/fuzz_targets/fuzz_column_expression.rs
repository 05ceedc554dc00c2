//! Fuzz target for column router expressions.
//!
//! Parsing and printing must never panic on arbitrary input.

#![no_main]

use change_router::policy::ColumnMatchPolicy;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|expression: &str| {
    let Ok(policy) = ColumnMatchPolicy::parse(expression) else {
        return;
    };

    for parsed in policy.expressions() {
        // Should never panic
        let printed = parsed.to_string();
        let _ = ColumnMatchPolicy::parse(&printed);
    }
});
