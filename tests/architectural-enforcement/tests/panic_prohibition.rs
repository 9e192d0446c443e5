//! Integration Test: Panic and Global State Prohibition
//!
//! **Policy**: Production code propagates errors with `?` and typed errors
//! (`thiserror` in the library, `anyhow` in the binary). It MUST NOT call
//! `.unwrap()` or `.expect(...)`, and it MUST NOT keep configuration or
//! connections in process-wide mutable statics; those are passed to
//! constructors.

use architectural_enforcement::{production_lines, split_production, SourceLine};

fn find_panic_violations(lines: &[SourceLine]) -> Vec<String> {
    lines
        .iter()
        .filter(|line| {
            let code = line.code();
            code.contains(".unwrap()") || code.contains(".expect(") || code.contains("panic!(")
        })
        .map(SourceLine::describe)
        .collect()
}

fn find_global_state_violations(lines: &[SourceLine]) -> Vec<String> {
    lines
        .iter()
        .filter(|line| {
            let code = line.code();
            code.contains("static mut ") || code.contains("lazy_static!") || code.contains("OnceLock<Mutex")
        })
        .map(SourceLine::describe)
        .collect()
}

#[test]
fn test_no_panicking_shortcuts_in_production_code() {
    let violations = find_panic_violations(&production_lines());

    if !violations.is_empty() {
        eprintln!("\nPanicking calls found in production code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        panic!(
            "\nFound {} panicking call(s) in production code. Propagate the error instead.",
            violations.len()
        );
    }
}

#[test]
fn test_no_global_mutable_state() {
    let violations = find_global_state_violations(&production_lines());

    if !violations.is_empty() {
        eprintln!("\nProcess-wide mutable state found in production code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        panic!(
            "\nFound {} global state violation(s). Pass configuration to constructors.",
            violations.len()
        );
    }
}

#[test]
fn test_unwrap_variants_are_allowed() {
    let lines = split_production(
        std::path::Path::new("a.rs"),
        "fn a() {\n    let x = y.unwrap_or_default();\n    let z = w.unwrap_or_else(|_| 1);\n}\n",
    );
    assert!(find_panic_violations(&lines).is_empty());
}

#[test]
fn test_unwrap_is_detected() {
    let lines = split_production(
        std::path::Path::new("a.rs"),
        "fn a() {\n    let x = y.unwrap();\n    let z = w.expect(\"present\");\n}\n",
    );
    assert_eq!(find_panic_violations(&lines).len(), 2);
}

#[test]
fn test_static_mut_is_detected() {
    let lines = split_production(
        std::path::Path::new("a.rs"),
        "static mut TOKEN: String = String::new();\n",
    );
    assert_eq!(find_global_state_violations(&lines).len(), 1);
}
