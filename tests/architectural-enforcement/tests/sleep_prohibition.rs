//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code MUST NOT block a thread with `std::thread::sleep`
//! and MUST NOT use async sleeps to wait for events. The stream, the relay
//! and the dispatcher are all driven by I/O readiness and notifications.
//!
//! **Exception**: the delay between reconnect attempts.

use architectural_enforcement::{has_context, production_lines, SourceLine};

/// Find every sleep that is not part of reconnect backoff
fn find_sleep_violations(lines: &[SourceLine]) -> Vec<String> {
    lines
        .iter()
        .filter(|line| {
            let code = line.code();
            code.contains("::sleep(") || code.contains(".sleep(")
        })
        .filter(|line| {
            line.code().contains("thread::sleep")
                || !has_context(lines, line, 20, &["backoff", "reconnect", "attempt"])
        })
        .map(SourceLine::describe)
        .collect()
}

#[test]
fn test_no_sleep_in_production_code() {
    let violations = find_sleep_violations(&production_lines());

    if !violations.is_empty() {
        eprintln!("\nSleep calls found in production code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        eprintln!("\nAcceptable: tokio::time::sleep between reconnect attempts.");
        eprintln!("Use notifications, channels or I/O readiness to wait for events.");

        panic!(
            "\nFound {} sleep violation(s) in production code.",
            violations.len()
        );
    }
}

#[test]
fn test_polling_sleep_is_detected() {
    let lines = architectural_enforcement::split_production(
        std::path::Path::new("poll.rs"),
        "async fn poll() {\n    loop {\n        tokio::time::sleep(Duration::from_millis(10)).await;\n    }\n}\n",
    );
    assert_eq!(find_sleep_violations(&lines).len(), 1);
}

#[test]
fn test_backoff_sleep_is_allowed() {
    let lines = architectural_enforcement::split_production(
        std::path::Path::new("retry.rs"),
        "async fn retry(attempt: u32) {\n    let delay = policy.backoff_for_attempt(attempt);\n    tokio::time::sleep(delay).await;\n}\n",
    );
    assert!(find_sleep_violations(&lines).is_empty());
}

#[test]
fn test_thread_sleep_is_never_allowed() {
    let lines = architectural_enforcement::split_production(
        std::path::Path::new("retry.rs"),
        "fn retry(attempt: u32) {\n    std::thread::sleep(backoff(attempt));\n}\n",
    );
    assert_eq!(find_sleep_violations(&lines).len(), 1);
}
