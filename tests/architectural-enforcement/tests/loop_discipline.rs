//! Integration Test: Event Loop Discipline
//!
//! Everything but the spooler's worker runs on the event-loop thread, and
//! protocols never see `connection_lost` re-entrantly from inside another
//! transport call.

use architectural_enforcement::{fail_on, production_sources};

/// How far above a `connection_lost` call its `call_soon` may sit
const DEFERRAL_WINDOW: usize = 5;

#[test]
fn test_threads_confined_to_spooler() {
    let mut violations = Vec::new();
    for file in production_sources() {
        if file.ends_with("transport/spooler.rs") {
            continue;
        }
        for idx in 0..file.lines.len() {
            let code = file.code(idx);
            if code.contains("thread::spawn")
                || code.contains("thread::Builder")
                || code.contains("spawn_blocking")
            {
                violations.push(format!("{}:{} - {}", file.display(), idx + 1, code.trim()));
            }
        }
    }
    fail_on("OS threads outside the spooler", &violations);
}

#[test]
fn test_connection_lost_is_deferred() {
    let mut violations = Vec::new();
    let mut call_sites = 0;
    for file in production_sources() {
        for idx in 0..file.lines.len() {
            if !file.code(idx).contains(".connection_lost(") {
                continue;
            }
            call_sites += 1;
            let deferred = (idx.saturating_sub(DEFERRAL_WINDOW)..idx)
                .any(|i| file.code(i).contains("call_soon("));
            if !deferred {
                violations.push(format!(
                    "{}:{} - {}",
                    file.display(),
                    idx + 1,
                    file.lines[idx].trim()
                ));
            }
        }
    }
    assert!(call_sites > 0, "no connection_lost call sites found");
    fail_on("connection_lost delivered outside call_soon", &violations);
}
