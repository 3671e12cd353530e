//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Transports wait on readiness, channels and child exit, never
//! on a timer.
//! **Exception**: the write retry for descriptors that cannot be polled,
//! which have no readiness to wait on. Test code is not scanned.

use architectural_enforcement::{fail_on, production_sources, SourceFile};

#[test]
fn test_no_sleep_in_production_code() {
    let mut violations = Vec::new();
    for file in production_sources() {
        for idx in 0..file.lines.len() {
            let code = file.code(idx);
            if !(code.contains("::sleep(") || code.contains(".sleep(")) {
                continue;
            }
            if is_direct_retry(&file, idx) {
                continue;
            }
            violations.push(format!(
                "{}:{} - {}",
                file.display(),
                idx + 1,
                file.lines[idx].trim()
            ));
        }
    }
    fail_on("Sleep calls found in production code", &violations);
}

/// The unpollable write path retries on a fixed delay.
fn is_direct_retry(file: &SourceFile, idx: usize) -> bool {
    file.ends_with("transport/base.rs") && file.code(idx).contains("DIRECT_RETRY_DELAY")
}
