//! Validates process console output against a node's allowed substrings.
//!
//! Tools that cannot be silenced get an allow-list; output every line of
//! which is covered by the list is swallowed from the display.  Anything
//! else fails the node, unless it opted out via AllowUnexpectedOutput.

use crate::exec::ExecResult;
use crate::graph::NodeData;

/// Ordering is meaningful: anything >= UnexpectedConsoleOutputFail is a
/// failing validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValidationResult {
    Pass,
    SwallowStdout,
    UnexpectedConsoleOutputFail,
    /// Produced by the action runner's untouched-output check, never here.
    UnwrittenOutputFileFail,
}

impl ValidationResult {
    pub fn is_failure(self) -> bool {
        self >= ValidationResult::UnexpectedConsoleOutputFail
    }
}

pub fn validate_exec_result(result: &ExecResult, node: &NodeData) -> ValidationResult {
    if node.flags.allow_unexpected_output() {
        return ValidationResult::Pass;
    }

    let text = String::from_utf8_lossy(&result.output);
    let mut matched_any = false;
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let allowed = node
            .allowed_output_substrings
            .iter()
            .any(|s| line.contains(s.as_str()));
        if !allowed {
            return ValidationResult::UnexpectedConsoleOutputFail;
        }
        matched_any = true;
    }

    if matched_any {
        ValidationResult::SwallowStdout
    } else {
        ValidationResult::Pass
    }
}
