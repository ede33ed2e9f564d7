//! Console reporting of node results.
//!
//! Terminal colorization and overprinting progress bars are out of scope;
//! this is the plain line-oriented surface.  Failed-node detail is buffered
//! and replayed after the build unless continue-on-error is set, so a long
//! parallel build ends with the failures adjacent to the summary.

use std::io::Write;
use std::time::Duration;

use crate::exec::ExecResult;
use crate::validation::ValidationResult;

pub struct Printer {
    /// Print each action's command line as it starts (verbose mode).
    pub echo_cmdline: bool,
    pub continue_on_error: bool,
    pub total_nodes: usize,
    deferred: Vec<String>,
}

fn stamp(processed: usize, total: usize, duration: Duration) -> String {
    format!("{}/{} {:.2}s", processed, total, duration.as_secs_f64())
}

impl Printer {
    pub fn new(total_nodes: usize, echo_cmdline: bool, continue_on_error: bool) -> Printer {
        Printer {
            echo_cmdline,
            continue_on_error,
            total_nodes,
            deferred: Vec::new(),
        }
    }

    /// Report one executed node.  Callers hold the queue lock, which keeps
    /// result blocks from interleaving.
    #[allow(clippy::too_many_arguments)]
    pub fn print_node_result(
        &mut self,
        processed: usize,
        annotation: &str,
        cmdline: Option<&str>,
        result: &ExecResult,
        validation: ValidationResult,
        duration: Duration,
        untouched_outputs: &[String],
    ) {
        let failed = result.return_code != 0 || result.was_signalled || validation.is_failure();

        if failed {
            println!(
                "[!FAILED! {}] {}",
                stamp(processed, self.total_nodes, duration),
                annotation
            );
            let mut detail = String::new();
            if let Some(cmd) = cmdline {
                detail.push_str(cmd);
                detail.push('\n');
            }
            if validation == ValidationResult::UnexpectedConsoleOutputFail {
                detail.push_str("unexpected console output:\n");
            }
            for path in untouched_outputs {
                detail.push_str(&format!("action did not write output file {}\n", path));
            }
            detail.push_str(&String::from_utf8_lossy(&result.output));
            if !detail.ends_with('\n') {
                detail.push('\n');
            }
            if self.continue_on_error {
                print!("{}", detail);
            } else {
                self.deferred.push(detail);
            }
            return;
        }

        if self.echo_cmdline {
            if let Some(cmd) = cmdline {
                println!("{}", cmd);
            }
        }
        println!(
            "[ SUCCESS {}] {}",
            stamp(processed, self.total_nodes, duration),
            annotation
        );
        if !result.output.is_empty() && validation != ValidationResult::SwallowStdout {
            let _ = std::io::stdout().write_all(&result.output);
        }
    }

    /// Periodic heartbeat for a node that's been running a while.
    pub fn print_node_in_progress(&self, annotation: &str, running_for: Duration) {
        println!("[ BUSY {:.0}s] {}", running_for.as_secs_f64(), annotation);
    }

    pub fn print_warning(&self, message: &str) {
        println!("[ WARNING] {}", message);
    }

    /// Replay buffered failure detail.  Called once at queue teardown.
    pub fn print_deferred(&mut self) {
        for detail in self.deferred.drain(..) {
            print!("{}", detail);
        }
        let _ = std::io::stdout().flush();
    }
}

/// Report an action that isn't a node: shared resource create/destroy,
/// stale-output deletion, throttle transitions.
pub fn print_non_node_action_result(
    annotation: &str,
    duration: Duration,
    ok: bool,
    output: &[u8],
) {
    let status = if ok { " SUCCESS" } else { "!FAILED!" };
    println!("[{} {:.2}s] {}", status, duration.as_secs_f64(), annotation);
    if !output.is_empty() {
        let _ = std::io::stdout().write_all(output);
    }
}
