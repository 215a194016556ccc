//! CLI command implementations.

pub mod batch;
pub mod cancel;
pub mod chunks;
pub mod list;
pub mod stats;
pub mod status;
pub mod submit;
pub mod work;

use owo_colors::OwoColorize;

use spool_flow::task::TaskStatus;

/// Colors a task status for terminal output.
pub(crate) fn format_status_colored(status: TaskStatus) -> String {
    let label = status.to_string();
    match status {
        TaskStatus::Completed => label.green().to_string(),
        TaskStatus::Failed => label.red().to_string(),
        TaskStatus::Generating | TaskStatus::Persisting => label.blue().to_string(),
        TaskStatus::Created | TaskStatus::Validating => label.yellow().to_string(),
        TaskStatus::Cancelled => label.dimmed().to_string(),
    }
}
