//! `sdjobs convert` / `sdjobs generate`: run one job in-process and tail it.

use std::io::Write;

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use sdjobs_core::{Job, JobStatus, JobUpdate, LogEntry};

use crate::service::JobService;

/// Follow `job` to the end, printing its log. Ctrl-C cancels the job; the
/// stream keeps running until the cancellation is reported.
pub async fn tail_job(service: &JobService, job: &Job) -> Result<JobStatus> {
    println!("Job {} ({})", job.id, job.status);

    let mut updates = service
        .subscriptions
        .subscribe(job.id, CancellationToken::new());
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;
    let mut printer = LogPrinter::default();
    let mut stdout = std::io::stdout();

    loop {
        let next = tokio::select! {
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                eprintln!("\nCancelling job {}...", job.id);
                service.supervisor.cancel(job.id);
                continue;
            }
            next = updates.next() => next,
        };
        let Some(update) = next else {
            break;
        };

        stdout
            .write_all(printer.render(&update).as_bytes())
            .and_then(|()| stdout.flush())
            .context("failed to write to stdout")?;

        if let JobUpdate::Finished { status, .. } = update {
            return Ok(status);
        }
    }

    anyhow::bail!("job {} disappeared before finishing", job.id)
}

/// Renders updates for a terminal. A run of progress updates redraws one
/// line in place.
#[derive(Debug, Default)]
struct LogPrinter {
    /// `seq` of the progress line currently on screen, if any.
    open_progress: Option<usize>,
}

impl LogPrinter {
    fn render(&mut self, update: &JobUpdate) -> String {
        match update {
            JobUpdate::Log { entry } => self.render_log(entry),
            JobUpdate::Finished { status, result } => {
                let mut out = self.close_progress();
                out.push_str(&format!("Job {status}"));
                if let Some(result) = result {
                    out.push_str(&format!(": {result}"));
                }
                out.push('\n');
                out
            }
        }
    }

    fn render_log(&mut self, entry: &LogEntry) -> String {
        match &entry.progress {
            Some(progress) => {
                let mut out = match self.open_progress {
                    Some(seq) if seq == entry.seq => "\r\x1b[K".to_string(),
                    _ => self.close_progress(),
                };
                self.open_progress = Some(entry.seq);
                out.push_str(&format!(
                    "{} ({:.0}%)",
                    entry.message, progress.percentage
                ));
                out
            }
            None => {
                let mut out = self.close_progress();
                out.push_str(&entry.message);
                out.push('\n');
                out
            }
        }
    }

    fn close_progress(&mut self) -> String {
        match self.open_progress.take() {
            Some(_) => "\n".to_string(),
            None => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use sdjobs_core::{StreamKind, extract_progress};
    use uuid::Uuid;

    use super::*;

    fn log(seq: usize, message: &str) -> JobUpdate {
        JobUpdate::Log {
            entry: LogEntry {
                job_id: Uuid::nil(),
                seq,
                stream: StreamKind::Stdout,
                message: message.to_string(),
                timestamp: Utc::now(),
                progress: extract_progress(message),
            },
        }
    }

    #[test]
    fn plain_lines_end_with_newline() {
        let mut printer = LogPrinter::default();
        assert_eq!(printer.render(&log(0, "loading model")), "loading model\n");
    }

    #[test]
    fn progress_updates_redraw_in_place() {
        let mut printer = LogPrinter::default();
        let first = printer.render(&log(1, "|=>  | 1/4 - 1.0it/s"));
        let second = printer.render(&log(1, "|==> | 2/4 - 1.0it/s"));
        let after = printer.render(&log(2, "sampling done"));

        assert_eq!(first, "|=>  | 1/4 - 1.0it/s (25%)");
        assert_eq!(second, "\r\x1b[K|==> | 2/4 - 1.0it/s (50%)");
        assert_eq!(after, "\nsampling done\n");
    }

    #[test]
    fn finished_closes_open_progress_line() {
        let mut printer = LogPrinter::default();
        printer.render(&log(0, "|====| 4/4 - 1.0it/s"));
        let done = printer.render(&JobUpdate::Finished {
            status: JobStatus::Completed,
            result: Some("/output/txt2img/a.png".to_string()),
        });
        assert_eq!(done, "\nJob completed: /output/txt2img/a.png\n");
    }

    #[test]
    fn new_progress_entry_starts_a_new_line() {
        let mut printer = LogPrinter::default();
        printer.render(&log(0, "|==| 2/2 - 1.0it/s"));
        let next = printer.render(&log(1, "|=  | 1/2 - 1.0it/s"));
        assert_eq!(next, "\n|=  | 1/2 - 1.0it/s (50%)");
    }
}
