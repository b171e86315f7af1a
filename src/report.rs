use std::path::PathBuf;

use cli_table::{Cell, CellStruct, Style, Table, format::Justify};
use owo_colors::OwoColorize;

use crate::coordinator::FetchReport;
use crate::error::FetchError;
use crate::runtime::FetchRuntime;

/// Every file was fetched.
pub const EXIT_OK: u8 = 0;
/// The run completed but at least one file failed.
pub const EXIT_FAILURES: u8 = 1;
/// Nothing was dispatched: configuration or listing error.
pub const EXIT_FATAL: u8 = 2;

#[derive(Clone, Debug, Default)]
pub struct ReportOptions {
    /// Also print a one-line JSON summary.
    pub json: bool,
    /// Suppress the human-readable output.
    pub quiet: bool,
    /// Append failed outcomes here as JSON Lines.
    pub failures_out: Option<PathBuf>,
}

/// Final stage of a run: prints the outcome and releases the runtime.
///
/// Both entry points consume the reporter, so the runtime is torn down once
/// whichever way the run ended.
pub struct ResultReporter {
    runtime: FetchRuntime,
    options: ReportOptions,
}

impl ResultReporter {
    pub fn new(runtime: FetchRuntime, options: ReportOptions) -> Self {
        Self { runtime, options }
    }

    /// Report a completed run and return the process exit status.
    pub fn report(mut self, report: &FetchReport) -> u8 {
        if !self.options.quiet {
            println!("{}", render_report(report));
            crate::util::print_summary(
                report.succeeded_count(),
                report.failed_count,
                report.total_bytes,
                report.elapsed.as_secs_f64(),
            );
        }

        let mut failures_path: Option<&PathBuf> = None;
        if report.failed_count > 0
            && let Some(p) = self.options.failures_out.as_ref()
        {
            let failures: Vec<_> = report.failures().collect();
            match crate::util::write_failures_jsonl(p, &failures) {
                Ok(n) => {
                    failures_path = Some(p);
                    if !self.options.quiet {
                        println!("{} failures written to {}", n, p.display());
                    }
                }
                Err(e) => tracing::warn!("[report] cannot write {}: {}", p.display(), e),
            }
        }

        if self.options.json {
            let mut obj = summary_json(report);
            obj["failures_path"] = serde_json::json!(failures_path.map(|p| p.to_string_lossy()));
            println!("{}", obj);
        }

        self.teardown();
        exit_code_for(report)
    }

    /// Report a fatal error that stopped the run before any result existed.
    pub fn report_error(mut self, err: &FetchError) -> u8 {
        let code = report_fatal(err, &self.options);
        self.teardown();
        code
    }

    fn teardown(&mut self) {
        if self.runtime.shutdown() {
            tracing::debug!("[report] runtime released");
        }
    }
}

/// Print a fatal error. Used directly when the run failed before a runtime
/// existed (unreadable config file).
pub fn report_fatal(err: &FetchError, options: &ReportOptions) -> u8 {
    if !options.quiet {
        eprintln!("{} {}", "the stream failed:".red().bold(), err);
    }
    if options.json {
        let obj = serde_json::json!({
            "ok": false,
            "error_kind": err.kind().as_str(),
            "error": err.detail(),
        });
        println!("{}", obj);
    }
    EXIT_FATAL
}

pub fn exit_code_for(report: &FetchReport) -> u8 {
    if report.is_success() { EXIT_OK } else { EXIT_FAILURES }
}

/// Headline plus, when something failed, a table of failed paths and causes.
pub fn render_report(report: &FetchReport) -> String {
    let total = report.outcomes.len();
    if report.is_success() {
        return format!("all files fetched ({} of {})", total, total);
    }
    let mut out = format!("{} of {} files failed", report.failed_count, total);
    if report.cancelled {
        out.push_str(" (run cancelled)");
    }
    let title = vec![
        "Remote Path".cell().bold(true),
        "Kind".cell().bold(true),
        "Cause".cell().bold(true),
    ];
    let rows: Vec<Vec<CellStruct>> = report
        .failures()
        .map(|o| {
            vec![
                o.remote_path.as_str().cell(),
                o.error_kind.map(|k| k.as_str()).unwrap_or("-").cell().justify(Justify::Right),
                o.error_detail.as_deref().unwrap_or("unknown").cell(),
            ]
        })
        .collect();
    match rows.table().title(title).display() {
        Ok(table) => {
            out.push('\n');
            out.push_str(&table.to_string());
        }
        Err(e) => tracing::warn!("[report] cannot render failure table: {}", e),
    }
    out
}

pub fn summary_json(report: &FetchReport) -> serde_json::Value {
    serde_json::json!({
        "ok": report.is_success(),
        "files": report.outcomes.len(),
        "failed": report.failed_count,
        "total_bytes": report.total_bytes,
        "elapsed_secs": report.elapsed.as_secs_f64(),
        "cancelled": report.cancelled,
        "failures": report.failures().map(|o| serde_json::json!({
            "remote_path": o.remote_path,
            "kind": o.error_kind.map(|k| k.as_str()),
            "message": o.error_detail,
        })).collect::<Vec<_>>(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::MemoryEndpoint;
    use crate::runtime::Teardown;
    use crate::transfer::{FetchOutcome, FetchTask};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Counter(Arc<AtomicUsize>);

    impl Teardown for Counter {
        fn name(&self) -> String {
            "counter".into()
        }

        fn teardown(&mut self) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn task(p: &str) -> FetchTask {
        FetchTask { remote_path: p.into(), local_path: p.trim_start_matches('/').into(), size_hint: None }
    }

    fn mixed_report() -> FetchReport {
        let ok = FetchOutcome::succeeded(&task("/a.txt"), 3);
        let bad = FetchOutcome::failed(&task("/b.txt"), &FetchError::Connection("reset".into()));
        FetchReport::from_outcomes(vec![ok, bad], Duration::from_millis(10), false)
    }

    fn reporter(stops: &Arc<AtomicUsize>, options: ReportOptions) -> ResultReporter {
        let rt = FetchRuntime::new(Arc::new(MemoryEndpoint::new()), 1)
            .with_harness(Box::new(Counter(stops.clone())));
        ResultReporter::new(rt, options)
    }

    #[test]
    fn success_headline() {
        let ok = FetchOutcome::succeeded(&task("/a.txt"), 3);
        let r = FetchReport::from_outcomes(vec![ok], Duration::ZERO, false);
        assert_eq!(render_report(&r), "all files fetched (1 of 1)");
        assert_eq!(exit_code_for(&r), EXIT_OK);
    }

    #[test]
    fn failures_are_listed_with_cause() {
        let r = mixed_report();
        let text = render_report(&r);
        assert!(text.starts_with("1 of 2 files failed"));
        assert!(text.contains("/b.txt"));
        assert!(text.contains("reset"));
        assert!(!text.contains("/a.txt"));
        assert_eq!(exit_code_for(&r), EXIT_FAILURES);
        assert_eq!(summary_json(&r)["failed"], 1);
    }

    #[test]
    fn report_tears_down_once_and_writes_failures() {
        let stops = Arc::new(AtomicUsize::new(0));
        let dir = tempfile::tempdir().expect("tmp");
        let out = dir.path().join("failures.jsonl");
        let opts = ReportOptions { json: true, quiet: true, failures_out: Some(out.clone()) };
        let code = reporter(&stops, opts).report(&mixed_report());
        assert_eq!(code, EXIT_FAILURES);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert_eq!(std::fs::read_to_string(&out).expect("read").lines().count(), 1);
    }

    #[test]
    fn fatal_error_tears_down_and_exits_with_two() {
        let stops = Arc::new(AtomicUsize::new(0));
        let opts = ReportOptions { quiet: true, ..ReportOptions::default() };
        let code = reporter(&stops, opts).report_error(&FetchError::Connection("refused".into()));
        assert_eq!(code, EXIT_FATAL);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }
}
