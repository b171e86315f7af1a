use chrono::Utc;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use owo_colors::OwoColorize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use crate::transfer::FetchOutcome;

/// Whether coloured output can be written to this console. Windows consoles
/// need virtual terminal processing switched on first.
#[cfg(windows)]
pub fn console_supports_ansi() -> bool {
    enable_ansi_support::enable_ansi_support().is_ok()
}

#[cfg(not(windows))]
pub fn console_supports_ansi() -> bool {
    true
}

const IEC_UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];

/// `bytes` in the largest IEC unit that keeps the value at or above 1.
pub fn human_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < IEC_UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, IEC_UNITS[unit])
}

/// Average rate in MiB/s, or 0 when nothing measurable elapsed.
pub fn mib_per_sec(bytes: u64, elapsed_secs: f64) -> f64 {
    if elapsed_secs > 0.0 { bytes as f64 / 1024.0 / 1024.0 / elapsed_secs } else { 0.0 }
}

/// Byte progress bar on stderr. Hidden in quiet mode so callers can tick it
/// unconditionally.
pub fn init_progress(quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::with_draw_target(Some(0), ProgressDrawTarget::stderr());
    let style = ProgressStyle::with_template(
        "{spinner} [{elapsed_precise}] [{bar:40}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("=> ");
    pb.set_style(style);
    pb
}

/// Print a one-line summary of a finished run.
pub fn print_summary(files_ok: usize, files_failed: usize, total_bytes: u64, elapsed_secs: f64) {
    println!(
        "{}",
        summary_line(files_ok, files_failed, total_bytes, elapsed_secs, console_supports_ansi())
    );
}

fn summary_line(
    files_ok: usize,
    files_failed: usize,
    total_bytes: u64,
    elapsed_secs: f64,
    colour: bool,
) -> String {
    let mut ok = format!("{} fetched", files_ok);
    let mut failed = format!("{} failed", files_failed);
    if colour {
        ok = ok.green().to_string();
        if files_failed > 0 {
            failed = failed.red().to_string();
        }
    }
    format!(
        "{}, {} | {} in {:.2}s ({:.2} MiB/s)",
        ok,
        failed,
        human_bytes(total_bytes),
        elapsed_secs,
        mib_per_sec(total_bytes, elapsed_secs)
    )
}

/// Append failed outcomes to `path` as JSON Lines, one object per failure,
/// each stamped with the UTC time of this run.
pub fn write_failures_jsonl(path: &Path, failures: &[&FetchOutcome]) -> std::io::Result<usize> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    let ts = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    for o in failures {
        let obj = serde_json::json!({
            "timestamp": ts,
            "remote_path": o.remote_path,
            "local_path": o.local_path.to_string_lossy(),
            "kind": o.error_kind.map(|k| k.as_str()),
            "message": o.error_detail,
        });
        writeln!(f, "{}", obj)?;
    }
    Ok(failures.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, FetchError};
    use crate::transfer::FetchTask;

    #[test]
    fn human_bytes_units() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(2048), "2.00 KiB");
        assert_eq!(human_bytes(3 * 1024 * 1024), "3.00 MiB");
        assert_eq!(human_bytes(1023), "1023 B");
        assert_eq!(human_bytes(5 * 1024u64.pow(4)), "5.00 TiB");
        assert_eq!(human_bytes(2048 * 1024u64.pow(4)), "2048.00 TiB");
    }

    #[test]
    fn summary_line_is_plain_without_ansi() {
        let plain = summary_line(3, 1, 2048, 1.0, false);
        assert_eq!(plain, "3 fetched, 1 failed | 2.00 KiB in 1.00s (0.00 MiB/s)");
        let coloured = summary_line(3, 1, 2048, 1.0, true);
        assert!(coloured.contains('\u{1b}'));
    }

    #[test]
    fn rate_is_zero_without_elapsed_time() {
        assert_eq!(mib_per_sec(1024, 0.0), 0.0);
        assert!((mib_per_sec(2 * 1024 * 1024, 2.0) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn failures_are_appended_as_json_lines() {
        let dir = tempfile::tempdir().expect("tmp");
        let path = dir.path().join("out").join("failures.jsonl");
        let task = FetchTask {
            remote_path: "/pub/a.txt".into(),
            local_path: "target/pub/a.txt".into(),
            size_hint: None,
        };
        let outcome = FetchOutcome::failed(&task, &FetchError::Protocol("550 gone".into()));
        write_failures_jsonl(&path, &[&outcome]).expect("write");
        write_failures_jsonl(&path, &[&outcome]).expect("append");

        let body = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        let v: serde_json::Value = serde_json::from_str(lines[0]).expect("json");
        assert_eq!(v["remote_path"], "/pub/a.txt");
        assert_eq!(v["kind"], ErrorKind::Protocol.as_str());
        assert!(v["timestamp"].as_str().is_some_and(|t| t.ends_with('Z')));
    }
}
