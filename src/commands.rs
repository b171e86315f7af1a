use std::sync::Arc;
use std::time::Duration;

use crate::cli::{Cli, Commands, RunArgs};
use crate::config::FetchConfig;
use crate::coordinator::FetchCoordinator;
use crate::remote::Endpoint;
use crate::remote::ftp_endpoint::FtpEndpoint;
use crate::remote::memory::{Fault, MemoryEndpoint};
use crate::report::{ReportOptions, ResultReporter, report_fatal};
use crate::runtime::FetchRuntime;

/// Remote directory the demo server is seeded under.
pub const DEMO_BASE: &str = "/home/anonymous";

/// Run the command selected on the command line; returns the exit status.
pub fn run(cli: &Cli) -> u8 {
    let mut options = ReportOptions { json: cli.json, quiet: cli.quiet, failures_out: None };
    let mut cfg = match FetchConfig::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => return report_fatal(&e, &options),
    };
    match &cli.command {
        Commands::Fetch { host, port, base_dir, user, password, run } => {
            if let Some(h) = host {
                cfg.endpoint_host = h.clone();
            }
            if let Some(p) = port {
                cfg.endpoint_port = *p;
            }
            if let Some(b) = base_dir {
                cfg.base_directory = b.clone();
            }
            if let Some(u) = user {
                cfg.username = u.clone();
            }
            if let Some(p) = password {
                cfg.password = p.clone();
            }
            apply_run_args(&mut cfg, run);
            options.failures_out = cfg.failures_out.clone();
            let endpoint = FtpEndpoint::from_config(&cfg);
            let runtime = FetchRuntime::new(Arc::new(endpoint), cfg.max_concurrency);
            execute(&cfg, runtime, options)
        }
        Commands::Demo { files, dirs, fail, drop_after, delay_ms, run } => {
            apply_run_args(&mut cfg, run);
            cfg.base_directory = DEMO_BASE.to_string();
            cfg.recursive = true;
            options.failures_out = cfg.failures_out.clone();
            let endpoint = seed_demo_endpoint(*files, *dirs);
            for path in fail {
                endpoint.inject_fault(path, Fault::DropAfter(*drop_after));
            }
            endpoint.set_transfer_delay(Duration::from_millis(*delay_ms));
            tracing::info!("[demo] serving {} files at {}", files + 2, endpoint.describe());
            let runtime = FetchRuntime::new(Arc::new(endpoint.clone()), cfg.max_concurrency)
                .with_harness(Box::new(endpoint));
            execute(&cfg, runtime, options)
        }
    }
}

/// In-memory server laid out like the classic sample: `files` generated
/// files over `dirs` directories under [`DEMO_BASE`], plus two greetings.
pub fn seed_demo_endpoint(files: usize, dirs: usize) -> MemoryEndpoint {
    let ep = MemoryEndpoint::new();
    ep.generate_files(files, dirs, DEMO_BASE);
    ep.put_file(DEMO_BASE, "hello.txt", "Hello, world!\n");
    ep.put_file(DEMO_BASE, "hello2.txt", "Hello again, world!\n");
    ep
}

fn apply_run_args(cfg: &mut FetchConfig, run: &RunArgs) {
    if let Some(root) = &run.local_root {
        cfg.local_root = root.clone();
    }
    if let Some(c) = run.concurrency {
        cfg.max_concurrency = c;
    }
    if run.recursive {
        cfg.recursive = true;
    }
    if run.timeout.is_some() {
        cfg.timeout_secs = run.timeout;
    }
    if run.failures_out.is_some() {
        cfg.failures_out = run.failures_out.clone();
    }
}

/// Validate, fetch and report. Every path ends in the reporter, which
/// releases the runtime.
pub fn execute(cfg: &FetchConfig, runtime: FetchRuntime, options: ReportOptions) -> u8 {
    if let Err(e) = cfg.validate() {
        return ResultReporter::new(runtime, options).report_error(&e);
    }
    let pb = crate::util::init_progress(options.quiet);
    let coordinator = FetchCoordinator::new(&runtime)
        .with_recursive(cfg.recursive)
        .with_timeout(cfg.timeout_secs.map(Duration::from_secs))
        .with_progress(pb.clone());
    let result = coordinator.fetch(&cfg.base_directory, &cfg.local_root, cfg.max_concurrency);
    pb.finish_and_clear();

    let reporter = ResultReporter::new(runtime, options);
    match result {
        Ok(report) => reporter.report(&report),
        Err(e) => reporter.report_error(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{EXIT_FAILURES, EXIT_FATAL, EXIT_OK};

    fn quiet() -> ReportOptions {
        ReportOptions { quiet: true, ..ReportOptions::default() }
    }

    fn demo_config(root: &std::path::Path) -> FetchConfig {
        FetchConfig {
            base_directory: DEMO_BASE.to_string(),
            local_root: root.to_path_buf(),
            recursive: true,
            ..FetchConfig::default()
        }
    }

    #[test]
    fn run_args_override_config() {
        let mut cfg = FetchConfig::default();
        let run = RunArgs { concurrency: Some(9), recursive: true, timeout: Some(3), ..RunArgs::default() };
        apply_run_args(&mut cfg, &run);
        assert_eq!(cfg.max_concurrency, 9);
        assert!(cfg.recursive);
        assert_eq!(cfg.timeout_secs, Some(3));
        assert_eq!(cfg.local_root, FetchConfig::default().local_root);
    }

    #[test]
    fn demo_pipeline_succeeds_and_stops_harness() {
        let dir = tempfile::tempdir().expect("tmp");
        let ep = seed_demo_endpoint(6, 2);
        let rt = FetchRuntime::new(Arc::new(ep.clone()), 5).with_harness(Box::new(ep.clone()));
        let code = execute(&demo_config(dir.path()), rt, quiet());
        assert_eq!(code, EXIT_OK);
        assert!(dir.path().join("home/anonymous/hello.txt").is_file());
        assert!(dir.path().join("home/anonymous/dir-01/file-001.txt").is_file());
        // harness stopped by the reporter
        assert!(matches!(ep.open(), Err(crate::error::FetchError::Connection(_))));
    }

    #[test]
    fn injected_failure_exits_with_one() {
        let dir = tempfile::tempdir().expect("tmp");
        let ep = seed_demo_endpoint(0, 0);
        ep.inject_fault("/home/anonymous/hello2.txt", Fault::DropAfter(4));
        let rt = FetchRuntime::new(Arc::new(ep.clone()), 5);
        assert_eq!(execute(&demo_config(dir.path()), rt, quiet()), EXIT_FAILURES);
        assert!(dir.path().join("home/anonymous/hello.txt").is_file());
        assert!(!dir.path().join("home/anonymous/hello2.txt").exists());
    }

    #[test]
    fn invalid_config_is_fatal_without_connecting() {
        let dir = tempfile::tempdir().expect("tmp");
        let ep = seed_demo_endpoint(0, 0);
        let cfg = FetchConfig { max_concurrency: 0, ..demo_config(dir.path()) };
        let rt = FetchRuntime::new(Arc::new(ep.clone()), 1);
        assert_eq!(execute(&cfg, rt, quiet()), EXIT_FATAL);
        assert_eq!(ep.sessions_opened(), 0);
    }
}
