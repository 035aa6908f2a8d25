//! Command-line front end for the taskgraph workflow engine.
//!
//! This binary ships a small demonstration workflow (a three-stage
//! pipeline of shell commands) rather than a file-format parser: the
//! engine's public surface is meant to be driven programmatically, and
//! this binary exists to exercise it end-to-end and print its graph.

use console::style;
use std::{
    process,
    time::{Duration, Instant},
};
use taskgraph_engine::{
    run_serial, to_dot, to_makefile, EngineError, ProcessHandler, Progress, Scheduler, Task,
    ThreadHandler, Workflow,
};
use taskgraph_uri::Uri;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Args(#[from] pico_args::Error),
}

struct Config {
    worker_kind: WorkerKind,
    jobs: u32,
    slots: u32,
    update_freq: Option<u64>,
    exit_on_failure: bool,
    emit: Option<Emit>,
    stats: bool,
}

#[derive(Clone, Copy)]
enum WorkerKind {
    Serial,
    Threads,
    Processes,
}

#[derive(Clone, Copy)]
enum Emit {
    Dot,
    Makefile,
}

fn parse_args() -> Result<Config, CliError> {
    let mut args = pico_args::Arguments::from_env();

    let serial = args.contains("--serial");
    let threads = args.contains("--threads");
    let processes = args.contains("--processes");
    let worker_kind = match (serial, threads, processes) {
        (true, false, false) => WorkerKind::Serial,
        (false, _, true) => WorkerKind::Processes,
        _ => WorkerKind::Threads,
    };

    let dot = args.contains("--dot");
    let makefile = args.contains("--makefile");
    let emit = if dot {
        Some(Emit::Dot)
    } else if makefile {
        Some(Emit::Makefile)
    } else {
        None
    };

    let jobs: u32 = args
        .opt_value_from_str("--jobs")?
        .unwrap_or_else(|| num_cpus::get() as u32);
    let slots: u32 = args.opt_value_from_str("--slots")?.unwrap_or(jobs);
    let update_freq: Option<u64> = args.opt_value_from_str("--update-freq")?;
    let exit_on_failure: bool = args.opt_value_from_str("--exit-on-failure")?.unwrap_or(true);
    let stats = args.contains("--stats");

    Ok(Config {
        worker_kind,
        jobs,
        slots,
        update_freq,
        exit_on_failure,
        emit,
        stats,
    })
}

/// A three-stage demonstration pipeline: two independent `echo` steps
/// feeding a third that depends on both.
fn demo_workflow() -> Workflow {
    let mut workflow = Workflow::new();
    workflow
        .add_task(
            Task::command(Uri::task("fetch"), "echo fetching >/dev/null")
                .outputs(vec![Uri::state("fetched")])
                .build(),
        )
        .expect("fetch is the first registration of its uri");
    workflow
        .add_task(
            Task::command(Uri::task("lint"), "echo linting >/dev/null")
                .outputs(vec![Uri::state("linted")])
                .build(),
        )
        .expect("lint is the first registration of its uri");
    workflow
        .add_task(
            Task::command(Uri::task("package"), "echo packaging >/dev/null")
                .inputs(vec![Uri::state("fetched"), Uri::state("linted")])
                .build(),
        )
        .expect("package is the first registration of its uri");
    workflow
}

fn print_progress(progress: &Progress) {
    eprintln!(
        "{} {}/{} done, {} failed, {} submitted, {} ready",
        style("tick").dim(),
        progress.done,
        progress.total,
        style(progress.failed).red(),
        progress.submitted,
        progress.ready,
    );
}

/// Wraps `print_progress` so it only actually prints once per
/// `update_freq` interval, regardless of how often the scheduler ticks.
fn rate_limited_progress(update_freq: Option<u64>) -> impl FnMut(&Progress) + Send {
    let period = update_freq.map(Duration::from_secs);
    let mut last = None::<Instant>;
    move |progress: &Progress| match period {
        None => print_progress(progress),
        Some(period) => {
            let now = Instant::now();
            if last.map_or(true, |prev| now.duration_since(prev) >= period) {
                print_progress(progress);
                last = Some(now);
            }
        }
    }
}

fn run() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = parse_args()?;
    if config.stats {
        taskgraph_metrics::enable();
    }
    let mut workflow = demo_workflow();

    if let Some(emit) = config.emit {
        workflow.build()?;
        let rendered = match emit {
            Emit::Dot => to_dot(&workflow),
            Emit::Makefile => to_makefile(&workflow),
        };
        print!("{}", rendered);
        return Ok(());
    }

    let targets = vec![Uri::task("package")];

    match config.worker_kind {
        WorkerKind::Serial => {
            let report = run_serial(&mut workflow, &targets, config.exit_on_failure)?;
            println!("{} tasks done", report.done.len());
        }
        WorkerKind::Threads | WorkerKind::Processes => {
            let mut scheduler = Scheduler::new(workflow, config.jobs, config.slots, config.exit_on_failure)
                .with_progress_callback(rate_limited_progress(config.update_freq));
            scheduler = match config.worker_kind {
                WorkerKind::Threads => scheduler.with_handler(Box::new(ThreadHandler::new())),
                _ => scheduler.with_handler(Box::new(ProcessHandler::new())),
            };
            let report = scheduler.run(&targets)?;
            println!(
                "{} {} tasks done",
                style("ok").green(),
                report.done.len()
            );
        }
    }

    if config.stats {
        taskgraph_metrics::dump();
    }
    Ok(())
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{} {}", style("error:").red().bold(), err);
        process::exit(1);
    }
}
