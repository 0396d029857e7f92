//! duscan - Parallel Disk-Usage Analyzer
//!
//! Entry point for the CLI application.

use anyhow::{Context, Result};
use clap::Parser;
use duscan::config::{CliArgs, Config, OutPath, Source};
use duscan::error::Error;
use duscan::progress::{print_header, print_summary, spawn_reporter};
use duscan::scan::Scanner;
use duscan::sink::{BinSink, JsonSink, ScanCounters, Sink};
use duscan::sources;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::error;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args = CliArgs::parse();
    setup_logging(args.verbose);

    let config = Config::from_args(args).context("Invalid configuration")?;
    match &config.source {
        Source::Scan(dir) => run_scan(&config, dir.clone()),
        Source::Import(src) => run_import(&config, src.clone()),
    }
}

fn run_scan(config: &Config, dir: PathBuf) -> Result<()> {
    let start = Instant::now();
    let scanner = Scanner::new(config.scan.clone());
    install_interrupt_handler(scanner.abort_flag())?;

    if config.show_progress {
        print_header(&dir, config.scan.threads.max(1));
    }
    let stop = Arc::new(AtomicBool::new(false));
    let reporter = config.show_progress.then(|| {
        spawn_reporter(
            scanner.counters(),
            scanner.hardlink_progress(),
            Arc::clone(&stop),
        )
    });

    let outcome = (|| -> Result<Option<duscan::Tree>, Error> {
        if let (Some(out), None) = (&config.binary_out, &config.json_out) {
            // Stream the scan straight into the container.
            let sink = Sink::Binary(BinSink::new(
                open_out(out)?,
                config.compress_level,
                config.block_size,
            )?);
            let complete = scanner.run(&dir, &sink)?;
            let Sink::Binary(b) = sink else { unreachable!() };
            if !complete {
                return Err(Error::Interrupted);
            }
            b.finalize()?;
            return Ok(None);
        }

        let tree = scanner.scan_to_tree(&dir)?;
        if let Some(out) = &config.json_out {
            sources::export_json_tree(&tree, open_out(out)?, config.json_compress)?;
        }
        if let Some(out) = &config.binary_out {
            sources::export_binary_tree(
                &tree,
                open_out(out)?,
                config.compress_level,
                config.block_size,
            )?;
        }
        Ok(Some(tree))
    })();

    stop.store(true, Ordering::Relaxed);
    if let Some(handle) = reporter {
        let _ = handle.join();
    }
    match outcome {
        Ok(Some(tree)) => {
            if config.show_progress {
                print_summary(&tree, start.elapsed());
            }
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(e) => Err(e).context("Scan failed"),
    }
}

fn run_import(config: &Config, src: Option<PathBuf>) -> Result<()> {
    let start = Instant::now();
    let counters = ScanCounters::new(1);

    let result = (|| -> Result<(), Error> {
        match (&config.json_out, &config.binary_out) {
            // Pure conversions stream without building a tree.
            (Some(out), None) => {
                let sink = Sink::Json(JsonSink::new(open_out(out)?, config.json_compress)?);
                let mut threads = sink.create_threads(&counters);
                sources::import_path(src.as_deref(), &sink, &mut threads[0])?;
                drop(threads);
                let Sink::Json(j) = sink else { unreachable!() };
                j.finish().map_err(Error::Io)?;
                Ok(())
            }
            (None, Some(out)) => {
                let sink = Sink::Binary(BinSink::new(
                    open_out(out)?,
                    config.compress_level,
                    config.block_size,
                )?);
                let mut threads = sink.create_threads(&counters);
                sources::import_path(src.as_deref(), &sink, &mut threads[0])?;
                let Sink::Binary(b) = &sink else { unreachable!() };
                b.finish_thread(&mut threads[0]);
                drop(threads);
                let Sink::Binary(b) = sink else { unreachable!() };
                b.finalize()?;
                Ok(())
            }
            _ => {
                let tree = sources::import_to_tree(src.as_deref())?;
                if let Some(out) = &config.json_out {
                    sources::export_json_tree(&tree, open_out(out)?, config.json_compress)?;
                }
                if let Some(out) = &config.binary_out {
                    sources::export_binary_tree(
                        &tree,
                        open_out(out)?,
                        config.compress_level,
                        config.block_size,
                    )?;
                }
                if config.show_progress
                    && config.json_out.is_none()
                    && config.binary_out.is_none()
                {
                    print_summary(&tree, start.elapsed());
                }
                Ok(())
            }
        }
    })();
    result.context("Import failed")
}

fn open_out(out: &OutPath) -> Result<Box<dyn Write + Send>, Error> {
    Ok(match out {
        Some(path) => Box::new(std::fs::File::create(path)?),
        None => Box::new(std::io::stdout()),
    })
}

fn install_interrupt_handler(abort: Arc<AtomicBool>) -> Result<()> {
    let count = Arc::new(AtomicU32::new(0));
    ctrlc::set_handler(move || {
        if count.fetch_add(1, Ordering::SeqCst) == 0 {
            eprintln!("\nInterrupt received, finishing current directories...");
            eprintln!("Press Ctrl+C again to force exit immediately.");
            abort.store(true, Ordering::SeqCst);
        } else {
            eprintln!("\nForced exit!");
            std::process::exit(130);
        }
    })
    .context("Failed to set signal handler")
}

fn setup_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("duscan=debug")
    } else {
        EnvFilter::new("duscan=warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
