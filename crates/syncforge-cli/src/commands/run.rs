use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use syncforge_engine::config::{backends, parser, validator};
use syncforge_engine::Orchestrator;
use syncforge_types::state::{CommitOutcome, RunStats, SyncMode};

use crate::http_source::HttpPageSource;

/// Execute the `run` command: parse, validate, and run a pipeline.
pub async fn execute(pipeline_path: &Path, dry_run: bool, mode: Option<SyncMode>) -> Result<()> {
    // 1. Parse pipeline YAML
    let mut config = parser::parse_pipeline(pipeline_path)
        .with_context(|| format!("Failed to parse pipeline: {}", pipeline_path.display()))?;
    if let Some(mode) = mode {
        config.run.mode = mode;
    }

    // 2. Validate
    validator::validate_pipeline(&config)?;

    tracing::info!(
        pipeline = config.pipeline,
        resource = config.source.resource,
        mode = %config.run.mode,
        items = config.source.items.len(),
        destinations = config.destinations.len(),
        dry_run,
        "Pipeline validated"
    );

    // 3. Wire capabilities
    let opened = backends::open_backends(&config, dry_run)?;
    let source = HttpPageSource::from_config(
        &config.source,
        Duration::from_millis(config.run.operation_timeout_ms),
    )?;

    let cancel = CancellationToken::new();
    let mut orchestrator = Orchestrator::new(
        config.pipeline.clone(),
        config.run_params(),
        Arc::new(source),
        Arc::new(config.shape()),
    )
    .with_cancellation(cancel.clone());
    for destination in opened.destinations {
        orchestrator = orchestrator.with_destination(destination);
    }
    if let Some(reader) = opened.reader {
        orchestrator = orchestrator.with_reader(reader);
    }
    if let Some(ledger) = opened.ledger {
        orchestrator = orchestrator.with_ledger(ledger);
    }

    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received; remaining chunks will be skipped");
            cancel.cancel();
        }
    });

    // 4. Run
    let outcome = orchestrator.run(&config.source.items).await;
    interrupt.abort();

    match outcome {
        Ok(stats) => {
            println!("Pipeline '{}' completed.", stats.pipeline);
            print_summary(&stats, dry_run);
            print_json(&stats)?;
            Ok(())
        }
        Err(failure) => {
            println!("Pipeline '{}' errored.", failure.stats.pipeline);
            print_summary(&failure.stats, dry_run);
            print_json(&failure.stats)?;
            Err(failure.into())
        }
    }
}

fn print_summary(stats: &RunStats, dry_run: bool) {
    if dry_run {
        println!("  (dry run: nothing was written)");
    }
    println!("  Mode:            {}", stats.mode);
    println!("  Final stage:     {}", stats.final_stage);
    println!(
        "  Items:           {} ok, {} failed",
        stats.extraction.success, stats.extraction.failure
    );
    println!(
        "  Records:         {} ok, {} rejected",
        stats.transformation.success, stats.transformation.failure
    );
    println!(
        "  Writes:          {} ok, {} failed",
        stats.load.success, stats.load.failure
    );
    for (name, result) in &stats.destinations {
        let outcome = match result.outcome() {
            CommitOutcome::Empty => "nothing to write",
            CommitOutcome::FullySucceeded => "ok",
            CommitOutcome::PartiallyFailed => "PARTIAL",
            CommitOutcome::FullyFailed => "FAILED",
        };
        println!(
            "    {:14} {}/{} in {} batch(es), {}",
            format!("{name}:"),
            result.succeeded,
            result.attempted,
            result.batches,
            outcome
        );
    }
    if stats.warnings > 0 {
        println!("  Warnings:        {}", stats.warnings);
    }
    for timing in &stats.stages {
        println!("    {:14} {}ms", format!("{}:", timing.stage), timing.duration_ms);
    }
    #[allow(clippy::cast_precision_loss)]
    let secs = stats.duration_ms() as f64 / 1_000.0;
    println!("  Duration:        {secs:.2}s");
    if let Some(message) = &stats.error_message {
        println!("  Error:           {message}");
    }
}

/// Machine-readable run statistics on one line.
fn print_json(stats: &RunStats) -> Result<()> {
    let json = serde_json::to_string(stats).context("Failed to encode run statistics")?;
    println!("@@RUN_STATS@@{json}");
    Ok(())
}
