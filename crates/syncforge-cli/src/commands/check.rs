use std::path::Path;

use anyhow::{Context, Result};

use syncforge_engine::config::backends::{self, BackendCheck};
use syncforge_engine::config::{parser, validator};

/// Execute the `check` command: validate pipeline config and open every backend.
pub fn execute(pipeline_path: &Path) -> Result<()> {
    // 1. Parse pipeline YAML
    let config = parser::parse_pipeline(pipeline_path)
        .with_context(|| format!("Failed to parse pipeline: {}", pipeline_path.display()))?;

    // 2. Validate pipeline structure
    validator::validate_pipeline(&config)?;
    println!("Pipeline structure: OK");
    println!(
        "  {} item(s) from {}/{} in {} mode",
        config.source.items.len(),
        config.source.base_url.trim_end_matches('/'),
        config.source.endpoint.trim_start_matches('/'),
        config.run.mode
    );

    // 3. Open destinations and run history
    let checks = backends::check_backends(&config);
    for check in &checks {
        print_check(check);
    }

    if checks.iter().all(BackendCheck::is_ok) {
        println!("\nAll checks passed.");
        Ok(())
    } else {
        anyhow::bail!("One or more checks failed")
    }
}

fn print_check(check: &BackendCheck) {
    let status = if check.is_ok() { "OK" } else { "FAILED" };
    println!("{:24} {}", format!("{}:", check.label), status);
    if let Some(error) = &check.error {
        println!("  {error}");
    }
}
