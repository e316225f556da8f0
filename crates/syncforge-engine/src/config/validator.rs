//! Semantic validation for parsed pipeline configuration values.

use std::collections::HashSet;

use anyhow::{bail, Result};
use syncforge_state::DEFAULT_MAX_BATCH_SIZE;
use syncforge_types::state::SyncMode;

use crate::config::types::{DestinationConfig, PipelineConfig, SourceConfig};

fn validate_source(source: &SourceConfig, errors: &mut Vec<String>) {
    if source.resource.trim().is_empty() {
        errors.push("Source resource must not be empty".to_string());
    } else if source.resource.contains('/') {
        errors.push(format!(
            "Source resource '{}' must be a single path segment",
            source.resource
        ));
    }
    if source.base_url.trim().is_empty() {
        errors.push("Source base_url must not be empty".to_string());
    }
    if source.endpoint.trim().is_empty() {
        errors.push("Source endpoint must not be empty".to_string());
    }
    if source.items.is_empty() {
        errors.push("Source must define at least one item".to_string());
    }
    let mut seen = HashSet::new();
    for (i, item) in source.items.iter().enumerate() {
        if item.trim().is_empty() {
            errors.push(format!("Item {i} is empty"));
        } else if item.contains('/') || item == "." || item == ".." {
            errors.push(format!("Item '{item}' must be a single key segment"));
        } else if !seen.insert(item.as_str()) {
            errors.push(format!("Item '{item}' is listed more than once"));
        }
    }
    if source.page_size == 0 {
        errors.push("Source page_size must be at least 1".to_string());
    }
    if source.id_fields.is_empty() {
        errors.push("Source must define at least one id field".to_string());
    }
    if source.id_fields.iter().any(|f| f.trim().is_empty()) {
        errors.push("Source id_fields must not contain empty names".to_string());
    }
}

fn validate_destinations(destinations: &[DestinationConfig], errors: &mut Vec<String>) {
    if destinations.is_empty() {
        errors.push("Pipeline must define at least one destination".to_string());
    }
    let mut names = HashSet::new();
    for (i, dest) in destinations.iter().enumerate() {
        if dest.name.trim().is_empty() {
            errors.push(format!("Destination {i} has an empty name"));
        } else if !names.insert(dest.name.as_str()) {
            errors.push(format!("Destination name '{}' is used more than once", dest.name));
        }
        if dest.kind.needs_path() && dest.path.is_none() {
            errors.push(format!(
                "Destination '{}' of kind '{}' requires a path",
                dest.name,
                dest.kind.as_str()
            ));
        }
        if !(1..=DEFAULT_MAX_BATCH_SIZE).contains(&dest.max_batch_size) {
            errors.push(format!(
                "Destination '{}' max_batch_size must be between 1 and {DEFAULT_MAX_BATCH_SIZE}",
                dest.name
            ));
        }
    }
}

/// Validate a parsed pipeline configuration.
/// Returns `Ok(())` if valid, Err with all validation errors if not.
///
/// # Errors
///
/// Returns an error listing all validation failures found in the pipeline config.
pub fn validate_pipeline(config: &PipelineConfig) -> Result<()> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(format!(
            "Unsupported pipeline version '{}', expected '1.0'",
            config.version
        ));
    }

    if config.pipeline.trim().is_empty() {
        errors.push("Pipeline name must not be empty".to_string());
    }

    validate_source(&config.source, &mut errors);
    errors.extend(config.run_params().problems());
    validate_destinations(&config.destinations, &mut errors);

    match config.state.read_from.as_deref() {
        Some(name) if !config.destinations.iter().any(|d| d.name == name) => {
            errors.push(format!(
                "state.read_from '{name}' does not name a configured destination"
            ));
        }
        None if config.run.mode == SyncMode::Incremental => {
            errors.push("Incremental mode requires state.read_from".to_string());
        }
        _ => {}
    }

    if errors.is_empty() {
        Ok(())
    } else {
        bail!("Pipeline validation failed:\n  - {}", errors.join("\n  - "));
    }
}
