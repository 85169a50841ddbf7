use console::style;

use super::settings::Config;

const REDACTED: &str = "********";

fn redact(key: Option<&String>) -> String {
    key.map_or_else(|| "(not set)".to_string(), |_| REDACTED.to_string())
}

/// Print the effective configuration to stderr, with credentials hidden
#[inline]
pub fn show_config(config: &Config) {
    eprintln!("{}", style("📋 Current Configuration").bold().cyan());
    eprintln!();

    eprintln!("{}", style("Elasticsearch:").bold().yellow());
    eprintln!("  URL: {}", style(&config.elasticsearch.url).cyan());
    eprintln!(
        "  API Key: {}",
        style(redact(config.elasticsearch.api_key.as_ref())).dim()
    );
    eprintln!(
        "  Timeout: {}s",
        style(config.elasticsearch.timeout_seconds).cyan()
    );
    eprintln!();

    eprintln!("{}", style("Source:").bold().yellow());
    eprintln!("  Index: {}", style(&config.source.index).cyan());
    eprintln!("  Page Size: {}", style(config.source.page_size).cyan());
    eprintln!("  Sort Field: {}", style(&config.source.sort_field).cyan());
    eprintln!(
        "  Text Fields: {}",
        style(config.source.text_fields.join(", ")).cyan()
    );
    eprintln!(
        "  Point In Time: {}",
        style(config.source.point_in_time).cyan()
    );
    eprintln!();

    eprintln!("{}", style("Destination:").bold().yellow());
    eprintln!("  Index: {}", style(&config.destination.index).cyan());
    eprintln!(
        "  Vector Field: {}",
        style(&config.destination.vector_field).cyan()
    );
    eprintln!();

    eprintln!("{}", style("Embedding Service:").bold().yellow());
    eprintln!("  URL: {}", style(&config.embedding.url).cyan());
    eprintln!(
        "  API Key: {}",
        style(redact(config.embedding.api_key.as_ref())).dim()
    );
    eprintln!("  Model: {}", style(&config.embedding.model).cyan());
    eprintln!("  Dimensions: {}", style(config.embedding.dimensions).cyan());
    eprintln!("  Batch Size: {}", style(config.embedding.batch_size).cyan());
    eprintln!(
        "  Max Request Size: {}",
        style(config.embedding.max_request_size).cyan()
    );
    eprintln!();

    eprintln!("{}", style("Pipeline:").bold().yellow());
    eprintln!("  Depth: {}", style(config.pipeline.depth).cyan());
    eprintln!(
        "  Max Failed Batches: {}",
        style(config.pipeline.max_failed_batches).cyan()
    );
    eprintln!(
        "  Max Failure Ratio: {}",
        style(config.pipeline.max_failure_ratio).cyan()
    );
    eprintln!(
        "  Retries: {} attempts, {}ms base delay",
        style(config.retry.max_attempts).cyan(),
        style(config.retry.base_delay_ms).cyan()
    );
    eprintln!();

    eprintln!("{}", style("Search:").bold().yellow());
    eprintln!(
        "  Terms File: {}",
        style(config.search.terms_file.display()).cyan()
    );
    eprintln!("  Results: {}", style(config.search.results_limit).cyan());
    let modes: Vec<String> = config.search.modes.iter().map(ToString::to_string).collect();
    eprintln!("  Modes: {}", style(modes.join(", ")).cyan());

    eprintln!();
    eprintln!(
        "Config file: {}",
        style(config.config_file_path().display()).dim()
    );
    eprintln!(
        "Checkpoint: {}",
        style(config.checkpoint_path().display()).dim()
    );
}
