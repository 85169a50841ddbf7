use anyhow::Result;
use clap::{Parser, Subcommand};
use semantic_reindex::commands::{self, IngestArgs, SearchArgs};
use semantic_reindex::config::{Config, get_config_dir, show_config};
use semantic_reindex::pipeline::{CancelSignal, IngestionReport, PipelineState, cancel_pair};
use semantic_reindex::search::{SearchMode, parse_modes};
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "semantic-reindex")]
#[command(about = "Embed search-index documents into a vector index and run semantic search against it")]
#[command(version)]
struct Cli {
    /// Directory holding config.toml and the checkpoint (default: ~/.semantic-reindex)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Comma-separated search modes, or `all`
#[derive(Debug, Clone, PartialEq, Eq)]
struct ModeList(Vec<SearchMode>);

impl FromStr for ModeList {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        parse_modes(value).map(Self)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Write a configuration file, or show the effective configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Copy every source document into the destination index with its embedding
    Ingest {
        /// Ignore the stored checkpoint and start from the first document
        #[arg(long)]
        reset: bool,
        /// Number of batches allowed in flight at once
        #[arg(long)]
        depth: Option<usize>,
    },
    /// Run search terms against the destination index
    Search {
        /// File with one search term per line
        #[arg(long)]
        terms_file: Option<PathBuf>,
        /// Maximum results per term
        #[arg(long)]
        limit: Option<usize>,
        /// Modes to compare, comma-separated (semantic, hybrid, lexical) or `all`
        #[arg(long)]
        mode: Option<ModeList>,
        /// Write a JSON report with per-term results and timings
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Ingest, then search once the source is drained
    Run {
        /// Ignore the stored checkpoint and start from the first document
        #[arg(long)]
        reset: bool,
        /// Modes to compare, comma-separated (semantic, hybrid, lexical) or `all`
        #[arg(long)]
        mode: Option<ModeList>,
        /// Write a JSON report with per-term results and timings
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Show the stored ingestion checkpoint
    Status,
}

fn cancel_on_ctrl_c() -> CancelSignal {
    let (handle, signal) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing the batches in flight");
            handle.cancel();
        }
    });
    signal
}

fn exit_code(report: &IngestionReport, max_failure_ratio: f64) -> ExitCode {
    if report.is_success(max_failure_ratio) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_dir = get_config_dir(cli.config_dir.as_deref())?;
    let config = Config::load(&config_dir)?;

    match cli.command {
        Commands::Config { show } => {
            if show {
                show_config(&config);
            } else {
                commands::init_config(&config).await?;
            }
        }
        Commands::Ingest { reset, depth } => {
            let report =
                commands::ingest(&config, IngestArgs { reset, depth }, cancel_on_ctrl_c()).await?;
            return Ok(exit_code(&report, config.pipeline.max_failure_ratio));
        }
        Commands::Search {
            terms_file,
            limit,
            mode,
            output,
        } => {
            let args = SearchArgs {
                terms_file,
                limit,
                modes: mode.map(|ModeList(modes)| modes),
                output,
            };
            commands::search(&config, args).await?;
        }
        Commands::Run {
            reset,
            mode,
            output,
        } => {
            let args = IngestArgs {
                reset,
                depth: None,
            };
            let report = commands::ingest(&config, args, cancel_on_ctrl_c()).await?;
            if report.final_state != PipelineState::Drained {
                warn!("Ingestion did not drain the source, skipping search");
                return Ok(ExitCode::FAILURE);
            }
            info!("Ingestion drained, running search terms");
            commands::search(
                &config,
                SearchArgs {
                    modes: mode.map(|ModeList(modes)| modes),
                    output,
                    ..SearchArgs::default()
                },
            )
            .await?;
            return Ok(exit_code(&report, config.pipeline.max_failure_ratio));
        }
        Commands::Status => {
            commands::show_status(&config).await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn cli_parsing() {
        let cli = Cli::try_parse_from(["semantic-reindex", "status"]).expect("status parses");
        assert!(matches!(cli.command, Commands::Status));
        assert_eq!(cli.config_dir, None);
    }

    #[test]
    fn global_config_dir() {
        let cli = Cli::try_parse_from(["semantic-reindex", "ingest", "--config-dir", "/tmp/reindex"])
            .expect("config dir after subcommand parses");
        assert_eq!(cli.config_dir, Some(PathBuf::from("/tmp/reindex")));

        let cli = Cli::try_parse_from(["semantic-reindex", "--config-dir", "/tmp/reindex", "status"])
            .expect("config dir before subcommand parses");
        assert_eq!(cli.config_dir, Some(PathBuf::from("/tmp/reindex")));
    }

    #[test]
    fn ingest_flags() {
        let cli = Cli::try_parse_from(["semantic-reindex", "ingest", "--reset", "--depth", "3"])
            .expect("ingest parses");
        match cli.command {
            Commands::Ingest { reset, depth } => {
                assert!(reset);
                assert_eq!(depth, Some(3));
            }
            _ => panic!("expected ingest"),
        }

        let cli = Cli::try_parse_from(["semantic-reindex", "ingest"]).expect("ingest parses");
        assert!(matches!(
            cli.command,
            Commands::Ingest {
                reset: false,
                depth: None
            }
        ));
    }

    #[test]
    fn search_options() {
        let cli = Cli::try_parse_from([
            "semantic-reindex",
            "search",
            "--terms-file",
            "queries.txt",
            "--limit",
            "3",
            "--mode",
            "hybrid",
            "--output",
            "report.json",
        ])
        .expect("search parses");

        match cli.command {
            Commands::Search {
                terms_file,
                limit,
                mode,
                output,
            } => {
                assert_eq!(terms_file, Some(PathBuf::from("queries.txt")));
                assert_eq!(limit, Some(3));
                assert_eq!(mode, Some(ModeList(vec![SearchMode::Hybrid])));
                assert_eq!(output, Some(PathBuf::from("report.json")));
            }
            _ => panic!("expected search"),
        }
    }

    #[test]
    fn search_mode_lists() {
        let modes = |arg: &str| {
            let cli = Cli::try_parse_from(["semantic-reindex", "search", "--mode", arg])
                .expect("search parses");
            match cli.command {
                Commands::Search { mode, .. } => mode,
                _ => panic!("expected search"),
            }
        };

        assert_eq!(modes("all"), Some(ModeList(SearchMode::ALL.to_vec())));
        assert_eq!(
            modes("semantic,lexical"),
            Some(ModeList(vec![SearchMode::Semantic, SearchMode::Lexical]))
        );

        let cli = Cli::try_parse_from(["semantic-reindex", "search"]).expect("search parses");
        assert!(matches!(cli.command, Commands::Search { mode: None, .. }));

        let cli = Cli::try_parse_from(["semantic-reindex", "run", "--mode", "all"])
            .expect("run parses");
        match cli.command {
            Commands::Run { reset, mode, .. } => {
                assert!(!reset);
                assert_eq!(mode, Some(ModeList(SearchMode::ALL.to_vec())));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn invalid_search_mode() {
        let result = Cli::try_parse_from(["semantic-reindex", "search", "--mode", "fuzzy"]);
        assert!(matches!(
            result.map_err(|e| e.kind()),
            Err(ErrorKind::ValueValidation)
        ));
    }

    #[test]
    fn config_show_flag() {
        let cli =
            Cli::try_parse_from(["semantic-reindex", "config", "--show"]).expect("config parses");
        assert!(matches!(cli.command, Commands::Config { show: true }));
    }

    #[test]
    fn missing_subcommand() {
        let result = Cli::try_parse_from(["semantic-reindex"]);
        assert!(result.is_err());
    }
}
