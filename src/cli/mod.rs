pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use crate::domain::{SubTask, TaskType};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log debug output of the harvester
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to a file (the default location when no path is given)
    #[arg(long, global = true, num_args = 0..=1)]
    pub log_file: Option<Option<PathBuf>>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the cluster coordinator
    Coordinator {
        /// Configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Run a worker node
    Worker {
        /// Configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Run a coordinator and workers in one process
    Standalone {
        /// Configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of workers
        #[arg(short, long, default_value_t = 1)]
        workers: usize,

        /// URLs submitted as jobs before starting
        #[arg(long)]
        url: Vec<String>,
    },

    /// Submit a processing job
    Submit {
        /// Configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// URLs of the documents to retrieve
        #[arg(long, required = true)]
        url: Vec<String>,

        /// check-link, conditional-download or unconditional-download
        #[arg(long, default_value = "unconditional-download", value_parser = parse_task_type)]
        task_type: TaskType,

        /// Thumbnail size as WIDTHxHEIGHT
        #[arg(long, value_parser = parse_thumbnail)]
        thumbnail: Vec<SubTask>,

        /// Extract dominant colors
        #[arg(long)]
        color: bool,

        /// Extract media metadata
        #[arg(long)]
        meta: bool,

        /// Also store the documents as a processing profile kept fresh by the restarter
        #[arg(long)]
        profile: Option<String>,
    },

    /// Show job counts per state
    Status {
        /// Configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Show or write the configuration
    Config {
        /// Write the default configuration
        #[arg(long)]
        init: bool,

        /// Configuration file
        #[arg(short, long)]
        path: Option<PathBuf>,
    },
}

fn parse_task_type(value: &str) -> Result<TaskType, String> {
    match value.to_lowercase().replace('_', "-").as_str() {
        "check-link" => Ok(TaskType::CheckLink),
        "conditional-download" => Ok(TaskType::ConditionalDownload),
        "unconditional-download" => Ok(TaskType::UnconditionalDownload),
        other => Err(format!("unknown task type: {}", other)),
    }
}

fn parse_thumbnail(value: &str) -> Result<SubTask, String> {
    let (width, height) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {}", value))?;
    let width = width.trim().parse::<u32>().map_err(|e| format!("bad width: {}", e))?;
    let height = height.trim().parse::<u32>().map_err(|e| format!("bad height: {}", e))?;
    Ok(SubTask::GenerateThumbnail { width, height })
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Coordinator { config } => {
            info!("Starting coordinator");
            commands::coordinator(config).await
        }
        Commands::Worker { config } => {
            info!("Starting worker");
            commands::worker(config).await
        }
        Commands::Standalone { config, workers, url } => {
            info!("Starting standalone harvester with {} workers", workers);
            commands::standalone(config, workers, url).await
        }
        Commands::Submit { config, url, task_type, thumbnail, color, meta, profile } => {
            let mut sub_tasks = thumbnail;
            if color {
                sub_tasks.push(SubTask::ColorExtraction);
            }
            if meta {
                sub_tasks.push(SubTask::MetaExtraction);
            }
            info!("Submitting {} documents", url.len());
            commands::submit(config, url, task_type, sub_tasks, profile).await
        }
        Commands::Status { config } => commands::status(config).await,
        Commands::Config { init, path } => {
            if init {
                info!("Writing default configuration");
                commands::init_config(path).await
            } else {
                commands::show_config(path).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }

    #[test]
    fn test_submit_arguments() {
        let cli = Cli::try_parse_from([
            "harvester",
            "submit",
            "--url",
            "https://a.org/1.png",
            "--task-type",
            "conditional_download",
            "--thumbnail",
            "180x180",
            "--meta",
        ])
        .unwrap();

        match cli.command {
            Commands::Submit { url, task_type, thumbnail, meta, color, .. } => {
                assert_eq!(url, vec!["https://a.org/1.png".to_string()]);
                assert_eq!(task_type, TaskType::ConditionalDownload);
                assert_eq!(thumbnail, vec![SubTask::GenerateThumbnail { width: 180, height: 180 }]);
                assert!(meta);
                assert!(!color);
            }
            _ => panic!("expected submit"),
        }
    }

    #[test]
    fn test_bad_thumbnail_is_rejected() {
        assert!(parse_thumbnail("180").is_err());
        assert!(parse_thumbnail("axb").is_err());
        assert!(Cli::try_parse_from(["harvester", "submit", "--url", "x", "--task-type", "fetch"]).is_err());
    }
}
