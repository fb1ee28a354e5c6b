//! Command line argument parsing
//!
//! Subcommands:
//! - `generate`: Generate text or speech for one piece of content
//! - `batch`: Run every task of a task file through the gateway
//! - `status`: Show credential pool status
//! - `show-config`: Show configuration discovery information

use crate::gateway::{ReassemblyPolicy, RetryMode};
use crate::provider::GenerationKind;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug)]
pub enum ExecutionMode {
    Generate(GenerateConfig),
    Batch(BatchConfig),
    Status { config_override: Option<PathBuf> },
    ShowConfig,
}

/// Where the content of a single generation comes from
#[derive(Debug, Clone, PartialEq)]
pub enum ContentSource {
    Inline(String),
    File(PathBuf),
}

#[derive(Debug)]
pub struct GenerateConfig {
    pub content: ContentSource,
    pub kind: GenerationKind,
    pub voice: Option<String>,
    pub model: Option<String>,
    pub output: Option<PathBuf>,
    pub retry_mode: RetryMode,
    pub reassembly: ReassemblyPolicy,
    pub config_override: Option<PathBuf>,
    pub verbose: bool,
}

#[derive(Debug)]
pub struct BatchConfig {
    pub task_file: PathBuf,
    pub output_dir: Option<PathBuf>,
    pub config_override: Option<PathBuf>,
    pub verbose: bool,
    pub dry_run: bool,
}

#[derive(Debug, Parser)]
#[command(name = "gengate")]
#[command(author = "Gengate Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Deliver text and speech generation requests across a pool of API credentials")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Generate text or speech for one piece of content
    Generate {
        /// Content to generate from (use --file to read it from a file)
        content: Option<String>,
        /// Read the content from a UTF-8 file
        #[arg(short = 'f', long = "file", conflicts_with = "content")]
        file: Option<PathBuf>,
        /// Synthesize speech instead of generating text
        #[arg(short = 's', long = "speech")]
        speech: bool,
        /// Voice used for speech synthesis
        #[arg(long = "voice")]
        voice: Option<String>,
        /// Model override
        #[arg(short = 'm', long = "model")]
        model: Option<String>,
        /// Write the result to this file (required for speech)
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
        /// Keep retrying with the long retry budget
        #[arg(long = "persistent")]
        persistent: bool,
        /// Return the first successful part of long text when other parts fail
        #[arg(long = "accept-partial")]
        accept_partial: bool,
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// Enable verbose output
        #[arg(short = 'v', long = "verbose")]
        verbose: bool,
    },
    /// Run a batch of tasks from a JSON, JSON Lines or plain text file
    Batch {
        /// Path to the task file
        file: PathBuf,
        /// Directory receiving one output file per task
        #[arg(short = 'o', long = "output-dir")]
        output_dir: Option<PathBuf>,
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// Enable verbose output
        #[arg(short = 'v', long = "verbose")]
        verbose: bool,
        /// Show the loaded tasks without running them
        #[arg(short = 'n', long = "dry-run")]
        dry_run: bool,
    },
    /// Show credential pool status
    Status {
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
    },
    /// Show configuration discovery information
    ShowConfig,
}

impl Args {
    pub fn parse() -> Self {
        Parser::parse()
    }

    pub fn mode(&self) -> Result<ExecutionMode, String> {
        match &self.command {
            Some(Commands::Generate {
                content,
                file,
                speech,
                voice,
                model,
                output,
                persistent,
                accept_partial,
                config,
                verbose,
            }) => {
                let content = match (content, file) {
                    (Some(text), None) => ContentSource::Inline(text.clone()),
                    (None, Some(path)) => ContentSource::File(path.clone()),
                    (Some(_), Some(_)) => {
                        return Err("Give either inline content or --file, not both".to_string());
                    }
                    (None, None) => {
                        return Err("Nothing to generate: pass content or --file".to_string());
                    }
                };

                let kind = if *speech || voice.is_some() {
                    GenerationKind::Speech
                } else {
                    GenerationKind::Text
                };
                if kind == GenerationKind::Speech && output.is_none() {
                    return Err("Speech output needs a destination file (--output)".to_string());
                }

                Ok(ExecutionMode::Generate(GenerateConfig {
                    content,
                    kind,
                    voice: voice.clone(),
                    model: model.clone(),
                    output: output.clone(),
                    retry_mode: if *persistent {
                        RetryMode::Persistent
                    } else {
                        RetryMode::Auto
                    },
                    reassembly: if *accept_partial {
                        ReassemblyPolicy::AcceptPartial
                    } else {
                        ReassemblyPolicy::RequireAll
                    },
                    config_override: config.clone(),
                    verbose: *verbose,
                }))
            }
            Some(Commands::Batch {
                file,
                output_dir,
                config,
                verbose,
                dry_run,
            }) => Ok(ExecutionMode::Batch(BatchConfig {
                task_file: file.clone(),
                output_dir: output_dir.clone(),
                config_override: config.clone(),
                verbose: *verbose,
                dry_run: *dry_run,
            })),
            Some(Commands::Status { config }) => Ok(ExecutionMode::Status {
                config_override: config.clone(),
            }),
            Some(Commands::ShowConfig) => Ok(ExecutionMode::ShowConfig),
            None => Err(
                "No command specified. Use 'gengate --help' to see available commands.".to_string(),
            ),
        }
    }
}
