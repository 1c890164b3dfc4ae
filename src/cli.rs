// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "corvid",
    about = "Chat-bot orchestration runtime: priority lanes, a tool-using LLM loop, skills, cron self-calls, and cognitive memory",
    version
)]
pub struct Cli {
    /// Explicit config file (merged over the standard search paths)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the bot against the JSON-lines transport on stdin/stdout
    Run,
    /// Print the effective merged configuration
    ShowConfig,
    /// Parse a config file and report errors
    ValidateConfig {
        /// Path to the config file to check
        file: PathBuf,
    },
    /// List discovered skills (tools, agents, commands)
    ListSkills,
}
