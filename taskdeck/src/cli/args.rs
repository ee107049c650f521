//! CLI argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Taskdeck - drive a coding agent against markdown tasks
#[derive(Parser, Debug)]
#[command(name = "taskdeck")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (defaults to ~/.taskdeck/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the session server
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Open browser automatically
        #[arg(long)]
        open: bool,

        /// Directory of markdown task files
        #[arg(long)]
        tasks_dir: Option<PathBuf>,

        /// Working directory for the agent
        #[arg(long)]
        working_dir: Option<PathBuf>,

        /// Agent executable
        #[arg(long)]
        agent_command: Option<String>,
    },

    /// List tasks
    Tasks,

    /// Start (or resume) the agent for a task
    Start {
        /// Task ID
        task_id: String,
    },

    /// Send a message to the running agent
    Send {
        /// Task ID
        task_id: String,

        /// Message text
        #[arg(trailing_var_arg = true, required = true)]
        text: Vec<String>,
    },

    /// Stop the agent for a task
    Stop {
        /// Task ID
        task_id: String,
    },

    /// Delete a task's session and transcript
    Clear {
        /// Task ID
        task_id: String,
    },

    /// List sessions
    Sessions,

    /// Print a session transcript
    Show {
        /// Task ID
        task_id: String,
    },

    /// Follow session events live, reconnecting when the stream drops
    Watch {
        /// Only events for this task
        task_id: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_joins_trailing_words() {
        let cli = Cli::parse_from(["taskdeck", "send", "T1", "please", "continue"]);
        let Commands::Send { task_id, text } = cli.command else {
            panic!("expected send");
        };
        assert_eq!(task_id, "T1");
        assert_eq!(text, vec!["please", "continue"]);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["taskdeck", "watch", "--verbose", "--config", "/tmp/c.toml"]);
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.toml")));
        assert!(matches!(cli.command, Commands::Watch { task_id: None }));
    }

    #[test]
    fn test_serve_overrides() {
        let cli = Cli::parse_from(["taskdeck", "serve", "-p", "9000", "--tasks-dir", "t"]);
        let Commands::Serve { port, tasks_dir, .. } = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(port, Some(9000));
        assert_eq!(tasks_dir, Some(PathBuf::from("t")));
    }
}
