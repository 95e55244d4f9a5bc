//! Workflow CLI commands

use clap::{Subcommand, ValueEnum};

/// Output format for `render`
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RenderFormat {
    Json,
    Yaml,
}

#[derive(Subcommand)]
pub enum WorkflowCommands {
    /// Validate a definition file and report every issue found
    Validate {
        /// Definition file (JSON or YAML)
        file: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Parse a definition and print its canonical form
    Render {
        /// Definition file (JSON or YAML)
        file: String,

        /// Output format
        #[arg(short, long, value_enum, default_value = "json")]
        format: RenderFormat,
    },

    /// Publish a definition file, or every definition in a directory
    Publish {
        /// Definition file or directory
        path: String,

        /// Definition name (defaults to the file stem)
        #[arg(short, long)]
        name: Option<String>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// List published definitions
    Definitions {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Start a run of the latest version of a definition
    Start {
        /// Definition name
        definition: String,

        /// Input data as JSON
        #[arg(short = 'd', long, default_value = "{}")]
        input: String,

        /// Initiator identity
        #[arg(short, long, default_value = "cli-user")]
        initiator: String,

        /// SLA deadline in seconds from now (defaults to configuration)
        #[arg(long)]
        deadline_seconds: Option<u64>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show a run
    Status {
        /// Run ID (UUID)
        run_id: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// List runs
    Runs {
        /// Only runs that are still active
        #[arg(long)]
        active: bool,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Approve the pending task at a state
    Approve {
        /// Run ID (UUID)
        run_id: String,

        /// State id the task is keyed by
        state_id: String,

        /// Actor identity
        #[arg(short, long, default_value = "cli-operator")]
        actor: String,

        /// Decision comment
        #[arg(short, long)]
        comment: Option<String>,

        /// Server URL for remote operation
        #[arg(long, default_value = "")]
        server: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Reject the pending task at a state
    Reject {
        /// Run ID (UUID)
        run_id: String,

        /// State id the task is keyed by
        state_id: String,

        /// Actor identity
        #[arg(short, long, default_value = "cli-operator")]
        actor: String,

        /// Decision comment
        #[arg(short, long)]
        comment: Option<String>,

        /// Server URL for remote operation
        #[arg(long, default_value = "")]
        server: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Deliver an event to a run
    Notify {
        /// Run ID (UUID)
        run_id: String,

        /// Event type awaited by `event:<type>` tasks
        event_type: String,

        /// Event payload as JSON
        #[arg(short, long, default_value = "null")]
        payload: String,

        /// Server URL for remote operation
        #[arg(long, default_value = "")]
        server: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// List pending approval tasks
    Approvals {
        /// Filter by run ID (optional)
        #[arg(short, long)]
        run: Option<String>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show the audit trail of a run
    Audit {
        /// Run ID (UUID)
        run_id: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Run one scheduler pass: wake due runs, apply timeouts, check SLAs
    Tick {
        /// Server URL for remote operation
        #[arg(long, default_value = "")]
        server: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Cancel a run
    Cancel {
        /// Run ID (UUID)
        run_id: String,

        /// Actor identity
        #[arg(short, long, default_value = "cli-operator")]
        actor: String,

        /// Cancellation reason
        #[arg(short, long)]
        reason: Option<String>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}
