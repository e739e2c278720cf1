//! CLI argument definitions for InvoiceFlow.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// InvoiceFlow -- durable invoice processing workflows.
#[derive(Parser)]
#[command(
    name = "invoiceflow",
    version,
    about = "InvoiceFlow -- durable invoice processing workflows",
    long_about = "Runs invoices through a checkpointed pipeline of intake, extraction, \
                  two-way matching, human review, posting and notification. Every stage \
                  survives a restart."
)]
pub struct Cli {
    /// Configuration file (TOML).
    #[arg(long, short, global = true, default_value = "invoiceflow.toml")]
    pub config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP API, resuming any unfinished instances first.
    Serve {
        /// Address to bind the HTTP server to.
        #[arg(long)]
        bind: Option<String>,

        /// Port to listen on.
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Submit an invoice (JSON file) and run it until it stops.
    Submit {
        /// Path to the invoice JSON document.
        file: PathBuf,

        /// Scheduling priority; defaults by amount.
        #[arg(long, value_enum)]
        priority: Option<PriorityArg>,
    },

    /// List OPEN reviews.
    Reviews {
        /// Maximum number of reviews to show.
        #[arg(long, short, default_value_t = 20)]
        limit: i64,
    },

    /// Record a verdict on a review and resume its instance.
    Resolve {
        /// The review to resolve.
        review_id: String,

        /// ACCEPT or REJECT.
        #[arg(value_enum)]
        verdict: VerdictArg,

        /// Who is deciding.
        #[arg(long, short)]
        reviewer: String,

        /// Why.
        #[arg(long, short = 'm', default_value = "")]
        rationale: String,
    },

    /// Show one instance, or list instances.
    Status {
        /// Instance to show; omit to list.
        instance_id: Option<String>,

        /// Only list instances with this status.
        #[arg(long, short)]
        status: Option<String>,

        /// Maximum number of instances to list.
        #[arg(long, short, default_value_t = 20)]
        limit: i64,
    },

    /// Print an instance's audit trail.
    Trace {
        /// The instance to trace.
        instance_id: String,
    },

    /// Resume every unfinished instance and wait for them to stop.
    ///
    /// `serve` already does this on startup. Refused while a server holds
    /// the database's lock file, since both would run the same instances.
    Recover {
        /// Run even though a live server holds the lock.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum PriorityArg {
    Critical,
    High,
    Normal,
    Low,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum VerdictArg {
    Accept,
    Reject,
}
