//! MicroVM Sandbox - Entry Point
//!
//! Operator utility binary. Its main job today is offline verification of
//! the audit chain.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result, miette};
use tracing::{Level, info};
use tracing_subscriber::{EnvFilter, fmt};

/// MicroVM Sandbox - hardware-isolated tool execution with audited decisions.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Verify the integrity of an audit log's hash chain and signatures
    VerifyLog {
        /// Path to the audit log file
        log: PathBuf,

        /// HMAC secret the log was written with
        #[arg(long, env = "MVS_AUDIT_SECRET", hide_env_values = true)]
        secret: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout is reserved for command output.
    let filter = if args.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match args.command {
        Command::VerifyLog { log, secret } => {
            info!("Verifying audit log {}", log.display());

            let intact = microvm_sandbox::audit::verify_file(&log, secret.as_bytes())
                .into_diagnostic()?;

            if intact {
                println!("OK: audit chain intact");
                Ok(())
            } else {
                Err(miette!(
                    code = "mvs::audit::tampered",
                    help = "the log was modified, truncated in the middle, or written with a different secret",
                    "audit chain verification failed for {}",
                    log.display()
                ))
            }
        }
    }
}
