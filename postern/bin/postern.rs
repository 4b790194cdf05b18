//! Postern daemon and operator tool
//!
//! `postern run` delivers queued mail until interrupted. The other
//! subcommands queue, inspect and retry mail in the configured store.

#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use postern::{Postern, SendRequest, commands};
use postern_common::logging;
use postern_delivery::DeliveryOutcome;
use postern_store::MailStatus;

/// Outbound mail delivery
#[derive(Parser, Debug)]
#[command(name = "postern")]
#[command(about = "Deliver outbound mail with retries", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file, overriding the usual search
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Deliver queued mail until interrupted
    Run,
    /// Queue a new message
    Send {
        /// Recipient ids to send to
        #[arg(long, required = true)]
        to: Vec<String>,

        /// Recipient ids to copy
        #[arg(long)]
        cc: Vec<String>,

        /// Recipient id the message is sent on behalf of
        #[arg(long)]
        from: Option<String>,

        #[arg(long)]
        reply_to: Option<String>,

        #[arg(long, default_value = "")]
        subject: String,

        #[arg(long, default_value = "")]
        body: String,

        #[arg(long)]
        html: bool,

        /// Flag the message as automated bulk mail
        #[arg(long)]
        bulk: bool,

        /// Thread the message into this conversation
        #[arg(long)]
        thread_id: Option<String>,

        /// The message starts its thread
        #[arg(long, requires = "thread_id")]
        first: bool,

        /// Extra header, as `Name: value`
        #[arg(long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,
    },
    /// List stored mail
    List {
        #[arg(long)]
        status: Option<StatusFilter>,
    },
    /// Show a stored message
    Show {
        /// Mail id to show
        mail_id: String,
    },
    /// Attempt delivery of a stored message now
    Retry {
        /// Mail id to retry
        mail_id: String,

        /// Send even if the message is not queued or not yet due
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatusFilter {
    Queued,
    Sent,
    Failed,
}

impl From<StatusFilter> for MailStatus {
    fn from(value: StatusFilter) -> Self {
        match value {
            StatusFilter::Queued => Self::Queued,
            StatusFilter::Sent => Self::Sent,
            StatusFilter::Failed => Self::Failed,
        }
    }
}

fn parse_header(header: &str) -> Result<(String, String), String> {
    let (name, value) = header
        .split_once(':')
        .ok_or_else(|| format!("expected `Name: value`, got `{header}`"))?;

    let name = name.trim();
    if name.is_empty() {
        return Err(format!("header `{header}` has no name"));
    }

    Ok((name.to_string(), value.trim().to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => find_config_file()?,
    };
    let config_content = std::fs::read_to_string(&config_path).map_err(|e| {
        anyhow::anyhow!(
            "Failed to read config from {}: {}",
            config_path.display(),
            e
        )
    })?;
    let postern = Postern::from_ron(&config_content)?;

    logging::init();

    match cli.command {
        Commands::Run => postern.run().await,
        Commands::Send {
            to,
            cc,
            from,
            reply_to,
            subject,
            body,
            html,
            bulk,
            thread_id,
            first,
            headers,
        } => {
            let request = SendRequest {
                from,
                to,
                cc,
                reply_to,
                subject,
                body,
                html,
                bulk,
                thread_id,
                first_message: first,
                headers,
                ..SendRequest::default()
            };

            let mailer = postern.mailer()?;
            let (id, outcome) = commands::send(&mailer, request).await?;
            match outcome {
                None => println!("Queued {id}"),
                Some(outcome) => println!("{id}: {}", describe(&outcome)),
            }
            Ok(())
        }
        Commands::List { status } => {
            let mailer = postern.mailer()?;
            let status: Option<MailStatus> = status.map(Into::into);
            let summaries = commands::list(mailer.store().as_ref(), status).await?;

            if summaries.is_empty() {
                println!("No mail found");
            }
            for summary in summaries {
                println!(
                    "{}  {:<20}  retries: {:<3}  {}",
                    summary.id,
                    summary.status.readable(),
                    summary.retry_count,
                    summary.subject.as_deref().unwrap_or("")
                );
            }
            Ok(())
        }
        Commands::Show { mail_id } => {
            let mailer = postern.mailer()?;
            let summary = commands::show(mailer.store().as_ref(), &mail_id).await?;
            println!("{summary}");
            Ok(())
        }
        Commands::Retry { mail_id, force } => {
            let mailer = postern.mailer()?;
            let outcome = commands::retry(&mailer, &mail_id, force).await?;
            println!("{mail_id}: {}", describe(&outcome));
            Ok(())
        }
    }
}

fn describe(outcome: &DeliveryOutcome) -> String {
    match outcome {
        DeliveryOutcome::Sent => "sent".to_string(),
        DeliveryOutcome::Deferred {
            error,
            retry_count,
            next_retry,
        } => format!("deferred after attempt {retry_count}, next try at {next_retry}: {error}"),
        DeliveryOutcome::Failed(error) => format!("failed: {error}"),
    }
}

/// Find the configuration file using the following precedence:
/// 1. `POSTERN_CONFIG` environment variable
/// 2. ./postern.config.ron (current working directory)
/// 3. /etc/postern/postern.config.ron (system-wide config)
fn find_config_file() -> anyhow::Result<PathBuf> {
    if let Ok(env_path) = std::env::var("POSTERN_CONFIG") {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!(
            "POSTERN_CONFIG points to non-existent file: {}",
            path.display()
        );
    }

    let default_paths = vec![
        PathBuf::from("./postern.config.ron"),
        PathBuf::from("/etc/postern/postern.config.ron"),
    ];

    for path in &default_paths {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - POSTERN_CONFIG environment variable\n{paths_tried}"
    )
}
