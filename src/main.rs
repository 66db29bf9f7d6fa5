//! # Cadence — delivery orchestration for email sequences
//!
//! Usage:
//!   cadence run                              # Start workers, mailbox sync and sweeper
//!   cadence launch <sequence>                # Schedule every eligible contact
//!   cadence pause|resume|reset <sequence>
//!   cadence send-now <sequence> <contact>    # Jump the queue for one contact
//!   cadence health <sequence>
//!   cadence next-eligible <sequence> --delay 2 --unit days

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use cadence_channels::{ImapHistoryFeed, SmtpMailer};
use cadence_core::CadenceConfig;
use cadence_core::traits::mailer::StaticCredentials;
use cadence_core::types::{Delay, DelayUnit};
use cadence_scheduler::{Calendar, Collaborators, Engine};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cadence", version, about = "📨 Cadence — email sequence delivery engine")]
struct Cli {
    /// Config file (default: ~/.cadence/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine until Ctrl+C
    Run,
    /// Launch a draft (or errored) sequence
    Launch { sequence: String },
    Pause { sequence: String },
    Resume { sequence: String },
    /// Back to draft: cancel jobs and rewind live contacts
    Reset { sequence: String },
    /// Send a contact's next step now
    SendNow { sequence: String, contact: String },
    /// Queue a step rendered against a sample contact to an arbitrary address
    SendTest {
        sequence: String,
        step: u32,
        to: String,
    },
    /// Error rate over the health window
    Health { sequence: String },
    /// Print when a step with this delay would fire
    NextEligible {
        sequence: String,
        /// Start instant, RFC 3339 (default: now)
        #[arg(long)]
        from: Option<String>,
        #[arg(long, default_value = "0")]
        delay: u32,
        #[arg(long, default_value = "minutes")]
        unit: DelayUnit,
    },
}

fn load_config(path: Option<&str>) -> Result<CadenceConfig> {
    let config = match path {
        Some(p) => CadenceConfig::load_from(&PathBuf::from(shellexpand::tilde(p).to_string()))?,
        None => CadenceConfig::load()?,
    };
    Ok(config)
}

fn build_engine(config: CadenceConfig) -> Result<Arc<Engine>> {
    let collaborators = Collaborators {
        sender: Arc::new(SmtpMailer::new(&config.mailboxes)),
        refresher: Arc::new(StaticCredentials),
        feed: Some(Arc::new(ImapHistoryFeed::new(
            &config.mailboxes,
            config.sync.resync_window,
        ))),
        renewer: None,
        alert: None,
    };
    Ok(Arc::new(Engine::open(config, collaborators)?))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "cadence=debug,cadence_scheduler=debug,cadence_channels=debug"
    } else {
        "cadence=info,cadence_scheduler=info,cadence_channels=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = load_config(cli.config.as_deref())?;
    let db_path = config.database_path();
    let engine = build_engine(config)?;
    let machine = engine.machine();
    let now = Utc::now();

    match cli.command {
        Command::Run => {
            println!("📨 Cadence v{}", env!("CARGO_PKG_VERSION"));
            println!("   🗄️  Database: {}", db_path.display());
            println!();
            engine.start()?;
            tokio::signal::ctrl_c().await?;
            if !engine.shutdown().await {
                tracing::warn!("⚠️ Some tasks did not stop within the grace period");
            }
        }
        Command::Launch { sequence } => {
            let report = machine.launch(&sequence, now)?;
            println!(
                "🚀 {sequence}: {} contact(s) scheduled, {} skipped, {} deferred",
                report.scheduled, report.skipped, report.deferred
            );
        }
        Command::Pause { sequence } => {
            machine.pause(&sequence)?;
            println!("⏸️  {sequence} paused");
        }
        Command::Resume { sequence } => {
            machine.resume(&sequence)?;
            println!("▶️  {sequence} resumed");
        }
        Command::Reset { sequence } => {
            let rewound = machine.reset(&sequence, now)?;
            println!("↩️  {sequence} reset to draft ({rewound} contact(s) rewound)");
        }
        Command::SendNow { sequence, contact } => {
            let job_id = machine.send_now(&sequence, &contact, now)?;
            println!("⚡ Queued job {job_id}");
        }
        Command::SendTest { sequence, step, to } => {
            let job_id = machine.send_test_email(&sequence, step, &to, now)?;
            println!("🧪 Queued test email job {job_id}");
        }
        Command::Health { sequence } => {
            let report = engine.health().check_health(&sequence, now)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::NextEligible {
            sequence,
            from,
            delay,
            unit,
        } => {
            let seq = engine.db().require_sequence(&sequence)?;
            let from = match from {
                Some(raw) => DateTime::parse_from_rfc3339(&raw)?.with_timezone(&Utc),
                None => now,
            };
            let at = machine.next_eligible(&seq, from, Delay::new(delay, unit))?;
            let zone = seq
                .business_hours
                .as_ref()
                .and_then(|bh| Calendar::from_hours(bh).ok())
                .map(|cal| cal.timezone());
            match zone {
                Some(tz) => println!("🗓️  {at} ({})", at.with_timezone(&tz)),
                None => println!("🗓️  {at}"),
            }
        }
    }

    Ok(())
}
