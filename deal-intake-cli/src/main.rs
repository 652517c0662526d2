//! Deal Intake CLI
//!
//! Resolves packets from the YAML catalog and evaluates deal snapshots
//! against an in-memory store.
//!
//! Usage:
//!   deal-intake resolve --packet ca_bridge
//!   deal-intake evaluate --deal config/deals/sequential.yaml --viewer borrower
//!   deal-intake complete --deal config/deals/sequential.yaml --participant broker --json
//!
//! Participants may be given by id or by role name.

mod config;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use deal_intake_core::{
    CompletionOutcome, DealEvaluation, DealSnapshot, FieldCatalog, IntakeService, MemoryStore,
    OrchestrationState, ResolvedFieldSet, ViewerIdentity,
};

use crate::config::IntakeConfig;

#[derive(Parser, Debug)]
#[command(name = "deal-intake")]
#[command(version)]
#[command(about = "Resolve packet fields and evaluate deal intake snapshots")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Catalog directory holding dictionary, template and packet YAML
    #[arg(long, global = true, env = "DEAL_INTAKE_CATALOG_DIR")]
    catalog_dir: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, env = "DEAL_INTAKE_LOG")]
    log: Option<String>,

    /// Output results as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the resolved field set of a packet
    Resolve {
        #[arg(long, short = 'p')]
        packet: String,
    },

    /// Evaluate a deal snapshot for one viewer (staff when omitted)
    Evaluate {
        #[arg(long, short = 'd')]
        deal: PathBuf,

        /// Participant id or role
        #[arg(long, short = 'v')]
        viewer: Option<String>,
    },

    /// Complete a participant's section and show the resulting roster states
    Complete {
        #[arg(long, short = 'd')]
        deal: PathBuf,

        /// Participant id or role
        #[arg(long, short = 'p')]
        participant: String,
    },
}

// =============================================================================
// MAIN
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = IntakeConfig::from_env().with_overrides(cli.catalog_dir.clone(), cli.log.clone());

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    debug!(catalog_dir = %config.catalog_dir.display(), "Loaded configuration");
    info!(command = ?cli.command, "Running command");

    let result = match &cli.command {
        Commands::Resolve { packet } => cmd_resolve(&config, packet, cli.json).await,
        Commands::Evaluate { deal, viewer } => {
            cmd_evaluate(&config, deal, viewer.as_deref(), cli.json).await
        }
        Commands::Complete { deal, participant } => {
            cmd_complete(&config, deal, participant, cli.json).await
        }
    };

    match result {
        Ok(()) => {
            info!("Command finished");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Command failed");
            if cli.json {
                println!("{}", serde_json::json!({ "error": format!("{e:#}") }));
            } else {
                eprintln!("{} {:#}", "ERROR:".red().bold(), e);
            }
            ExitCode::FAILURE
        }
    }
}

// =============================================================================
// COMMANDS
// =============================================================================

async fn load_store(
    config: &IntakeConfig,
    snapshot: Option<&DealSnapshot>,
) -> Result<Arc<MemoryStore>> {
    let catalog = FieldCatalog::load_from_dir(&config.catalog_dir)?;
    let store = Arc::new(MemoryStore::new());
    catalog.seed(&store).await;
    if let Some(snapshot) = snapshot {
        snapshot.seed(&store).await?;
    }
    Ok(store)
}

fn load_snapshot(path: &Path) -> Result<DealSnapshot> {
    DealSnapshot::load(path).with_context(|| format!("Cannot load deal {}", path.display()))
}

fn participant_id(snapshot: &DealSnapshot, id_or_role: &str) -> Result<Uuid> {
    snapshot
        .find_participant(id_or_role)
        .ok_or_else(|| anyhow!("No participant '{}' on deal {}", id_or_role, snapshot.deal.id))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn cmd_resolve(config: &IntakeConfig, packet: &str, json: bool) -> Result<()> {
    let store = load_store(config, None).await?;
    let resolved = IntakeService::new(store).resolve_packet_fields(packet).await?;
    if json {
        return print_json(&resolved);
    }
    print_resolved(&resolved);
    Ok(())
}

async fn cmd_evaluate(
    config: &IntakeConfig,
    deal: &Path,
    viewer: Option<&str>,
    json: bool,
) -> Result<()> {
    let snapshot = load_snapshot(deal)?;
    let store = load_store(config, Some(&snapshot)).await?;
    let viewer = match viewer {
        Some(v) => ViewerIdentity::Participant {
            participant_id: participant_id(&snapshot, v)?,
        },
        None => ViewerIdentity::Staff {
            user_id: Uuid::nil(),
        },
    };

    let evaluation = IntakeService::new(store)
        .evaluate_deal(snapshot.deal.id, &viewer)
        .await?;
    if json {
        return print_json(&evaluation);
    }
    print_evaluation(&evaluation);
    Ok(())
}

#[derive(Serialize)]
struct CompletionReport {
    outcome: CompletionOutcome,
    roster: Vec<OrchestrationState>,
}

async fn cmd_complete(
    config: &IntakeConfig,
    deal: &Path,
    participant: &str,
    json: bool,
) -> Result<()> {
    let snapshot = load_snapshot(deal)?;
    let store = load_store(config, Some(&snapshot)).await?;
    let service = IntakeService::new(store);
    let participant_id = participant_id(&snapshot, participant)?;

    let outcome = service
        .complete_section(participant_id, snapshot.deal.id)
        .await?;

    let mut roster = Vec::new();
    for p in snapshot.participants() {
        let viewer = ViewerIdentity::Participant {
            participant_id: p.id,
        };
        let state = service
            .orchestrator()
            .get_orchestration_state(snapshot.deal.id, &viewer)
            .await?;
        roster.push(state);
    }

    let report = CompletionReport { outcome, roster };
    if json {
        return print_json(&report);
    }

    println!(
        "{} {} completed their section",
        "OK".green().bold(),
        report.outcome.participant.role
    );
    match &report.outcome.next_participant {
        Some(next) => println!(
            "  Next: {} ({})",
            next.role.to_string().cyan(),
            next.id.to_string().dimmed()
        ),
        None => println!("  {}", "No participant is waiting for a turn".dimmed()),
    }
    println!("\n{}", "Roster:".cyan().bold());
    for state in &report.roster {
        print_state_line(state);
    }
    Ok(())
}

// =============================================================================
// OUTPUT
// =============================================================================

fn print_resolved(resolved: &ResolvedFieldSet) {
    println!(
        "{} {} ({} fields, {} required)",
        "Packet:".cyan().bold(),
        resolved.packet_id,
        resolved.visible_field_keys.len(),
        resolved.required_field_keys.len()
    );
    if resolved.is_empty() {
        println!("{} Packet has no fields", "WARNING:".yellow());
        return;
    }
    for section in &resolved.sections {
        println!("\n  {}", section.bold());
        for field in resolved.fields_by_section.get(section).into_iter().flatten() {
            let marker = if field.is_required { "*".red() } else { " ".normal() };
            let calc = if field.definition.is_calculated { " (calculated)" } else { "" };
            println!(
                "    {} {:<32} {}{}",
                marker,
                field.definition.label,
                field.field_key().dimmed(),
                calc.yellow()
            );
        }
    }
}

fn print_evaluation(evaluation: &DealEvaluation) {
    println!(
        "{} {} [{}] packet {}",
        "Deal:".cyan().bold(),
        evaluation.deal.id,
        evaluation.deal.status.to_string().bold(),
        evaluation.deal.packet_id
    );
    print_state_line(&evaluation.orchestration);

    println!("\n{}", "Progress:".cyan().bold());
    for progress in &evaluation.progress {
        let pct = format!("{:>5.1}%", progress.percent_complete);
        let pct = if progress.filled_required == progress.required_fields {
            pct.green()
        } else {
            pct.yellow()
        };
        println!(
            "  {:<14} {} ({}/{} required)",
            progress.section, pct, progress.filled_required, progress.required_fields
        );
    }

    if !evaluation.calculations.is_empty() {
        println!("\n{}", "Calculated:".cyan().bold());
        for (key, result) in &evaluation.calculations {
            let shown = match (&result.value, &result.error) {
                (Some(v), _) if result.computed => v.green(),
                (_, Some(e)) => e.red(),
                _ => "waiting for inputs".dimmed(),
            };
            println!("  {:<40} {}", key, shown);
        }
    }

    if evaluation.is_complete() {
        println!("\n{}", "All required fields are filled".green());
    } else {
        println!(
            "\n{} {} required fields missing",
            "Missing:".yellow().bold(),
            evaluation.missing_required.len()
        );
        for field in &evaluation.missing_required {
            println!("  - {} {}", field.label, field.field_key.dimmed());
        }
    }
}

fn print_state_line(state: &OrchestrationState) {
    let who = state
        .viewer
        .as_ref()
        .map(|p| p.role.to_string())
        .unwrap_or_else(|| "staff".to_string());
    let access = if state.can_edit {
        "can edit".green()
    } else if state.has_completed {
        "completed".dimmed()
    } else {
        "read-only".yellow()
    };
    print!("  {:<12} {:?} {}", who, state.mode, access);
    match state.banner() {
        Some(banner) => println!("  {}", banner.dimmed()),
        None => println!(),
    }
}
