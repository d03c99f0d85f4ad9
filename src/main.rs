//! # parley
//!
//! Local demo binary: opens one session with echo agents, sends each
//! `--say` line as user input and prints everything addressed to the
//! frontend as JSON lines.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use parley_agent::EchoBehavior;
use parley_bus::{Delivery, FnSubscriber};
use parley_core::{factory, AgentId, Message, MessageEvent, PersonaMatrix};
use parley_session::{SessionManager, SharedBehaviorProvisioner};
use parley_settings::{load_settings, load_settings_from_path};
use parley_telemetry::{init_telemetry, TelemetryConfig};
use tokio::sync::mpsc;

/// Multi-agent session runtime demo.
#[derive(Parser, Debug)]
#[command(name = "parley", about = "Multi-agent session runtime demo")]
struct Cli {
    /// Settings file (defaults to `~/.parley/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Agent to register. Repeatable; the first one starts active.
    #[arg(long = "agent", default_values_t = ["alpha".to_string(), "beta".to_string()])]
    agents: Vec<String>,

    /// User input to send. Repeatable; `@agent text` addresses one agent.
    #[arg(long = "say")]
    inputs: Vec<String>,

    /// How long to wait for each turn to finish.
    #[arg(long, default_value = "10")]
    turn_timeout_secs: u64,
}

fn demo_persona(agent_id: &str) -> PersonaMatrix {
    let mut name = agent_id.to_string();
    if let Some(first) = name.get_mut(0..1) {
        first.make_ascii_uppercase();
    }
    PersonaMatrix::new(format!("{agent_id}-persona"), name, format!("demo-{agent_id}"))
}

/// True once a turn has produced its last frontend message.
fn ends_turn(msg: &Message) -> bool {
    match msg.event() {
        MessageEvent::AgentOutput => msg.is_final(),
        MessageEvent::Error => true,
        MessageEvent::Event => msg.subtype() == Some("TURN_CANCELED"),
        _ => false,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => load_settings().context("Failed to load settings")?,
    };
    let telemetry = init_telemetry(TelemetryConfig::from_settings(&settings.logging));
    if cli.agents.is_empty() {
        bail!("at least one --agent is required");
    }

    let metrics = telemetry.metrics_handle();
    let mut provisioner =
        SharedBehaviorProvisioner::new(Arc::new(EchoBehavior::new()), settings.agent.clone());
    if let Some(metrics) = &metrics {
        provisioner = provisioner.with_metrics(metrics.clone());
    }
    let mut manager = SessionManager::new(&settings, Arc::new(provisioner));
    if let Some(metrics) = metrics {
        manager = manager.with_metrics(metrics);
    }

    let session = manager.open_session();
    tracing::info!(session_id = %session.session_id(), "demo session ready");

    let (tx, mut frontend) = mpsc::unbounded_channel::<Message>();
    session.bus().subscribe(
        "frontend",
        FnSubscriber::new(move |msg: &Message| {
            match serde_json::to_string(msg) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!(error = %e, "unprintable message"),
            }
            let _ = tx.send(msg.clone());
        }),
        Delivery::Directed,
    );

    for (i, agent_id) in cli.agents.iter().enumerate() {
        session
            .add_agent(
                AgentId::from_raw(agent_id.as_str()),
                Some(demo_persona(agent_id)),
                i == 0,
            )
            .await
            .with_context(|| format!("Failed to add agent {agent_id}"))?;
    }

    let turn_timeout = Duration::from_secs(cli.turn_timeout_secs);
    for text in &cli.inputs {
        session
            .bus()
            .publish(factory::user_input(
                session.session_id().clone(),
                "cli-user",
                text.as_str(),
            ))
            .await
            .context("Failed to publish input")?;
        let finished = tokio::time::timeout(turn_timeout, async {
            while let Some(msg) = frontend.recv().await {
                if ends_turn(&msg) {
                    return true;
                }
            }
            false
        })
        .await;
        if !matches!(finished, Ok(true)) {
            tracing::warn!(input = %text, "turn did not finish in time");
        }
    }

    for status in session.agent_statuses() {
        tracing::info!(
            agent_id = %status.agent_id,
            calls = status.calls.total_calls,
            health = status.health_score,
            "agent summary"
        );
    }
    if let Some(memory) = session.memory() {
        let stats = memory.stats();
        tracing::info!(
            total = stats.total,
            long_term = stats.long_term,
            "session memory summary"
        );
    }
    manager.close_all().await;
    tracing::info!("Shutting down");
    Ok(())
}
