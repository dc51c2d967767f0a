use crate::Coordinator;
use anyhow::{Context, Result};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use strata_core::{CoreConfig, VerifiedIdentity};
use strata_router::{ConnectOptions, OutboundMessage};
use tokio::sync::mpsc;
use tracing::info;

const CLIENT_ID: &str = "sim-client";

/// Per-user outcome of a simulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserReport {
    pub user_id: String,
    pub critical_events: usize,
    pub foreign_events: usize,
    pub succeeded: bool,
}

/// Drive `users` concurrent simulated users through one agent run each and
/// check that no user received another user's events.
pub async fn run(config: CoreConfig, users: usize, agent_delay: Duration) -> Result<()> {
    println!("🧪 Simulating {} concurrent users\n", users);

    let coordinator = Arc::new(Coordinator::new(config).context("Failed to build coordinator")?);
    let reports = simulate(Arc::clone(&coordinator), users, agent_delay).await?;

    let mut contaminated = 0;
    for report in &reports {
        let status = if report.foreign_events == 0 { "✓" } else { "✗" };
        println!(
            "{} {:<14} events={} foreign={} succeeded={}",
            status, report.user_id, report.critical_events, report.foreign_events, report.succeeded
        );
        if report.foreign_events > 0 {
            contaminated += 1;
        }
    }

    println!("\n📊 Metrics");
    let snapshot = serde_json::to_string_pretty(&coordinator.metrics().snapshot())?;
    println!("{}", snapshot);

    if contaminated > 0 {
        anyhow::bail!("{} users received foreign events", contaminated);
    }
    println!("\n✅ No cross-user delivery");
    Ok(())
}

pub async fn simulate(
    coordinator: Arc<Coordinator>,
    users: usize,
    agent_delay: Duration,
) -> Result<Vec<UserReport>> {
    let mut sessions = Vec::with_capacity(users);
    for i in 0..users {
        let identity = VerifiedIdentity::new(format!("sim-user-{i}"), vec!["chat".to_string()]);
        let key = coordinator
            .start_request(&identity, "sim-thread", &format!("sim-run-{i}"), CLIENT_ID)
            .await
            .with_context(|| format!("Failed to start request for {}", identity.user_id))?;

        let (sink, rx) = coordinator.router().channel_sink();
        coordinator
            .connect(&key, Arc::new(sink), ConnectOptions::default())
            .await?;
        sessions.push((identity.user_id, key, rx));
    }

    let mut tasks = Vec::with_capacity(users);
    for (user_id, key, rx) in sessions {
        let coordinator = Arc::clone(&coordinator);
        tasks.push(tokio::spawn(async move {
            let echo = user_id.clone();
            let result = coordinator
                .run_agent(&key, "simulated", None, move |scope| async move {
                    scope.push_partial(json!({"user": echo, "stage": "thinking"}));
                    tokio::time::sleep(agent_delay).await;
                    Ok::<_, String>(json!({"user": echo, "answer": 42}))
                })
                .await;
            (user_id, key, rx, result.is_ok())
        }));
    }

    let mut reports = Vec::with_capacity(users);
    for task in tasks {
        let (user_id, key, mut rx, succeeded) = task.await?;
        let (critical_events, foreign_events) = inspect(&user_id, &mut rx);
        coordinator.finish_request(&key);
        info!(user_id = %user_id, critical_events, foreign_events, "Simulated user finished");
        reports.push(UserReport {
            user_id,
            critical_events,
            foreign_events,
            succeeded,
        });
    }
    Ok(reports)
}

/// Count critical events, and those addressed to anyone else.
fn inspect(user_id: &str, rx: &mut mpsc::Receiver<OutboundMessage>) -> (usize, usize) {
    let mut critical = 0;
    let mut foreign = 0;
    while let Ok(message) = rx.try_recv() {
        if let Some(event) = message.as_critical() {
            critical += 1;
            if event.user_id != user_id {
                foreign += 1;
            }
        }
    }
    (critical, foreign)
}
