use crate::Coordinator;
use anyhow::{Context, Result};
use serde_json::json;
use std::sync::Arc;
use strata_core::{CoreConfig, UserExecutionContext};
use strata_router::ConnectOptions;

const PROBE_USER: &str = "health-probe";

pub async fn run(config: CoreConfig) -> Result<()> {
    println!("🏥 Health Check\n");

    let coordinator = Coordinator::new(config).context("Failed to build coordinator")?;
    let mut healthy = true;

    println!(
        "⚙️  Timeouts: default {:.1}s, max {:.1}s, breaker after {} failures",
        coordinator.config().timeout.default_timeout_seconds,
        coordinator.config().timeout.max_timeout_seconds,
        coordinator.config().timeout.circuit_breaker_failure_threshold
    );
    println!(
        "👥 Context quota: {} per user\n",
        coordinator.config().context.max_contexts_per_user
    );

    print!("🗂️  Context manager... ");
    report(probe_contexts(&coordinator), &mut healthy);

    print!("⏱️  Timeout manager... ");
    report(probe_executions(&coordinator).await, &mut healthy);

    print!("📡 Event router... ");
    report(probe_router(&coordinator).await, &mut healthy);

    println!();
    if healthy {
        println!("✅ All checks passed");
        Ok(())
    } else {
        anyhow::bail!("Health check failed");
    }
}

fn report(result: Result<()>, healthy: &mut bool) {
    match result {
        Ok(()) => println!("✓"),
        Err(e) => {
            println!("✗ ({:#})", e);
            *healthy = false;
        }
    }
}

fn probe_contexts(coordinator: &Coordinator) -> Result<()> {
    let contexts = coordinator.contexts();
    let context = UserExecutionContext::new(PROBE_USER, "probe-thread", "probe-context")?
        .with_agent_value("probe", json!({"counter": 0}));
    let key = context.key();

    contexts.set_context(&key, context, None)?;
    let fetched = contexts.get_context(&key)?;
    if fetched.user_id != PROBE_USER {
        anyhow::bail!("context round trip returned user {}", fetched.user_id);
    }
    contexts.clear_context(&key);
    contexts.clear_context(&key);
    if contexts.user_context_count(PROBE_USER) != 0 {
        anyhow::bail!("context survived clear");
    }
    Ok(())
}

async fn probe_executions(coordinator: &Coordinator) -> Result<()> {
    let value = coordinator
        .executions()
        .execute_with_timeout("health-probe", None, |_scope| async { Ok::<_, String>(7) })
        .await?;
    if value != 7 {
        anyhow::bail!("unexpected probe result {}", value);
    }
    Ok(())
}

async fn probe_router(coordinator: &Coordinator) -> Result<()> {
    let router = coordinator.router();
    let context = UserExecutionContext::new(PROBE_USER, "probe-thread", "probe-run")?
        .with_websocket_client_id("probe-client");
    let (sink, mut rx) = router.channel_sink();
    let handle = router
        .connect(&context, Arc::new(sink), ConnectOptions::default())
        .await?;

    router.route_message(&handle, r#"{"type": "ping"}"#).await?;
    let mut saw_pong = false;
    while let Ok(message) = rx.try_recv() {
        saw_pong |= message.message_type() == "pong";
    }

    router.disconnect(&handle);
    router.release_run(&context.run_id, &context.user_id);
    if !saw_pong {
        anyhow::bail!("no pong received");
    }
    Ok(())
}
