use std::sync::Arc;

use anyhow::Context;

use fleet_scheduler::clock::{Clock, SystemClock};
use fleet_scheduler::config::{FleetConfig, load_task_list};
use fleet_scheduler::exec::OperationQueue;
use fleet_scheduler::scheduler::{Scheduler, spawn_scheduler_loop};
use fleet_scheduler::worker::{SessionWorker, SimulatedWorker, SimulationProfile};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = FleetConfig::from_env().context("invalid FLEET_* configuration")?;
    let tasks = load_task_list(&config.tasks_file)
        .with_context(|| format!("failed to load tasks from {}", config.tasks_file.display()))?;

    eprintln!("Fleet scheduler v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Tasks: {} ({})", tasks.len(), config.tasks_file.display());
    eprintln!(
        "   Ceilings: mining {}, pages {}, opening {}",
        config.scheduler.max_active_mining,
        config.scheduler.max_open_pages,
        config.scheduler.page_open_concurrency
    );
    eprintln!("   Worker: simulated (dry run). Ctrl-C to stop.\n");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let queue = OperationQueue::new(config.queue.clone());
    let worker: Arc<dyn SessionWorker> = Arc::new(SimulatedWorker::new(
        queue,
        Arc::clone(&clock),
        SimulationProfile::default(),
    ));

    let mut scheduler = Scheduler::new(config.scheduler.clone(), worker, clock)
        .with_retry_policy(config.queue.retry.clone());
    for entry in tasks {
        scheduler
            .register_task(entry.id, entry.target)
            .context("duplicate task in task list")?;
    }

    let handle = spawn_scheduler_loop(scheduler);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("Stop requested");

    let scheduler = handle.stop().await.context("scheduler loop panicked")?;
    let report = serde_json::to_string_pretty(&scheduler.status_report())?;
    println!("{report}");
    Ok(())
}
