use anyhow::{bail, Context, Result};
use consortium_pipeline::cli::commands::{NodeCommand, SimulateCommand, ValidateCommand};
use consortium_pipeline::cli::output::*;
use consortium_pipeline::cli::{Cli, Command};
use consortium_pipeline::core::config::{NodeConfig, NodeRole, StoreConfig};
use consortium_pipeline::execution::{PipelineRunnerPool, PoolFlavor};
use consortium_pipeline::simulation::Simulation;
use consortium_pipeline::{
    ComputationResult, DecentralizedComputation, LocalComputationRegistry, LocalPipelineRunnerPool, PoolContext,
    PoolEvent, RemotePipelineRunnerPool, StoreRegistry,
};
use indicatif::ProgressBar;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::error;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    // Execute command
    match &cli.command {
        Command::Validate(cmd) => validate_definition(cmd)?,
        Command::Local(cmd) => run_node(cmd, NodeRole::Local).await?,
        Command::Remote(cmd) => run_node(cmd, NodeRole::Remote).await?,
        Command::Simulate(cmd) => simulate(cmd).await?,
    }

    Ok(())
}

fn validate_definition(cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating computation...", INFO);

    match DecentralizedComputation::from_file(&cmd.file) {
        Ok(definition) => {
            println!("{} Computation definition is valid!", CHECK);
            println!("  Name: {}", style(&definition.name).bold());
            println!("  Version: {}", style(&definition.version).cyan());
            println!("  Local steps: {}", style(definition.local.computations().len()).cyan());
            println!("  Remote steps: {}", style(definition.remote.computations().len()).cyan());
            if !definition.plugins.is_empty() {
                println!("  Plugins: {}", style(definition.plugins.join(", ")).dim());
            }

            if cmd.json {
                let json = serde_json::to_string_pretty(&definition.computation_document())?;
                println!("\n{}", json);
            }
            Ok(())
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(format!("{:#}", e)).red());
            std::process::exit(1);
        }
    }
}

async fn run_node(cmd: &NodeCommand, role: NodeRole) -> Result<()> {
    let mut config = NodeConfig::from_file(&cmd.config).context("Failed to load node config")?;
    if config.role != role {
        bail!(
            "{} configures a {:?} node, not a {:?} node",
            cmd.config.display(),
            config.role,
            role
        );
    }

    // Apply overrides
    if let Some(username) = &cmd.username {
        config.username = Some(username.clone());
    }
    if !cmd.listen_to.is_empty() {
        config.listen_to = Some(cmd.listen_to.clone());
    }
    if let Some(path) = &cmd.store {
        config.store = StoreConfig::Sqlite {
            path: Some(path.clone()),
        };
    }
    config.validate()?;

    let stores = StoreRegistry::from_config(&config.store, config.poll_interval())
        .await
        .context("Failed to open document stores")?;
    let registry = LocalComputationRegistry::new(&config.computations_dir);
    let ctx = PoolContext::new(Arc::new(stores), Arc::new(registry));

    match role {
        NodeRole::Local => {
            let username = config
                .username
                .clone()
                .context("Local nodes require a username")?;
            let pool = LocalPipelineRunnerPool::local(username.as_str(), ctx);
            serve(pool, &username, config.listen_to).await
        }
        NodeRole::Remote => serve(RemotePipelineRunnerPool::remote(ctx), "remote", config.listen_to).await,
    }
}

async fn serve<F: PoolFlavor>(
    pool: PipelineRunnerPool<F>,
    label: &str,
    listen_to: Option<Vec<String>>,
) -> Result<()> {
    let pool = match listen_to {
        Some(ids) => pool.with_listen_to(ids),
        None => pool,
    };
    let printer = print_events(label.to_string(), pool.events().subscribe(), None);

    pool.init().await.context("Failed to initialize pool")?;
    println!(
        "{} {} node running; press Ctrl-C to stop",
        ROCKET,
        style(label).bold()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    println!("{} Shutting down", INFO);
    pool.destroy().await?;
    printer.abort();
    Ok(())
}

fn print_events(
    label: String,
    mut events: UnboundedReceiver<PoolEvent>,
    progress: Option<ProgressBar>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let line = format_pool_event(&label, &event);
            match &progress {
                Some(progress) => progress.println(line),
                None => println!("{}", line),
            }
        }
    })
}

async fn simulate(cmd: &SimulateCommand) -> Result<()> {
    let participants: Vec<(String, f64)> = cmd
        .users
        .iter()
        .enumerate()
        .map(|(index, user)| (user.clone(), cmd.value_for(user, index)))
        .collect();

    println!(
        "{} Simulating {} participants: {}",
        ROCKET,
        style(participants.len()).cyan(),
        participants
            .iter()
            .map(|(user, value)| format!("{}={}", user, value))
            .collect::<Vec<_>>()
            .join(", ")
    );

    let simulation = Simulation::new(participants, cmd.group_step).await?;
    let spinner = create_spinner("Waiting for the aggregate");

    let mut printers = vec![print_events(
        "remote".to_string(),
        simulation.remote().events().subscribe(),
        Some(spinner.clone()),
    )];
    for local in simulation.locals() {
        printers.push(print_events(
            local.flavor().username().to_string(),
            local.events().subscribe(),
            Some(spinner.clone()),
        ));
    }

    let outcome = simulation.run(Duration::from_secs(cmd.timeout_secs)).await;
    spinner.finish_and_clear();
    simulation.shutdown().await;
    for printer in printers {
        printer.abort();
    }

    match outcome {
        Ok(result) => {
            println!(
                "\n{} Run {} complete",
                CHECK,
                style(result.run_id()).bold()
            );
            println!("  Total: {}", style(&result.data()["total"]).green());
            println!("  Contributors: {}", style(&result.data()["contributors"]).cyan());
            println!("  Rounds: {}", result.core().history.len() + 1);
            if let Some(end) = result.end_date {
                println!("  Finished: {}", style(end.to_rfc3339()).dim());
            }

            if cmd.json {
                let json = serde_json::to_string_pretty(&result.to_value()?)?;
                println!("\n{}", format_output(&json, 40));
            }
            Ok(())
        }
        Err(e) => {
            println!("\n{} Simulation {}", CROSS, style("failed").red());
            error!("{}", e);
            std::process::exit(1);
        }
    }
}
