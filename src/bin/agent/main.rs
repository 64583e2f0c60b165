mod face;
mod hands;

use anyhow::Result;
use clap::Parser;
use face::ConsoleCommand;
use goal_pilot::credentials::{
    CredentialStore, EnvCredentialStore, FileCredentialStore, LayeredCredentialStore,
};
use goal_pilot::{ActiveSurface, AgentConfig, Brain, HttpTransport, Journal, RunController, RunState};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "agent", about = "Drive a browser toward a goal, one screenshot at a time")]
struct Args {
    /// Goal to pursue.
    #[arg(long)]
    goal: Option<String>,

    /// Start an automatic run right away (requires --goal) and exit when it settles.
    #[arg(long)]
    auto: bool,

    /// Step budget for automatic runs.
    #[arg(long)]
    steps: Option<u32>,

    /// Decision-engine model to use instead of picking one.
    #[arg(long)]
    model: Option<String>,

    /// Console port (the next few are tried if taken).
    #[arg(long)]
    port: Option<u16>,

    /// DevTools endpoint of a running Chrome to attach to.
    #[arg(long, default_value = "http://127.0.0.1:9222")]
    attach: String,

    /// Chrome executable; detected automatically when omitted.
    #[arg(long)]
    chrome: Option<PathBuf>,

    /// Run Chrome without a window.
    #[arg(long)]
    headless: bool,

    /// Chrome profile directory for the agent.
    #[arg(long)]
    profile: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut config = AgentConfig::from_env();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("goal_pilot=info,agent=info")),
        )
        .init();

    let args = Args::parse();
    if let Some(steps) = args.steps {
        config.step_budget = steps.max(1);
    }
    if let Some(model) = &args.model {
        config.model = Some(model.clone());
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    // 1. Credentials: saved file first, environment as fallback.
    let mut layers: Vec<Box<dyn CredentialStore>> = Vec::new();
    match FileCredentialStore::in_config_dir() {
        Ok(store) => layers.push(Box::new(store)),
        Err(e) => tracing::warn!("credential file unavailable: {e:#}"),
    }
    layers.push(Box::new(EnvCredentialStore));
    let credentials: Arc<dyn CredentialStore> = Arc::new(LayeredCredentialStore::new(layers));

    // 2. Browser, launched off the async runtime since it can take a while.
    let settings = hands::LaunchSettings {
        attach_url: Some(args.attach.clone()),
        chrome_path: args.chrome.clone(),
        headless: args.headless,
        profile_dir: args.profile.clone(),
    };
    let session = tokio::task::spawn_blocking(move || hands::BrowserSession::launch(&settings))
        .await
        .map_err(|e| anyhow::anyhow!("browser launch panicked: {e}"))??;
    let surfaces = ActiveSurface::with(session.surface());

    // 3. Decision engine and controller.
    let brain = Arc::new(Brain::new(
        Arc::new(HttpTransport::new()?),
        credentials,
        &config,
    ));
    if brain.model().is_none() {
        match brain.select_default_model().await {
            Ok(Some(model)) => tracing::info!("using model {model}"),
            Ok(None) => tracing::warn!("engine listed no models; falling back to preference list"),
            Err(e) => tracing::warn!("could not list models: {e}"),
        }
    }

    let journal = Arc::new(Journal::new());
    let controller = RunController::new(&config, surfaces, brain, journal);
    if let Some(goal) = &args.goal {
        controller.set_goal(goal.clone());
    }

    if args.auto {
        if controller.goal().is_empty() {
            anyhow::bail!("--auto needs a --goal");
        }
        controller.run_automatically();
        let status = controller.wait_until_settled().await;
        if status.state == RunState::Paused {
            tracing::warn!("run paused at step {}; nothing confirms it in one-shot mode", status.current_step);
        }
        drop(session);
        return Ok(());
    }

    // 4. Console, then serve commands until the console goes away.
    let mut cmd_rx = face::start_server(controller.clone(), config.port).await?;
    tracing::info!("ready; waiting for commands");

    while let Some(command) = cmd_rx.recv().await {
        tracing::debug!("command: {command:?}");
        dispatch(&controller, command);
    }

    drop(session);
    Ok(())
}

fn dispatch(controller: &RunController, command: ConsoleCommand) {
    match command {
        ConsoleCommand::SetGoal(goal) => {
            controller.set_goal(goal);
            controller.journal().info(format!("Goal set: {}", controller.goal()));
        }
        ConsoleCommand::Step => controller.step(),
        ConsoleCommand::Run => controller.run_automatically(),
        ConsoleCommand::Stop => controller.stop(),
        ConsoleCommand::Resume => {
            if !controller.resume_after_safety_check() {
                controller.journal().info("Nothing is waiting for confirmation.");
            }
        }
        ConsoleCommand::SetModel(model) if model.trim().is_empty() => {
            controller.journal().warning("No model name given.");
        }
        ConsoleCommand::SetModel(model) => {
            controller.brain().set_model(model);
            if let Some(model) = controller.brain().model() {
                controller.journal().info(format!("Model set to {model}; applies from the next request."));
            }
        }
        ConsoleCommand::SaveKey(value) => {
            let brain = controller.brain();
            if brain.credentials().save(brain.credential_key(), value.trim()) {
                controller.journal().info("API key saved.");
            } else {
                controller.journal().error("Could not save the API key.");
            }
        }
    }
}
