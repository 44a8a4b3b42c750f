//! Switchboard CLI application
//!
//! One-shot subcommands map directly onto router operations; `serve` is
//! the long-lived mode that boots auto-start servers, runs the idle
//! reaper, and answers JSON operation envelopes line by line on stdin.

mod args;

use anyhow::Context;
use args::{Cli, Commands};
use clap::Parser;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use switchboard_core::index::state_dir;
use switchboard_core::{
    CallProxy, DefaultTransportFactory, HookEngine, HooksConfig, IdleReaper, Lifecycle, Operation,
    Router, ServerConfig, ServerRegistry, ToolCache, ToolIndex, UsageLog,
};
use tokio::io::AsyncBufReadExt;
use tracing::info;

struct App {
    router: Router,
    lifecycle: Arc<Lifecycle>,
}

fn build_app(state_override: Option<PathBuf>) -> anyhow::Result<App> {
    let state = state_dir(state_override.as_deref())?;
    std::fs::create_dir_all(&state)
        .with_context(|| format!("cannot create state dir {}", state.display()))?;

    let registry = ServerRegistry::load(state.join("servers.yaml"))?;
    let hooks_path = state.join("hooks.yaml");
    let hooks_config = HooksConfig::load(&hooks_path)?;

    let registry = Arc::new(tokio::sync::RwLock::new(registry));
    let lifecycle = Arc::new(Lifecycle::new(
        registry,
        Arc::new(ToolIndex::new()),
        Arc::new(DefaultTransportFactory),
        ToolCache::new(&state),
    ));

    let project = std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let usage = Arc::new(UsageLog::load(&state, project));
    let hooks = Arc::new(HookEngine::new(hooks_config, Arc::clone(&lifecycle)));
    let proxy = Arc::new(CallProxy::new(
        Arc::clone(&lifecycle),
        Arc::clone(&hooks),
        Arc::clone(&usage),
    ));

    let router = Router::new(
        Arc::clone(&lifecycle),
        proxy,
        hooks,
        usage,
        hooks_path,
    );
    Ok(App { router, lifecycle })
}

fn parse_env_entries(entries: &[String]) -> anyhow::Result<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();
    for entry in entries {
        let (key, value) = entry
            .split_once('=')
            .with_context(|| format!("invalid env entry '{}', expected KEY=VALUE", entry))?;
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}

fn operation_for(command: Commands) -> anyhow::Result<Operation> {
    let op = match command {
        Commands::List => Operation::ListServers,
        Commands::Search { query, auto_start } => Operation::Search { query, auto_start },
        Commands::Describe { server } => Operation::Describe { server },
        Commands::Tools { server } => Operation::ListTools { server },
        Commands::Status => Operation::Status,
        Commands::Call { tool, server, args } => {
            let arguments =
                serde_json::from_str(&args).context("--args must be a JSON object")?;
            Operation::Call {
                server,
                tool,
                arguments,
            }
        }
        Commands::Start { server } => Operation::Start { server },
        Commands::Stop { server } => Operation::Stop { server },
        Commands::Restart { server } => Operation::Restart { server },
        Commands::Enable { server } => Operation::Enable { server },
        Commands::Disable { server } => Operation::Disable { server },
        Commands::Register {
            server,
            command,
            args,
            env,
            url,
            description,
            tags,
            auto_start,
        } => {
            let mut config = match (command, url) {
                (Some(command), None) => ServerConfig::stdio(command, args),
                (None, Some(url)) => ServerConfig::http(url),
                _ => anyhow::bail!("register needs exactly one of --command or --url"),
            };
            config.env = parse_env_entries(&env)?;
            config.auto_start = auto_start;
            if let Some(description) = description {
                config = config.with_description(description);
            }
            config = config.with_tags(tags);
            Operation::Register { server, config }
        }
        Commands::Unregister { server } => Operation::Unregister { server },
        Commands::Reload => Operation::Reload,
        Commands::Discover { path } => Operation::Discover { path },
        Commands::Usage => Operation::Usage,
        Commands::Memory => Operation::Memory,
        Commands::Serve => anyhow::bail!("serve is handled separately"),
    };
    Ok(op)
}

async fn serve(app: App) -> anyhow::Result<()> {
    info!("starting serve mode");
    app.lifecycle.autostart_at_boot().await;
    let reaper = IdleReaper::new(Arc::clone(&app.lifecycle)).spawn();

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let text = match serde_json::from_str::<serde_json::Value>(line) {
            Ok(value) => app.router.dispatch_value(value).await.text,
            Err(e) => format!("unreadable operation envelope: {}", e),
        };
        println!("{}", serde_json::json!({ "text": text }));
    }

    info!("stdin closed, shutting down");
    reaper.abort();
    app.lifecycle.stop_all().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging with environment-based filtering
    // Set RUST_LOG=debug for verbose logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let app = build_app(cli.state_dir)?;

    match cli.command {
        Commands::Serve => serve(app).await,
        command => {
            let op = operation_for(command)?;
            let outcome = app.router.dispatch(op).await;
            println!("{}", outcome.text);
            app.lifecycle.stop_all().await;
            Ok(())
        }
    }
}
