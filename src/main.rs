use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use nightowl::VERSION;
use nightowl::agent::agent_loop::{AgentLoop, AgentSettings};
use nightowl::agent::summarizer::Summarizer;
use nightowl::bus::MessageBus;
use nightowl::channels::ChannelManager;
use nightowl::config::{Config, get_config_path, load_config, providers_status, save_config};
use nightowl::cron::{CronSchedule, CronService, DailySummaryService};
use nightowl::heartbeat::{DEFAULT_HEARTBEAT_INTERVAL_S, HeartbeatService};
use nightowl::mcp::McpManager;
use nightowl::providers::{LLMProvider, OpenAIProvider};
use nightowl::session::SessionManager;
use nightowl::utils::{get_data_path, get_workspace_path};
use std::io::BufRead;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "nightowl", about = "nightowl: always-on personal AI agent")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the config file and workspace scaffolding.
    Onboard,
    /// Run the full gateway: channels, agent, schedulers.
    Gateway {
        #[arg(short, long, default_value_t = false)]
        verbose: bool,
    },
    /// Chat with the agent directly.
    Agent {
        #[arg(short, long)]
        message: Option<String>,
        #[arg(short, long, default_value = "cli:direct")]
        session: String,
    },
    /// Show configuration status.
    Status,
    Version,
    Channels {
        #[command(subcommand)]
        command: ChannelCommand,
    },
    Cron {
        #[command(subcommand)]
        command: CronCommand,
    },
}

#[derive(Debug, Subcommand)]
enum ChannelCommand {
    Status,
    Login,
}

#[derive(Debug, Subcommand)]
enum CronCommand {
    List {
        #[arg(short, long, default_value_t = false)]
        all: bool,
    },
    Add {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        message: String,
        #[arg(short = 'e', long)]
        every: Option<i64>,
        #[arg(short = 'c', long)]
        cron: Option<String>,
        #[arg(long)]
        tz: Option<String>,
        #[arg(long)]
        at: Option<String>,
        #[arg(short, long, default_value_t = false)]
        deliver: bool,
        #[arg(long)]
        to: Option<String>,
        #[arg(long)]
        channel: Option<String>,
    },
    Remove {
        job_id: String,
    },
    Enable {
        job_id: String,
        #[arg(long, default_value_t = false)]
        disable: bool,
    },
    Run {
        job_id: String,
        #[arg(short, long, default_value_t = false)]
        force: bool,
    },
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Onboard => cmd_onboard()?,
        Commands::Status => cmd_status()?,
        Commands::Version => println!("nightowl v{VERSION}"),
        Commands::Gateway { verbose } => {
            init_tracing(verbose);
            cmd_gateway().await?;
        }
        Commands::Agent { message, session } => {
            init_tracing(false);
            cmd_agent(message, &session).await?;
        }
        Commands::Channels { command } => cmd_channels(command)?,
        Commands::Cron { command } => {
            init_tracing(false);
            cmd_cron(command).await?;
        }
    }
    Ok(())
}

fn cmd_onboard() -> Result<()> {
    let config_path = get_config_path()?;
    if config_path.exists() {
        println!("Config already exists at {}", config_path.display());
        return Ok(());
    }

    let config = Config::default();
    save_config(&config, Some(&config_path))?;
    println!("Created config at {}", config_path.display());

    let workspace = get_workspace_path(Some(&config.agents.defaults.workspace))?;
    println!("Created workspace at {}", workspace.display());

    let templates = [
        (
            "SOUL.md",
            "# Soul\n\nI am nightowl, an always-on personal assistant.\n",
        ),
        (
            "IDENTITY.toml",
            "[traits]\ncuriosity = 0.8\nwarmth = 0.7\n\n[trust]\ndefault = 0.3\n\n[trust.known]\n# owner = 1.0\n\n[autonomy.free]\nread_files = true\nsearch_web = true\n\n[autonomy.requires_confirmation]\nshell_commands = true\n",
        ),
        (
            "USER.toml",
            "[profile]\n# name = \"\"\n# timezone = \"\"\n",
        ),
        (
            "AGENTS.toml",
            "[defaults]\n# Per-agent policy overrides live here.\n",
        ),
        (
            "HEARTBEAT.md",
            "# Heartbeat\n\n- [ ]\n",
        ),
    ];
    for (name, content) in templates {
        let path = workspace.join(name);
        if !path.exists() {
            std::fs::write(&path, content)?;
            println!("Created {}", path.display());
        }
    }

    let memory_dir = workspace.join("memory");
    std::fs::create_dir_all(&memory_dir)?;
    let memory_file = memory_dir.join("MEMORY.md");
    if !memory_file.exists() {
        std::fs::write(&memory_file, "")?;
        println!("Created {}", memory_file.display());
    }
    std::fs::create_dir_all(workspace.join("skills"))?;

    println!("nightowl is ready.");
    println!("Next steps:");
    println!("1. Add your API key to {}", config_path.display());
    println!("2. Chat: nightowl agent -m \"Hello!\"");
    Ok(())
}

fn cmd_status() -> Result<()> {
    let config_path = get_config_path()?;
    let config = load_config(Some(&config_path)).unwrap_or_default();
    let workspace = config.workspace_path();

    println!("nightowl status");
    println!(
        "Config: {} {}",
        config_path.display(),
        if config_path.exists() { "OK" } else { "MISSING" }
    );
    println!(
        "Workspace: {} {}",
        workspace.display(),
        if workspace.exists() { "OK" } else { "MISSING" }
    );
    println!("Model: {}", config.agents.defaults.model);

    let status = providers_status(&config);
    for (name, configured) in &status {
        println!(
            "{name} API: {}",
            if configured.as_bool().unwrap_or(false) {
                "SET"
            } else {
                "NOT SET"
            }
        );
    }

    let sessions = SessionManager::new()?;
    println!("Sessions: {}", sessions.list_sessions().len());
    if !config.mcp_servers.is_empty() {
        let mut names: Vec<&String> = config.mcp_servers.keys().collect();
        names.sort();
        println!(
            "MCP servers: {}",
            names
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    Ok(())
}

fn build_provider(config: &Config, model: &str) -> Result<Arc<dyn LLMProvider>> {
    let api_key = config
        .get_api_key(Some(model))
        .ok_or_else(|| anyhow!("No API key configured. Set one under providers.*.apiKey in the config."))?;
    let api_base = config.get_api_base(Some(model));
    let extra_headers = config
        .get_provider(Some(model))
        .and_then(|p| p.extra_headers.clone());
    Ok(Arc::new(OpenAIProvider::new(
        api_key,
        api_base,
        model.to_string(),
        extra_headers,
    )))
}

fn agent_settings(config: &Config) -> AgentSettings {
    let defaults = &config.agents.defaults;
    AgentSettings {
        model: Some(defaults.model.clone()),
        summarizer_model: defaults.summarizer_model.clone(),
        max_iterations: defaults.max_tool_iterations,
        memory_window: defaults.memory_window,
        llm_timeout_s: defaults.llm_timeout,
        max_tokens: defaults.max_tokens,
        temperature: defaults.temperature,
        web_search_key: Some(config.tools.web.search.api_key.clone())
            .filter(|k| !k.is_empty()),
        exec_timeout_s: config.tools.exec.timeout,
        restrict_to_workspace: config.tools.restrict_to_workspace,
    }
}

struct Runtime {
    bus: Arc<MessageBus>,
    agent: Arc<AgentLoop>,
    cron: Arc<CronService>,
    mcp: Arc<McpManager>,
    sessions: Arc<SessionManager>,
    provider: Arc<dyn LLMProvider>,
}

/// Build the bus, provider, sessions, cron engine and agent loop, and
/// wire the cron callback through the agent.
async fn build_runtime(config: &Config) -> Result<Runtime> {
    let model = config.agents.defaults.model.clone();
    let provider = build_provider(config, &model)?;
    let bus = Arc::new(MessageBus::new());
    let sessions = Arc::new(SessionManager::new()?);
    let mcp = Arc::new(McpManager::new(config.mcp_servers.clone()));

    let cron_store_path = get_data_path()?.join("cron").join("jobs.json");
    let cron = Arc::new(CronService::new(cron_store_path));
    cron.set_bus(bus.clone());

    let agent = Arc::new(AgentLoop::new(
        bus.clone(),
        provider.clone(),
        config.workspace_path(),
        agent_settings(config),
        Some(cron.clone()),
        Some(sessions.clone()),
        None,
        mcp.clone(),
    )?);

    let agent_for_cron = agent.clone();
    cron.set_on_job(Arc::new(move |job| {
        let agent = agent_for_cron.clone();
        Box::pin(async move {
            let response = agent
                .process_direct(
                    &job.payload.message,
                    Some(&format!("cron:{}", job.id)),
                    job.payload.channel.as_deref(),
                    job.payload.to.as_deref(),
                )
                .await?;
            Ok((!response.is_empty()).then_some(response))
        })
    }))
    .await;

    Ok(Runtime {
        bus,
        agent,
        cron,
        mcp,
        sessions,
        provider,
    })
}

async fn cmd_gateway() -> Result<()> {
    let config = load_config(None)?;
    let runtime = build_runtime(&config).await?;
    runtime.cron.start().await?;

    let heartbeat = Arc::new(HeartbeatService::new(
        config.workspace_path(),
        DEFAULT_HEARTBEAT_INTERVAL_S,
        true,
    ));
    let agent_for_heartbeat = runtime.agent.clone();
    heartbeat
        .set_on_heartbeat(Arc::new(move |prompt| {
            let agent = agent_for_heartbeat.clone();
            Box::pin(async move {
                agent
                    .process_direct(&prompt, Some("heartbeat"), None, None)
                    .await
                    .unwrap_or_default()
            })
        }))
        .await;
    heartbeat.start().await;

    let summarizer = Arc::new(Summarizer::new(
        runtime.provider.clone(),
        config
            .agents
            .defaults
            .summarizer_model
            .clone()
            .or(Some(config.agents.defaults.model.clone())),
        Some(config.agents.defaults.llm_timeout),
    ));
    let daily = Arc::new(DailySummaryService::new(
        config.workspace_path(),
        summarizer,
        runtime.sessions.clone(),
        config.agents.defaults.daily_summary_hour,
        true,
        None,
    )?);
    daily.start().await;

    let channels = Arc::new(ChannelManager::new(&config, runtime.bus.clone()));
    let enabled_channels = channels.enabled_channels();
    if enabled_channels.is_empty() {
        println!("Warning: no channels enabled");
    } else {
        println!("Channels enabled: {}", enabled_channels.join(", "));
    }
    println!("Gateway started. Press Ctrl+C to stop.");

    let agent_task = {
        let agent = runtime.agent.clone();
        tokio::spawn(async move {
            let _ = agent.run().await;
        })
    };
    let channels_task = {
        let channels = channels.clone();
        tokio::spawn(async move {
            channels.start_all().await;
        })
    };

    tokio::signal::ctrl_c().await?;
    println!("Shutting down...");
    runtime.agent.shutdown().await;
    heartbeat.stop().await;
    daily.stop().await;
    runtime.cron.stop().await;
    channels.stop_all().await;
    agent_task.abort();
    channels_task.abort();
    Ok(())
}

async fn cmd_agent(message: Option<String>, session: &str) -> Result<()> {
    let config = load_config(None)?;
    let runtime = build_runtime(&config).await?;
    runtime.cron.start().await?;

    if let Some(content) = message {
        let response = runtime
            .agent
            .process_direct(&content, Some(session), None, None)
            .await?;
        println!("nightowl: {response}");
    } else {
        println!("nightowl interactive mode (type exit/quit or Ctrl+C to exit)");
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let input = line?;
            let command = input.trim();
            if command.is_empty() {
                continue;
            }
            if is_exit_command(command) {
                break;
            }
            let response = runtime
                .agent
                .process_direct(&input, Some(session), None, None)
                .await?;
            println!("nightowl: {response}");
        }
        println!("Goodbye!");
    }

    runtime.cron.stop().await;
    runtime.mcp.shutdown().await;
    Ok(())
}

fn is_exit_command(command: &str) -> bool {
    matches!(
        command.to_ascii_lowercase().as_str(),
        "exit" | "quit" | "/exit" | "/quit" | ":q"
    )
}

fn cmd_channels(command: ChannelCommand) -> Result<()> {
    let config = load_config(None)?;
    match command {
        ChannelCommand::Status => {
            println!("Channel status");
            let tg = &config.channels.telegram;
            let tg_token = if tg.token.is_empty() {
                "not configured".to_string()
            } else {
                let prefix: String = tg.token.chars().take(10).collect();
                format!("{prefix}...")
            };
            println!(
                "Telegram: {} ({})",
                if tg.enabled { "enabled" } else { "disabled" },
                tg_token
            );
            let wa = &config.channels.whatsapp;
            println!(
                "WhatsApp: {} ({})",
                if wa.enabled { "enabled" } else { "disabled" },
                wa.bridge_url
            );
        }
        ChannelCommand::Login => {
            println!("WhatsApp login runs through the bridge process.");
            println!(
                "Start the bridge at {} and scan the QR code it prints.",
                config.channels.whatsapp.bridge_url
            );
        }
    }
    Ok(())
}

async fn cmd_cron(command: CronCommand) -> Result<()> {
    let store_path = get_data_path()?.join("cron").join("jobs.json");
    let cron = Arc::new(CronService::new(store_path));
    cron.load().await?;

    match command {
        CronCommand::List { all } => {
            let jobs = cron.list_jobs(all).await;
            if jobs.is_empty() {
                println!("No scheduled jobs.");
            } else {
                for job in jobs {
                    println!(
                        "{} {} [{}] next={} runs={}",
                        job.id,
                        job.name,
                        job.schedule.describe(),
                        job.state.next_run_at_ms.unwrap_or_default(),
                        job.state.run_count,
                    );
                }
            }
        }
        CronCommand::Add {
            name,
            message,
            every,
            cron: cron_expr,
            tz,
            at,
            deliver,
            to,
            channel,
        } => {
            let schedule = if let Some(every) = every {
                CronSchedule::every(every * 1000)
            } else if let Some(expr) = cron_expr {
                CronSchedule::cron(expr, tz.as_deref())
            } else if let Some(at) = at {
                let ts = chrono::DateTime::parse_from_rfc3339(&at)
                    .map_err(|e| anyhow!("invalid --at value: {e}"))?;
                CronSchedule::at(ts.timestamp_millis())
            } else {
                return Err(anyhow!("Must specify --every, --cron, or --at"));
            };

            let job = cron
                .add_job(name, schedule, message, deliver, channel, to)
                .await?;
            println!("Added job '{}' ({})", job.name, job.id);
        }
        CronCommand::Remove { job_id } => {
            if cron.remove_job(&job_id).await? {
                println!("Removed job {job_id}");
            } else {
                println!("Job {job_id} not found");
            }
        }
        CronCommand::Enable { job_id, disable } => match cron.enable_job(&job_id, !disable).await? {
            Some(job) => println!(
                "Job '{}' {}",
                job.name,
                if disable { "disabled" } else { "enabled" }
            ),
            None => println!("Job {job_id} not found"),
        },
        CronCommand::Run { job_id, force } => {
            let config = load_config(None)?;
            let runtime = build_runtime(&config).await?;
            // Route the manual run through the wired agent, not the bare
            // store-only service loaded above.
            runtime.cron.load().await?;
            if runtime.cron.run_job(&job_id, force).await? {
                println!("Job executed");
            } else {
                println!("Failed to run job {job_id}");
            }
            runtime.mcp.shutdown().await;
        }
    }

    Ok(())
}
