//! parley binary.
//!
//! Runs one of three roles against the same overlay:
//!
//! - `node`: the overlay node clients connect to
//! - `initiator`: opens a session and sends random numbers
//! - `responder`: accepts sessions and answers odd or even

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use parley_naming::Name;
use parley_overlay::{NodeConfig, OverlayNode};
use parley_session::{
    odd_even_reply, run_accept_loop, run_initiator, AcceptConfig, App, ConnectionId,
    InitiatorConfig, RandomNumbers, SessionConfig,
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod config;
#[macro_use]
mod logging;

use config::ParleyConfig;
use logging::ParleyLogFormatter;

/// Point-to-point request/reply sessions over a named overlay
#[derive(Parser, Debug)]
#[command(name = "parley", version, about = "Point-to-point request/reply sessions over a named overlay")]
struct Cli {
    /// Configuration file (defaults to ./parley.yaml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Overlay node endpoint, e.g. http://localhost:46357
    #[arg(long, global = true)]
    server: Option<String>,

    /// Shared secret (min 32 chars)
    #[arg(long, global = true)]
    shared_secret: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an overlay node
    Node(NodeArgs),
    /// Open a session and send random numbers
    Initiator(InitiatorArgs),
    /// Accept sessions and reply odd or even
    Responder(ResponderArgs),
}

#[derive(Args, Debug)]
struct NodeArgs {
    /// Listen address, e.g. 127.0.0.1:46357
    #[arg(long)]
    listen: Option<String>,

    /// Idle timeout, e.g. 30s
    #[arg(long)]
    idle_timeout: Option<humantime::Duration>,
}

#[derive(Args, Debug)]
struct InitiatorArgs {
    /// Local identity (org/namespace/app)
    #[arg(long)]
    identity: Option<String>,

    /// Remote identity (org/namespace/app)
    #[arg(long)]
    remote: Option<String>,

    /// Number of numbers to send
    #[arg(long)]
    iterations: Option<u32>,

    /// Minimum random number
    #[arg(long, allow_negative_numbers = true)]
    min: Option<i64>,

    /// Maximum random number
    #[arg(long, allow_negative_numbers = true)]
    max: Option<i64>,

    /// Disable end-to-end encryption (enabled by default)
    #[arg(long)]
    no_encryption: bool,

    /// Reply timeout, e.g. 5s
    #[arg(long)]
    reply_timeout: Option<humantime::Duration>,

    /// Pause between numbers, e.g. 1s
    #[arg(long)]
    pacing: Option<humantime::Duration>,
}

#[derive(Args, Debug)]
struct ResponderArgs {
    /// Local identity (org/namespace/app)
    #[arg(long)]
    identity: Option<String>,

    /// Report encryption as enabled in the banner
    #[arg(long)]
    encryption: bool,

    /// Close a session after this long without a request, e.g. 60s
    #[arg(long)]
    liveness: Option<humantime::Duration>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("parley={}", cli.log_level).parse()?)
        .add_directive(format!("parley_session={}", cli.log_level).parse()?)
        .add_directive(format!("parley_overlay={}", cli.log_level).parse()?)
        .add_directive(format!("parley_routing={}", cli.log_level).parse()?)
        .add_directive(format!("parley_wire={}", cli.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .event_format(ParleyLogFormatter::new("parley"))
        .init();

    let mut config = ParleyConfig::load(cli.config.as_deref())?;
    if let Some(server) = cli.server {
        config.server = server;
    }
    if let Some(secret) = cli.shared_secret {
        config.shared_secret = secret;
    }

    match cli.command {
        Command::Node(args) => {
            if let Some(listen) = args.listen {
                config.node.listen = listen;
            }
            if let Some(idle) = args.idle_timeout {
                config.node.idle_timeout = idle.into();
            }
            config.validate()?;
            run_node(&config).await
        }
        Command::Initiator(args) => {
            let section = &mut config.initiator;
            if let Some(identity) = args.identity {
                section.identity = identity;
            }
            if let Some(remote) = args.remote {
                section.remote = remote;
            }
            if let Some(iterations) = args.iterations {
                section.iterations = iterations;
            }
            if let Some(min) = args.min {
                section.min = min;
            }
            if let Some(max) = args.max {
                section.max = max;
            }
            if args.no_encryption {
                section.encryption = false;
            }
            if let Some(timeout) = args.reply_timeout {
                section.reply_timeout = timeout.into();
            }
            if let Some(pacing) = args.pacing {
                section.pacing = pacing.into();
            }
            config.validate()?;
            run_initiator_role(&config).await
        }
        Command::Responder(args) => {
            let section = &mut config.responder;
            if let Some(identity) = args.identity {
                section.identity = identity;
            }
            if args.encryption {
                section.encryption = true;
            }
            if let Some(liveness) = args.liveness {
                section.liveness = liveness.into();
            }
            config.validate()?;
            run_responder_role(&config).await
        }
    }
}

async fn run_node(config: &ParleyConfig) -> Result<()> {
    component_info!("node", "Starting parley overlay node v{}", env!("CARGO_PKG_VERSION"));

    let mut node_config = NodeConfig::new(config.listen_addr()?, config.shared_secret.clone());
    node_config.idle_timeout = config.node.idle_timeout;

    component_debug!("node", "Node settings: {:?}", node_config);

    let node = OverlayNode::bind(node_config)
        .await
        .context("failed to start overlay node")?;
    node.run(shutdown_signal()).await?;

    component_info!("node", "Overlay node stopped");
    Ok(())
}

/// Connect as `identity` and claim it on the new connection
async fn join_overlay(config: &ParleyConfig, identity: &Name) -> Result<(App, ConnectionId)> {
    let app = App::new(identity.clone(), config.shared_secret.clone())
        .context("failed to create app")?;
    let conn = app
        .connect(&config.server)
        .await
        .with_context(|| format!("failed to connect to {}", config.server))?;
    app.subscribe(identity, conn)
        .await
        .with_context(|| format!("failed to subscribe {}", identity))?;
    Ok((app, conn))
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "ENABLED"
    } else {
        "disabled"
    }
}

async fn run_initiator_role(config: &ParleyConfig) -> Result<()> {
    let settings = &config.initiator;
    let identity: Name = settings.identity.parse()?;
    let remote: Name = settings.remote.parse()?;

    component_info!("initiator", "=== parley initiator: odd/even ===");
    component_debug!("initiator", "Effective settings: {:?}", settings);
    let (app, conn) = join_overlay(config, &identity).await?;

    component_info!("initiator", "  Identity   : {}", identity);
    component_info!("initiator", "  Server     : {}", config.server);
    component_info!("initiator", "  Remote     : {}", remote);
    component_info!("initiator", "  Conn ID    : {}", conn.get());
    component_info!("initiator", "  Range      : {}-{}", settings.min, settings.max);
    component_info!("initiator", "  Encryption : {}", on_off(settings.encryption));

    app.set_route(&remote, conn)
        .with_context(|| format!("failed to set route to {}", remote))?;
    component_info!("initiator", "Route set to {}", remote);

    component_info!("initiator", "Creating session to {}...", remote);
    let session_config = SessionConfig {
        encryption: settings.encryption,
        ..SessionConfig::default()
    };
    let mut session = app
        .create_session_and_wait(session_config, &remote)
        .await
        .context("failed to create session")?;

    tokio::time::sleep(settings.settle_delay).await;
    component_info!("initiator", "Ready!");

    let mut source = RandomNumbers::new(settings.min, settings.max)
        .context("min must not exceed max")?;
    let report = run_initiator(
        &mut session,
        &mut source,
        &InitiatorConfig {
            iterations: settings.iterations,
            reply_timeout: settings.reply_timeout,
            pacing: settings.pacing,
        },
    )
    .await;

    if let Err(e) = app.delete_session_and_wait(&mut session).await {
        component_warn!("initiator", "Closing session failed: {}", e);
    }
    component_info!(
        "initiator",
        "Done: {} sent, {} replies, {} send failures, {} missed replies",
        report.published,
        report.replies,
        report.publish_failures,
        report.reply_failures
    );
    Ok(())
}

async fn run_responder_role(config: &ParleyConfig) -> Result<()> {
    let settings = &config.responder;
    let identity: Name = settings.identity.parse()?;

    component_info!("responder", "=== parley responder: odd/even ===");
    component_debug!("responder", "Effective settings: {:?}", settings);
    let (app, conn) = join_overlay(config, &identity).await?;

    component_info!("responder", "  Identity   : {}", identity);
    component_info!("responder", "  Server     : {}", config.server);
    component_info!("responder", "  Conn ID    : {}", conn.get());
    component_info!("responder", "  Encryption : {}", on_off(settings.encryption));
    component_info!("responder", "Waiting for sessions (Ctrl+C to exit)...");

    let report = run_accept_loop(
        app,
        AcceptConfig {
            listen_timeout: settings.listen_timeout,
            listen_retry_delay: settings.listen_retry_delay,
            liveness: settings.liveness,
        },
        odd_even_reply(),
        shutdown_signal(),
    )
    .await;

    component_info!(
        "responder",
        "Stopped after {} sessions ({} completed)",
        report.accepted,
        report.completed.len()
    );
    match report.fatal {
        Some(e) => Err(e).context("accept loop stopped"),
        None => Ok(()),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        component_error!("signal", "Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    component_info!("signal", "Shutdown requested");
}
