use clap::Parser;
use reply_correlator::{
    config::{AgentProfile, CorrelatorConfig},
    correlator::ReplyCorrelator,
    event_bus::{ContentKind, InboundEvent},
    transport::{LocalTransport, OutboundRequest},
    InternalResult,
};
use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Send a request to a simulated agent and await its reply", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Agent to address (must have a profile in the config)
    #[arg(short, long, default_value = "render_bot")]
    agent: String,

    /// Request text
    #[arg(short, long, default_value = "/render hello")]
    message: String,

    /// How long the simulated agent takes to reply
    #[arg(long, default_value_t = 300)]
    reply_delay_ms: u64,

    /// The simulated agent never replies
    #[arg(long)]
    silent: bool,

    /// Enable debug mode
    #[arg(short, long)]
    verbose: bool,
}

fn load_config(cli: &Cli) -> InternalResult<CorrelatorConfig> {
    if cli.config.exists() {
        return Ok(CorrelatorConfig::from_file(&cli.config)?);
    }
    // 設定ファイルがなければデモ用のプロファイル
    let mut agents = HashMap::new();
    agents.insert(
        cli.agent.clone(),
        AgentProfile {
            reply_timeout: Duration::from_secs(2),
            reply_kinds: vec![ContentKind::Video, ContentKind::Animation],
            echo_token: false,
        },
    );
    Ok(CorrelatorConfig {
        agents,
        ..Default::default()
    })
}

/// Plays the external agent: acknowledges every request addressed to it with a
/// text message, then replies with media after `delay`. Unrelated chatter from
/// other senders is mixed in so the correlator has something to filter.
fn spawn_simulated_agent(
    transport: Arc<LocalTransport>,
    name: String,
    profile: AgentProfile,
    delay: Duration,
    silent: bool,
) {
    let mut requests = transport.outbound_requests();
    tokio::spawn(async move {
        while let Ok(request) = requests.recv().await {
            if request.target != name {
                continue;
            }
            debug!(agent = %name, text = %request.text, "Simulated agent received request");
            let transport = transport.clone();
            let name = name.clone();
            let profile = profile.clone();
            tokio::spawn(async move {
                if let Err(e) = respond(&transport, &name, &profile, request, delay, silent).await {
                    warn!(error = %e, "Simulated agent failed to respond");
                }
            });
        }
    });
}

async fn respond(
    transport: &LocalTransport,
    name: &str,
    profile: &AgentProfile,
    request: OutboundRequest,
    delay: Duration,
    silent: bool,
) -> InternalResult<()> {
    let bus = transport.inbound();
    bus.publish(
        InboundEvent::builder("someone_else", ContentKind::Video)
            .text("unrelated clip")
            .build()?,
    )
    .await?;
    bus.publish(
        InboundEvent::builder(name, ContentKind::Text)
            .text("working on it...")
            .build()?,
    )
    .await?;

    if silent {
        return Ok(());
    }
    tokio::time::sleep(delay).await;

    let kind = profile
        .reply_kinds
        .first()
        .copied()
        .unwrap_or(ContentKind::Text);
    let mut reply = InboundEvent::builder(name, kind).text(&format!("done: {}", request.text));
    if let Some(token) = request.reply_token {
        reply = reply.reply_token(token);
    }
    bus.publish(reply.build()?).await?;
    Ok(())
}

async fn run(cli: &Cli) -> InternalResult<()> {
    let config = load_config(cli)?;
    info!("config loaded.");
    debug!("config: {:?}", config);

    let profile = config.profile(&cli.agent)?.clone();
    let timeout = profile.timeout()?;

    let transport = Arc::new(LocalTransport::new(config.event_buffer_size));
    let correlator = ReplyCorrelator::with_transport(transport.clone(), &config);
    spawn_simulated_agent(
        transport,
        cli.agent.clone(),
        profile.clone(),
        Duration::from_millis(cli.reply_delay_ms),
        cli.silent,
    );

    let request = OutboundRequest::new(&cli.agent, &cli.message);
    let reply = if profile.echo_token {
        correlator.request_with_token(request, timeout).await?
    } else {
        let predicate = profile.matcher(&cli.agent, chrono::Utc::now());
        correlator.request(request, predicate, timeout).await?
    };

    // Message to user as UI.
    match reply {
        Some(event) => println!(
            "Reply from {} ({}): {}",
            event.sender,
            event.kind,
            event.text.unwrap_or_default()
        ),
        None => println!(
            "No reply from {} within {}ms",
            cli.agent,
            timeout.as_millis()
        ),
    }

    correlator.shutdown();
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    if let Err(e) = run(&cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
