//! Signaling probe binary entry point
//!
//! Connects the session and presence channels to a coordination endpoint and
//! logs every lifecycle and push event, for checking a deployment by hand.
//!
//! # Usage
//!
//! ```bash
//! # Connect both channels and watch events
//! cargo run --bin signaling_probe -- --origin https://calls.example.org --token "$TOKEN"
//!
//! # Join a call and follow two contacts
//! cargo run --bin signaling_probe -- \
//!   --origin https://calls.example.org \
//!   --call-id call-42 --user-id probe-1 --display-name Probe \
//!   --contacts alice,bob
//!
//! # Load channel settings from a file
//! cargo run --bin signaling_probe -- --config ./signaling.json
//! ```

use anyhow::Context;
use callhub_signaling::{
    ContextConfig, LifecycleEvent, NoToken, PresenceStatus, RealtimeContext, StaticToken,
    TokenProvider, WebSocketConnector,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Signaling probe
///
/// Opens the call and presence hub channels and logs what the server sends.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Endpoint origin; hubs are at {origin}/hubs/call and {origin}/hubs/presence
    #[arg(long, default_value = "http://localhost:5000", env = "SIGNALING_ORIGIN")]
    origin: String,

    /// JSON file with a full ContextConfig (overrides --origin)
    #[arg(long, env = "SIGNALING_CONFIG")]
    config: Option<PathBuf>,

    /// Bearer token sent on every connect attempt
    #[arg(long, env = "SIGNALING_TOKEN")]
    token: Option<String>,

    /// POST /negotiate before opening the socket
    #[arg(long, default_value_t = false, env = "SIGNALING_NEGOTIATE")]
    negotiate: bool,

    /// Call to join once connected
    #[arg(long, env = "SIGNALING_CALL_ID")]
    call_id: Option<String>,

    /// User id used for the call
    #[arg(long, default_value = "signaling-probe", env = "SIGNALING_USER_ID")]
    user_id: String,

    /// Display name used for the call
    #[arg(long, default_value = "Signaling Probe", env = "SIGNALING_DISPLAY_NAME")]
    display_name: String,

    /// Contacts to follow (comma-separated)
    #[arg(long, value_delimiter = ',', env = "SIGNALING_CONTACTS")]
    contacts: Vec<String>,

    /// Do not publish "online" presence after connecting
    #[arg(long, default_value_t = false, env = "SIGNALING_SKIP_PRESENCE")]
    skip_presence: bool,
}

fn build_config(args: &Args) -> anyhow::Result<ContextConfig> {
    let mut config = match &args.config {
        Some(path) => ContextConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ContextConfig::for_origin(&args.origin),
    };

    if args.negotiate {
        config.session.transport.skip_negotiation = false;
        config.presence.transport.skip_negotiation = false;
    }

    config.validate()?;
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_tracing();

    let shutdown = Arc::new(Notify::new());
    let shutdown_handler = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        eprintln!("\nCtrl+C received, shutting down...");
        shutdown_handler.notify_one();
    })
    .context("failed to set Ctrl+C handler")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("signaling-probe")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, shutdown))
}

async fn async_main(args: Args, shutdown: Arc<Notify>) -> anyhow::Result<()> {
    let config = build_config(&args)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        session_url = %config.session.url,
        presence_url = %config.presence.url,
        "Signaling probe starting"
    );

    let tokens: Arc<dyn TokenProvider> = match &args.token {
        Some(token) => Arc::new(StaticToken(token.clone())),
        None => Arc::new(NoToken),
    };
    let context = RealtimeContext::new(config, Arc::new(WebSocketConnector::new()), tokens)?;

    let _session_lifecycle = context
        .session()
        .connection()
        .lifecycle()
        .on_any(|event| log_lifecycle("session", event));
    let _presence_lifecycle = context
        .presence()
        .connection()
        .lifecycle()
        .on_any(|event| log_lifecycle("presence", event));
    let _session_events = context
        .session()
        .on_any(|event| info!("session event: {:?}", event));
    let _presence_events = context
        .presence()
        .on_any(|event| info!("presence event: {:?}", event));

    let report = context.start().await;

    if report.session.is_ok() {
        if let Some(call_id) = &args.call_id {
            match context
                .session()
                .join_call(call_id, &args.user_id, &args.display_name, false, false)
                .await
            {
                Ok(room) => info!(
                    "Joined {} with {} participant(s)",
                    room.call_id,
                    room.participant_count()
                ),
                Err(e) => error!("Failed to join {}: {}", call_id, e),
            }
        }
    }

    if report.presence.is_ok() {
        if !args.skip_presence {
            if let Err(e) = context.presence().update_presence(PresenceStatus::Online).await {
                warn!("Failed to publish presence: {}", e);
            }
        }
        if !args.contacts.is_empty() {
            if let Err(e) = context.presence().subscribe_to_contacts(&args.contacts).await {
                warn!("Some subscriptions failed: {}", e);
            }
            info!("Following {:?}", context.presence().subscribed_contacts());
        }
    }

    info!("Probe running. Press Ctrl+C to stop.");
    shutdown.notified().await;

    if let Some(call_id) = &args.call_id {
        if context.session().room().is_some() {
            if let Err(e) = context
                .session()
                .leave_call(call_id, &args.user_id, Some("probe shutdown"))
                .await
            {
                warn!("Failed to leave {}: {}", call_id, e);
            }
        }
    }

    context.shutdown().await;
    info!("Signaling probe stopped");
    Ok(())
}

fn log_lifecycle(channel: &str, event: &LifecycleEvent) {
    match event {
        LifecycleEvent::ReconnectExhausted { attempts } => error!(
            "{} channel lost after {} attempts, restart the probe to reconnect",
            channel, attempts
        ),
        LifecycleEvent::AuthenticationRejected { message } => {
            error!("{} channel rejected the token: {}", channel, message)
        }
        other => info!("{} lifecycle: {:?}", channel, other),
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
