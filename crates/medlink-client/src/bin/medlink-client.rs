//! Headless call client.
//!
//! `medlink-client call` places a call through a running gateway and
//! `medlink-client listen` waits for one and answers it. While a call is up,
//! every stdin line is sent as a chat message; `/share` toggles screen
//! sharing, `/mute` and `/unmute` the microphone, `/quit` hangs up.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use medlink_client::media::SyntheticDevices;
use medlink_client::peer::rtc::RtcTransportFactory;
use medlink_client::{
    new_session_id, CallEvent, CallParams, CallSession, ClientConfig, GatewayClient, HttpRelay,
    Liveness, MediaConstraints, NotificationListener,
};
use medlink_common::{
    CaseContext, IncomingSession, NotificationBus, NotificationKind, Participant, Role, Urgency,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "medlink-client")]
struct Args {
    /// Gateway base URL
    #[arg(long, env = "MEDLINK_GATEWAY_URL", default_value = "http://127.0.0.1:3000")]
    gateway: String,

    /// Identity used for notifications and as participant id
    #[arg(long, env = "MEDLINK_IDENTITY")]
    identity: String,

    /// Display name shown to the other side
    #[arg(long, env = "MEDLINK_DISPLAY_NAME")]
    name: Option<String>,

    /// JSON list of `{type, url, username, credential}` ICE servers
    #[arg(long, env = "MEDLINK_ICE_SERVERS")]
    ice_servers: Option<String>,

    /// Relay poll interval in milliseconds
    #[arg(long, env = "MEDLINK_POLL_INTERVAL_MS", default_value_t = 1000)]
    poll_interval_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Place a call to another identity
    Call {
        /// Identity to ring
        #[arg(long)]
        to: String,
        /// Patient name for the case context
        #[arg(long)]
        patient: Option<String>,
    },
    /// Wait for an incoming call and answer it
    Listen,
}

fn build_config(args: &Args) -> Result<ClientConfig> {
    let mut config = ClientConfig::new(&args.gateway);
    config.poll_interval = Duration::from_millis(args.poll_interval_ms);
    if let Some(json) = &args.ice_servers {
        config = config
            .with_ice_servers_json(json)
            .context("invalid ICE server list")?;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    medlink_common::init_tracing_with_default("medlink_client=info");

    let args = Args::parse();
    let config = build_config(&args)?;
    let me = Participant::new(
        args.identity.clone(),
        args.name.clone().unwrap_or_else(|| args.identity.clone()),
    );

    let bus = NotificationBus::new();
    let (listener_live_tx, listener_live) = Liveness::channel();
    let listener = NotificationListener::new(&config, &me.id, bus.clone())?;
    let listener_task = listener.spawn(listener_live);

    let params = match args.command {
        Command::Call { to, patient } => {
            let session_id = new_session_id();
            let remote = Participant::new(to.clone(), to);
            let case_context = patient.map(|patient_name| CaseContext {
                patient_name,
                urgency: Urgency::Medium,
                ..Default::default()
            });
            GatewayClient::new(&config.gateway_url)?
                .initiate_call(&session_id, &me, &remote, case_context.clone())
                .await
                .context("gateway refused the call")?;
            CallParams {
                session_id,
                role: Role::Initiator,
                local: me.clone(),
                remote,
                case_context,
                constraints: MediaConstraints::default(),
            }
        }
        Command::Listen => {
            info!(identity = %me.id, "waiting for an incoming call");
            let incoming = wait_for_incoming(&bus).await?;
            println!(
                "Incoming call from {} ({})",
                incoming.initiator.name, incoming.session_id
            );
            CallParams::from_incoming(me.clone(), &incoming)
        }
    };

    let result = run_call(params, config, &bus).await;
    let _ = listener_live_tx.send(false);
    let _ = listener_task.await;
    result
}

async fn wait_for_incoming(bus: &NotificationBus) -> Result<IncomingSession> {
    let (tx, rx) = oneshot::channel();
    let slot = Arc::new(Mutex::new(Some(tx)));
    let _subscription = bus.subscribe(NotificationKind::IncomingSession, move |event| {
        match event.payload::<IncomingSession>() {
            Ok(incoming) => {
                let sender = slot
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .take();
                if let Some(sender) = sender {
                    let _ = sender.send(incoming);
                }
            }
            Err(err) => warn!("ignoring incoming-session: {}", err),
        }
    });
    tokio::select! {
        incoming = rx => incoming.map_err(|_| anyhow!("notification listener stopped")),
        _ = tokio::signal::ctrl_c() => Err(anyhow!("interrupted")),
    }
}

async fn run_call(params: CallParams, config: ClientConfig, bus: &NotificationBus) -> Result<()> {
    let relay = Arc::new(HttpRelay::new(&config.gateway_url)?);
    let factory = Arc::new(RtcTransportFactory::new(&config.ice_servers));
    let devices = Arc::new(SyntheticDevices::new());
    let control = GatewayClient::new(&config.gateway_url)?;

    let session = CallSession::new(params, config, relay, factory, devices);
    let _remote_end = session.end_on_remote_notice(bus);
    let mut events = session.subscribe();

    if let Err(err) = session.start().await {
        return Err(anyhow!("call failed to start: {}", err));
    }

    let chat = session.chat();
    let mut feed = chat.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(CallEvent::Connected { session_id }) => println!("Connected ({session_id})"),
                Ok(CallEvent::Failed { error, .. }) => eprintln!("Call failed: {error}"),
                Ok(CallEvent::Ended { duration_seconds, reason, .. }) => {
                    println!("Call ended after {duration_seconds}s ({reason:?})");
                    break;
                }
                Ok(CallEvent::Started { .. }) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            message = feed.recv() => {
                if let Ok(message) = message {
                    println!("[{}] {}: {}", message.timestamp.format("%H:%M:%S"), message.sender, message.text);
                }
            },
            line = lines.next_line() => match line {
                Ok(Some(line)) => match line.trim() {
                    "/quit" => session.end().await,
                    "/share" => match session.toggle_screen_share().await {
                        Ok(sharing) => println!("Screen share {}", if sharing { "on" } else { "off" }),
                        Err(err) => eprintln!("{err}"),
                    },
                    "/mute" => {
                        if let Err(err) = session.set_microphone_enabled(false) {
                            eprintln!("{err}");
                        }
                    }
                    "/unmute" => {
                        if let Err(err) = session.set_microphone_enabled(true) {
                            eprintln!("{err}");
                        }
                    }
                    "" => {}
                    text => {
                        if let Err(err) = chat.send(text).await {
                            eprintln!("{err}");
                        }
                    }
                },
                Ok(None) | Err(_) => session.end().await,
            },
            _ = tokio::signal::ctrl_c() => session.end().await,
        }
    }

    // Lets the other side hang up too if it has not noticed yet.
    if let Err(err) = control.end_call(session.session_id()).await {
        warn!("failed to report call end: {}", err);
    }
    Ok(())
}
