use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;
use vkyc_rust::client::Client;
use vkyc_rust::config::ClientConfig;
use vkyc_rust::media::SilentMediaSource;
use vkyc_rust::net::UreqHttpClient;
use vkyc_rust::permissions::{Coordinates, FixedLocation, PermissionKind};
use vkyc_rust::store::FileSessionStore;
use vkyc_rust::transport::WsTransportFactory;

/// Headless vKYC call client. Connects to the app backend, waits for an
/// agent and runs the call until either side hangs up (Ctrl-C for this
/// side).
#[derive(Parser, Debug)]
#[command(name = "vkyc", version)]
struct Args {
    /// Base URL of the app backend (config + allocator endpoints).
    #[arg(long, default_value = "http://localhost:3000")]
    base_url: String,

    /// Profile directory holding the resumable session record.
    #[arg(long, default_value = "vkyc-profile")]
    profile_dir: PathBuf,

    /// Reported device latitude.
    #[arg(long, default_value_t = 0.0)]
    latitude: f64,

    /// Reported device longitude.
    #[arg(long, default_value_t = 0.0)]
    longitude: f64,
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    rt.block_on(async {
        if let Err(e) = run(args).await {
            error!("Fatal: {e}");
            std::process::exit(1);
        }
    });
}

async fn run(args: Args) -> anyhow::Result<()> {
    let store = Arc::new(FileSessionStore::new(&args.profile_dir).await?);

    let client = Client::new(
        ClientConfig::new(&args.base_url),
        store,
        Arc::new(WsTransportFactory::new()),
        Arc::new(SilentMediaSource::new()),
        Arc::new(UreqHttpClient::new()),
        Arc::new(FixedLocation(Coordinates {
            latitude: args.latitude,
            longitude: args.longitude,
        })),
    );

    client.start().await?;

    // Headless: no UI to probe devices, so the advisory permissions are
    // granted outright. The media source is still the authoritative check.
    for kind in [
        PermissionKind::Microphone,
        PermissionKind::Camera,
        PermissionKind::Location,
    ] {
        client.permissions.grant(kind);
    }

    let mut waiting = client.event_bus.waiting_for_agent.subscribe();
    let mut messages = client.event_bus.agent_message.subscribe();
    let mut started = client.event_bus.call_started.subscribe();
    let mut ended = client.event_bus.call_ended.subscribe();

    client.begin_call().await?;

    loop {
        tokio::select! {
            Ok(event) = waiting.recv() => {
                info!(
                    "Waiting for agent (vcip {}, connection {}{})",
                    event.vcip_id,
                    event.connection_id,
                    if event.resumed { ", resumed" } else { "" }
                );
            }
            Ok(_) = started.recv() => {
                info!("Call started");
            }
            Ok(message) = messages.recv() => {
                info!("Agent says: {}", message.message);
            }
            Ok(event) = ended.recv() => {
                info!("Call ended: {:?}", event.reason);
                client.acknowledge_end().await;
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C, hanging up");
                client.hang_up();
            }
        }
    }

    Ok(())
}
