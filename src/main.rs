use std::error::Error;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use clean_space_gate::assembly::{ModuleImage, StaticCatalog, TypeInfo, TYPE_PUBLIC};
use clean_space_gate::challenge::ChallengeEngine;
use clean_space_gate::host::{HostEvent, JoinRequest, RecordingHost};
use clean_space_gate::scanner::PLUGIN_INTERFACE;
use clean_space_gate::transport_adapter::LoopbackNetwork;
use clean_space_gate::{logging, observability, ClientAgent, GateConfig, GateContext, PeerId, SessionManager};

#[derive(Parser)]
#[command(name = "clean-space-gate", about = "Plugin integrity gate")]
struct Cli {
    /// TOML config file; defaults are used when absent.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the default configuration.
    DefaultConfig,
    /// Run one handshake between an in-process server and client.
    Demo {
        /// Number of third-party plugins the client has loaded.
        #[arg(long, default_value_t = 0)]
        plugins: usize,
    },
}

const SERVER_ID: PeerId = PeerId(1);
const CLIENT_ID: PeerId = PeerId(76_561_198_000_000_042);

fn security_module() -> ModuleImage {
    ModuleImage::new("CleanSpaceShared", "1.4.0").with_type(
        TypeInfo::new("CleanSpaceShared.Hasher.HasherRunner", TYPE_PUBLIC)
            .with_field("initialized", "System.Boolean", false)
            .with_attribute("CompilerGenerated")
            .with_method("Run", &["System.Reflection.Assembly"], vec![0x02, 0x28, 0x01, 0x00, 0x00, 0x0A, 0x2A]),
    )
}

fn demo_plugin(index: usize) -> ModuleImage {
    ModuleImage::new(format!("DemoPlugin{}", index), "1.0").with_type(
        TypeInfo::new(format!("DemoPlugin{}.Plugin", index), TYPE_PUBLIC)
            .with_interface(PLUGIN_INTERFACE)
            .with_method("Init", &["System.Object"], vec![0x00, 0x2A]),
    )
}

async fn demo(config: GateConfig, plugins: usize) -> Result<(), Box<dyn Error>> {
    let network = LoopbackNetwork::new();
    let (server_transport, server_inbox) = network.endpoint(SERVER_ID, Ipv4Addr::new(10, 0, 0, 1));
    let (client_transport, client_inbox) = network.endpoint(CLIENT_ID, Ipv4Addr::new(203, 0, 113, 7));

    let server_catalog = StaticCatalog::new("Sandbox.Game", vec![security_module()]);
    let mut client_modules = vec![security_module()];
    client_modules.extend((0..plugins).map(demo_plugin));
    let client_catalog = StaticCatalog::new("Sandbox.Game", client_modules);

    let marker = config.security_module_marker.clone();
    let (host, mut host_events) = RecordingHost::new();
    let ctx = GateContext::new(config, server_transport, Arc::new(host), Arc::new(server_catalog))?;
    let _pruner = ctx.spawn_maintenance();
    let manager = SessionManager::new(ctx);
    let client = Arc::new(ClientAgent::new(
        client_transport,
        Arc::new(client_catalog),
        ChallengeEngine::default(),
        marker,
    )?);

    tokio::spawn(Arc::clone(&manager).run(server_inbox));
    tokio::spawn(Arc::clone(&client).run(client_inbox));

    manager
        .on_connection_requested(JoinRequest {
            peer: CLIENT_ID,
            player_name: "demo".to_string(),
            payload: Vec::new(),
        })
        .await?;

    match host_events.recv().await {
        Some(HostEvent::Released(peer)) => info!(peer = %peer, "join released"),
        Some(HostEvent::Canceled(peer, reason)) => info!(peer = %peer, reason = ?reason, "join canceled"),
        None => info!("host channel closed"),
    }
    if let Some(result) = client.result() {
        info!(success = result.success, code = ?result.code, reason = %result.reason, "client saw result");
    }
    info!(counters = ?observability::snapshot(), "done");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => GateConfig::from_file(path)?,
        None => GateConfig::default(),
    };
    logging::init(config.log_level);

    match cli.command {
        Command::DefaultConfig => {
            print!("{}", GateConfig::default().to_toml()?);
            Ok(())
        }
        Command::Demo { plugins } => demo(config, plugins).await,
    }
}
