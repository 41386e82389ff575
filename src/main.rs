//! tickstate demo
//!
//! Runs one server and two predicting clients in-process over the
//! loopback transport for a few seconds, then prints what each side saw.
//!
//! Usage: `tickstate-demo [config.json] [seconds]`. Log level follows
//! `RUST_LOG` (default `info`).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use tickstate::{
    core::hash::{hash_snapshot, short_hex},
    game::{
        deathmatch::Deathmatch, input::ScriptedInput, movement::MovementModifier, throwables::Grenades,
        StandardSchemas,
    },
    network::{loopback, ClientLoop, ServerLoop, SessionConfig},
    FieldRead, SessionSystems, VERSION,
};

fn systems(schemas: &Arc<StandardSchemas>, label: &str) -> SessionSystems {
    let mut systems = SessionSystems::new(Arc::clone(schemas), Box::new(MovementModifier::new(Arc::clone(schemas))));
    systems.modes.register(Box::new(Deathmatch::new(Arc::clone(schemas), label)));
    systems.entities.register(Box::new(Grenades::new(Arc::clone(schemas))));
    systems
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber).context("failed to set tracing subscriber")?;

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => SessionConfig::load(&path).with_context(|| format!("loading {path}"))?,
        None => SessionConfig::default(),
    };
    let seconds: u64 = match args.next() {
        Some(s) => s.parse().context("seconds must be an integer")?,
        None => 5,
    };

    info!("tickstate demo v{}", VERSION);
    info!(tick_rate = config.tick_rate_hz, max_players = config.max_players, seconds, "Starting");

    let schemas = StandardSchemas::new(config.max_players, config.max_entities);
    let (transport, connector) = loopback();
    let mut server = ServerLoop::new(config.clone(), systems(&schemas, "demo"), transport)?;
    server.set_ready();

    let (shutdown, _) = broadcast::channel(1);
    let server_task = {
        let rx = shutdown.subscribe();
        tokio::spawn(async move {
            let stats = server.run(rx).await;
            (server, stats)
        })
    };

    let mut client_tasks = Vec::new();
    for i in 0..2u64 {
        let input = Box::new(ScriptedInput::new(0xC0FFEE + i));
        let mut client = ClientLoop::new(config.clone(), systems(&schemas, "demo"), connector.connect()?, input)?
            .with_username(format!("bot{i}"));
        client.set_ready();
        let rx = shutdown.subscribe();
        client_tasks.push(tokio::spawn(async move {
            let stats = client.run(rx).await;
            (client, stats)
        }));
    }

    tokio::time::sleep(Duration::from_secs(seconds)).await;
    // receivers may already be gone if a loop stopped on its own
    let _ = shutdown.send(());

    let mut clients = Vec::new();
    for task in client_tasks {
        clients.push(task.await.context("client task panicked")?);
    }
    let (server, server_stats) = server_task.await.context("server task panicked")?;

    info!("=== Server ===");
    info!(?server_stats, digest = %short_hex(&hash_snapshot(server.session())), "Server");

    info!("=== Clients ===");
    let stamp = schemas.player_ids.client_stamp.tick;
    for (client, stats) in &clients {
        let Some(player_id) = client.local_player_id() else {
            info!(?stats, "Client never joined");
            continue;
        };
        let predicted = client.predicted();
        info!(
            player_id,
            ?stats,
            predicted_tick = ?predicted.get_u32(stamp),
            digest = %short_hex(&hash_snapshot(predicted)),
            "Client"
        );
    }
    Ok(())
}
