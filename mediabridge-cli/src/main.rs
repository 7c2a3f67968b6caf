//! Mediabridge CLI Application

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mediabridge_core::prelude::*;
use mediabridge_core::sim::{SimulatedConnector, SimulatedIceServerSource, SimulatedMediaDevices};
use mediabridge_core::{ReconnectSchedule, StunDescriptor, TransportError};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Settings snapshot (JSON)
    #[arg(short, long, env = "MEDIABRIDGE_SETTINGS")]
    settings: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the reconnection schedule the settings produce
    Backoff,

    /// Fetch ICE servers from the configured endpoint
    Ice {
        /// Session token passed to the endpoint
        #[arg(long, env = "MEDIABRIDGE_SESSION_TOKEN")]
        token: String,
    },

    /// Run an audio session against simulated devices
    Simulate {
        /// Devices to switch to after joining, in order ("listen-only" allowed)
        #[arg(long = "switch-to")]
        switch_to: Vec<String>,

        /// Join in listen-only mode
        #[arg(long)]
        listen_only: bool,

        /// Join muted
        #[arg(long)]
        muted: bool,

        /// Connection attempts to fail before the join succeeds
        #[arg(long, default_value = "0")]
        fail_connects: usize,

        /// Fail the first track replacement to exercise rollback
        #[arg(long)]
        fail_switch: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("MEDIABRIDGE_LOG")
                .unwrap_or_else(|_| "mediabridge=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let settings = BridgeSettings::from_path(&cli.settings)
        .with_context(|| format!("loading settings from {}", cli.settings.display()))?;

    match cli.command {
        Commands::Backoff => handle_backoff(&settings),
        Commands::Ice { token } => handle_ice(&settings, &token).await?,
        Commands::Simulate {
            switch_to,
            listen_only,
            muted,
            fail_connects,
            fail_switch,
        } => {
            handle_simulate(
                &settings,
                &switch_to,
                listen_only,
                muted,
                fail_connects,
                fail_switch,
            )
            .await?;
        }
    }

    Ok(())
}

fn handle_backoff(settings: &BridgeSettings) {
    let reconnect = &settings.reconnect;
    let mut schedule = ReconnectSchedule::new(reconnect.policy(), reconnect.max_attempts);

    println!(
        "Backoff: base {}ms | max {}ms | growth x{} | {} attempts",
        reconnect.base_interval_ms,
        reconnect.max_interval_ms,
        reconnect.growth_factor,
        reconnect.max_attempts
    );

    let mut elapsed_ms = 0u128;
    while schedule.begin_attempt() {
        println!("  attempt {:>2} at {:>7}ms", schedule.attempts(), elapsed_ms);
        if let Some(delay) = schedule.next_delay() {
            elapsed_ms += delay.as_millis();
        }
    }
    println!("  gives up after {}ms", elapsed_ms);
}

async fn handle_ice(settings: &BridgeSettings, token: &str) -> Result<()> {
    println!("Fetching ICE servers from {}...", settings.ice.endpoint);

    let provider = IceServerProvider::from_settings(&settings.ice)?;
    let servers = provider.get_ice_servers(token).await;

    if let Some(error) = provider.last_error() {
        println!("Fetch failed ({error}), using fallback");
    }
    println!("{}", serde_json::to_string_pretty(&servers)?);
    Ok(())
}

async fn handle_simulate(
    settings: &BridgeSettings,
    switch_to: &[String],
    listen_only: bool,
    muted: bool,
    fail_connects: usize,
    fail_switch: bool,
) -> Result<()> {
    let devices = Arc::new(
        SimulatedMediaDevices::new()
            .with_microphone("mic-builtin", "Built-in Microphone")
            .with_microphone("mic-usb", "USB Headset")
            .with_microphone("mic-bt", "Bluetooth Earbuds"),
    );
    let connector = Arc::new(SimulatedConnector::new());
    connector.fail_next_connects(
        fail_connects,
        TransportError::ConnectFailed("simulated negotiation failure".to_string()),
    );

    let events = EventBus::default();
    let mut receiver = events.subscribe();

    let ice_source = SimulatedIceServerSource::new(IceServerPayload {
        stun_servers: vec![StunDescriptor {
            url: settings.ice.fallback_stun_address.clone(),
        }],
        turn_servers: vec![],
    });
    let ice = IceServerProvider::new(
        Arc::new(ice_source),
        settings.ice.fetch_timeout(),
        settings.ice.fallback_stun_address.clone(),
    )
    .with_events(events.clone());

    let bridge = AudioBridge::new(
        settings,
        BridgeServices {
            acquisition: devices,
            connector: connector.clone(),
            ice: Arc::new(ice),
            events,
        },
    );
    if muted {
        bridge.set_muted(true);
    }

    let session = SessionContext::new("simulated-token", "cli-user", "CLI", "00000");
    let input = listen_only.then_some(InputDevice::ListenOnly);
    println!("Joining simulated audio session...");
    let joined = bridge.join_session(&session, input).await;
    print_events(&mut receiver);
    if let Err(e) = joined {
        println!("Join failed: {e}");
        return Ok(());
    }

    if fail_switch {
        if let Some(connection) = connector.last_connection() {
            connection.fail_next_set_input_stream(TransportError::ReplaceFailed(
                "simulated replacement failure".to_string(),
            ));
        }
    }

    for device in switch_to {
        println!("Switching to {device}...");
        match bridge
            .live_change_input_device(InputDevice::from(device.as_str()))
            .await
        {
            Ok(Some(stream)) => println!("  now publishing {:?}", stream.device_id()),
            Ok(None) => println!("  listen-only"),
            Err(e) => println!("  switch failed: {e}"),
        }
        print_events(&mut receiver);
    }

    bridge.exit_session().await?;
    print_events(&mut receiver);
    println!("Call states: {:?}", bridge.call_state_history());
    Ok(())
}

fn print_events(receiver: &mut broadcast::Receiver<BridgeEvent>) {
    loop {
        match receiver.try_recv() {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => println!("  [{:?}] {}", event.severity(), json),
                Err(e) => tracing::warn!("Unprintable event: {}", e),
            },
            Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                tracing::warn!(missed, "Event stream lagged");
            }
            Err(_) => break,
        }
    }
}
