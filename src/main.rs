//! AMQP fleet simulator - Main Entry Point
//!
//! Drives one multiplexing transport over the in-memory collaborators with a
//! fleet of devices from a TOML file, optionally injecting connection faults,
//! and prints the transport metrics when done.

use iothub_amqp::config::FleetConfig;
use iothub_amqp::observability::{init_default_logging, init_logging, LogFormat};
use iothub_amqp::protocol::{
    ConfirmationResult, IotHubMessage, MethodRequest, OutboundMessage, WaitingList,
};
use iothub_amqp::testing::{MockDeviceClient, MockWorld};
use iothub_amqp::transport::amqp::client::{
    OPTION_CBS_REQUEST_TIMEOUT, OPTION_SAS_TOKEN_LIFETIME, OPTION_SAS_TOKEN_REFRESH_TIME,
};
use iothub_amqp::transport::amqp::messaging::AmqpMessage;
use iothub_amqp::transport::amqp::{AmqpEvent, AmqpTransport, OptionValue};
use iothub_amqp::DeviceHandle;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::cell::Cell;
use std::path::PathBuf;
use std::process;
use std::rc::Rc;
use tokio::{signal, time};
use tracing::{error, info, warn, Level};

/// Multiplexing AMQP transport fleet simulator
#[derive(Parser)]
#[command(name = "amqp-fleet-sim")]
#[command(about = "Simulate a fleet of devices sharing one AMQP connection")]
#[command(version)]
struct Cli {
    /// Fleet configuration file path
    #[arg(short, long, value_name = "FILE", default_value = "fleet.toml")]
    config: PathBuf,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the simulation
    Run {
        /// Tick budget, overrides simulation.max_ticks
        #[arg(long)]
        ticks: Option<u64>,

        /// Milliseconds between ticks, overrides simulation.tick_ms
        #[arg(long)]
        tick_ms: Option<u64>,

        /// Inject a connection I/O error every N ticks
        #[arg(long, value_name = "N")]
        fail_every: Option<u64>,
    },
    /// Validate the fleet configuration
    Config {
        /// Print the parsed configuration
        #[arg(long)]
        show: bool,
    },
}

#[derive(Debug, Default)]
struct Confirmations {
    ok: Cell<usize>,
    error: Cell<usize>,
}

impl Confirmations {
    fn record(&self, result: ConfirmationResult) {
        match result {
            ConfirmationResult::Ok => self.ok.set(self.ok.get() + 1),
            ConfirmationResult::Error => self.error.set(self.error.get() + 1),
        }
    }

    fn total(&self) -> usize {
        self.ok.get() + self.error.get()
    }
}

#[derive(Serialize)]
struct RunReport {
    ticks: u64,
    devices: usize,
    messages_enqueued: usize,
    messages_confirmed: usize,
    messages_failed: usize,
    metrics: iothub_amqp::observability::MetricsSnapshot,
}

struct SimulatedDevice {
    handle: DeviceHandle,
    device_id: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, LogFormat::Compact, false),
        _ => init_logging(Level::TRACE, LogFormat::Compact, true),
    }

    info!(
        "Starting AMQP fleet simulator v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = match FleetConfig::load_from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration from {}: {}", cli.config.display(), e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run {
            ticks,
            tick_ms,
            fail_every,
        } => run_simulation(config, ticks, tick_ms, fail_every).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn handle_config_command(
    config: &FleetConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        devices = config.devices.len(),
        host = %config.transport.host_fqdn(),
        "Configuration is valid"
    );
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }
    Ok(())
}

async fn run_simulation(
    config: FleetConfig,
    ticks: Option<u64>,
    tick_ms: Option<u64>,
    fail_every: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let simulation = &config.simulation;
    let max_ticks = ticks.unwrap_or(simulation.max_ticks);
    let tick_interval = time::Duration::from_millis(tick_ms.unwrap_or(simulation.tick_ms).max(1));

    let world = MockWorld::new();
    let mut transport = AmqpTransport::create(&config.transport, world.dependencies())?;

    transport.set_option(
        OPTION_SAS_TOKEN_LIFETIME,
        OptionValue::Millis(config.options.sas_token_lifetime_ms),
    )?;
    transport.set_option(
        OPTION_SAS_TOKEN_REFRESH_TIME,
        OptionValue::Millis(config.options.sas_token_refresh_time_ms),
    )?;
    transport.set_option(
        OPTION_CBS_REQUEST_TIMEOUT,
        OptionValue::Millis(config.options.cbs_request_timeout_ms),
    )?;
    if simulation.logtrace {
        transport.set_option("logtrace", OptionValue::Bool(true))?;
    }

    let confirmations = Rc::new(Confirmations::default());
    let mut devices = Vec::new();
    let mut enqueued = 0;

    for device in &config.devices {
        let waiting = WaitingList::new();
        let handle = transport.register(
            device,
            Box::new(MockDeviceClient::new(&world)),
            waiting.clone(),
        )?;

        if simulation.receive_messages {
            transport.subscribe(handle)?;
        }
        if simulation.device_methods {
            transport.subscribe_device_methods(handle)?;
        }

        for sequence in 0..simulation.messages_per_device {
            let confirmations = Rc::clone(&confirmations);
            let message = IotHubMessage::text(format!(
                "{{\"device\":\"{}\",\"sequence\":{}}}",
                device.device_id, sequence
            ))
            .with_property("sequence", sequence.to_string());
            waiting.push_back(OutboundMessage::with_callback(message, move |result| {
                confirmations.record(result)
            }));
            enqueued += 1;
        }

        devices.push(SimulatedDevice {
            handle,
            device_id: device.device_id.clone(),
        });
    }

    info!(
        devices = devices.len(),
        messages = enqueued,
        max_ticks,
        "Simulation starting"
    );

    let mut interval = time::interval(tick_interval);
    let mut tick = 0;

    while tick < max_ticks && confirmations.total() < enqueued {
        tokio::select! {
            _ = signal::ctrl_c() => {
                warn!("Received Ctrl-C, stopping simulation");
                break;
            }
            _ = interval.tick() => {
                tick += 1;
                inject_traffic(&world, &transport, &devices, tick, fail_every);
                transport.do_work();
            }
        }
    }

    if confirmations.total() < enqueued {
        warn!(
            pending = enqueued - confirmations.total(),
            "Simulation ended with unconfirmed messages"
        );
    }

    let report = RunReport {
        ticks: tick,
        devices: devices.len(),
        messages_enqueued: enqueued,
        messages_confirmed: confirmations.ok.get(),
        messages_failed: confirmations.error.get(),
        metrics: transport.metrics().snapshot(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}

/// Queue the events the fake library reports on the next pump
fn inject_traffic(
    world: &MockWorld,
    transport: &AmqpTransport,
    devices: &[SimulatedDevice],
    tick: u64,
    fail_every: Option<u64>,
) {
    if fail_every.is_some_and(|every| every > 0 && tick % every == 0) {
        info!(tick, "Injecting connection I/O error");
        world.inject_event(AmqpEvent::IoError {
            reason: format!("simulated fault at tick {tick}"),
        });
    }

    for (index, device) in devices.iter().enumerate() {
        let Ok(status) = transport.device_status(device.handle) else {
            continue;
        };

        // Stagger cloud-to-device traffic across the fleet
        if (tick + index as u64) % 10 == 0 {
            if let Some(link_name) = status.receiver_link {
                world.inject_event(AmqpEvent::MessageReceived {
                    link_name,
                    delivery_id: tick,
                    message: AmqpMessage::with_data(format!("c2d tick {tick}").into_bytes()),
                });
            }
        }

        if status.methods.active && (tick + index as u64) % 15 == 0 {
            world.inject_event(AmqpEvent::MethodRequest {
                device_id: device.device_id.clone(),
                request_id: format!("{}-{}", device.device_id, tick),
                request: MethodRequest {
                    method_name: "ping".to_string(),
                    payload: bytes::Bytes::from_static(b"{}"),
                },
            });
        }
    }
}
