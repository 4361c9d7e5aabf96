//! Registrar service binary
//!
//! Starts a registrar actor on the configured broker. The first registrar
//! in a namespace becomes primary; later ones stay in standby.

use std::process::ExitCode;

use clap::Parser;

use aiko_core::config::Config;
use aiko_core::event_loop::EventLoop;
use aiko_core::logging::{self, BusTarget};
use aiko_core::service::registrar::{self, RegistrarOptions};
use aiko_core::service::{ServiceContext, TopicPath};
use aiko_core::transport::{MqttTransport, PubSub, SharedTransport};

/// Registrar for the Aiko Services namespace
#[derive(Parser)]
#[command(name = "aiko_registrar")]
#[command(author, version)]
#[command(about = "Start a registrar actor; no arguments required")]
struct Args {
    /// Instance segment of the topic path
    #[arg(long, default_value = "registrar")]
    instance: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let config = Config::from_env();

    let topic_path = TopicPath::local(&config.namespace, &args.instance);
    let client_id = format!("aiko-registrar-{}", std::process::id());
    let (transport, driver) = MqttTransport::connect(&config, &client_id);
    let transport: SharedTransport = transport;

    logging::init(
        &config,
        Some(BusTarget {
            transport: transport.clone(),
            topic: topic_path.log_topic(),
            topic_path: topic_path.to_string(),
        }),
    );

    let (event_loop, handle) = EventLoop::new();
    let context = ServiceContext::new(handle, transport.clone(), config.registrar_topic());
    if let Err(error) = registrar::start(context, &args.instance, RegistrarOptions::default()) {
        eprintln!("registrar failed to start: {}", error);
        return ExitCode::from(2);
    }
    tracing::info!(topic = %topic_path, "registrar started");

    // Ctrl-C turns into a graceful (terminate) command
    {
        let transport = transport.clone();
        let in_topic = topic_path.in_topic();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = transport.publish(&in_topic, "(terminate)", false);
            }
        });
    }

    let mut driver_task = tokio::spawn(driver.run());
    tokio::select! {
        _ = event_loop.run() => {
            // Let the driver flush the retraction before exiting
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            driver_task.abort();
            ExitCode::SUCCESS
        }
        result = &mut driver_task => match result {
            Ok(Ok(())) => ExitCode::SUCCESS,
            Ok(Err(error)) => {
                eprintln!("transport failed: {}", error);
                ExitCode::from(2)
            }
            Err(_) => ExitCode::from(2),
        }
    }
}
