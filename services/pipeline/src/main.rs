//! Pipeline service binary
//!
//! `aiko_pipeline create <path.json>` starts a pipeline actor from a
//! definition; `aiko_pipeline delete <topic>` terminates a running one.
//! Exit codes: 0 graceful, 1 definition parse/load failure, 2 transport
//! failure.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};

use aiko_core::config::Config;
use aiko_core::event_loop::EventLoop;
use aiko_core::logging::{self, BusTarget};
use aiko_core::pipeline::{self, ElementRegistry};
use aiko_core::service::{ServiceContext, TopicPath};
use aiko_core::transport::{MqttTransport, PubSub, SharedTransport};

/// Run and manage Aiko pipelines
#[derive(Parser)]
#[command(name = "aiko_pipeline")]
#[command(author, version)]
#[command(about = "Start a pipeline actor from a definition, or stop a running one")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a pipeline actor from a JSON (or S-expression) definition
    Create {
        /// Path to the pipeline definition
        definition: PathBuf,

        /// Instance segment of the topic path
        #[arg(long, default_value = "1")]
        instance: String,
    },

    /// Send (terminate) to a running pipeline's topic path
    Delete {
        /// Topic path of the pipeline (`<ns>/<host>/<pid>/<instance>`)
        topic: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let config = Config::from_env();
    match args.command {
        Command::Create {
            definition,
            instance,
        } => create(&config, &definition, &instance).await,
        Command::Delete { topic } => delete(&config, &topic).await,
    }
}

async fn create(config: &Config, path: &PathBuf, instance: &str) -> ExitCode {
    let definition = match pipeline::definition::load(path) {
        Ok(definition) => definition,
        Err(error) => {
            eprintln!("cannot load {}: {}", path.display(), error);
            return ExitCode::from(1);
        }
    };

    let topic_path = TopicPath::local(&config.namespace, instance);
    let client_id = format!("aiko-pipeline-{}", std::process::id());
    let (transport, driver) = MqttTransport::connect(config, &client_id);
    let transport: SharedTransport = transport;

    logging::init(
        config,
        Some(BusTarget {
            transport: transport.clone(),
            topic: topic_path.log_topic(),
            topic_path: topic_path.to_string(),
        }),
    );

    let (event_loop, handle) = EventLoop::new();
    let context = ServiceContext::new(handle, transport.clone(), config.registrar_topic());
    let registry = ElementRegistry::with_builtins();
    let started = pipeline::start(context, definition, &registry, instance);
    if let Err(error) = started {
        eprintln!("pipeline failed to start: {}", error);
        return ExitCode::from(1);
    }
    tracing::info!(topic = %topic_path, "pipeline started");

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
            tokio::time::sleep(Duration::from_millis(500)).await;
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

async fn delete(config: &Config, topic: &str) -> ExitCode {
    if TopicPath::parse(topic).is_err() {
        eprintln!("not a topic path: {}", topic);
        return ExitCode::from(1);
    }
    let client_id = format!("aiko-pipeline-delete-{}", std::process::id());
    let (transport, driver) = MqttTransport::connect(config, &client_id);
    logging::init(config, None);

    let driver_task = tokio::spawn(driver.run());
    if let Err(error) = transport.publish(&format!("{}/in", topic), "(terminate)", false) {
        eprintln!("transport failed: {}", error);
        return ExitCode::from(2);
    }
    // Let the driver flush the publish before dropping the connection
    tokio::time::sleep(Duration::from_millis(500)).await;
    driver_task.abort();
    ExitCode::SUCCESS
}
