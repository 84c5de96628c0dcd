use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use conduit_core::impls::{EchoHandler, InMemoryBroker};
use conduit_core::ports::{IdGenerator, SystemClock, UlidGenerator};
use conduit_core::{
    Bridge, BridgeBuilder, BridgeConfig, BridgeError, ConfigError, Delivery, ErrorKind, Task,
    TaskEnvelope,
};

#[derive(Parser, Debug)]
#[command(name = "conduit")]
#[command(version)]
#[command(about = "Request/reply over a message broker with automatic reconnects.", long_about = None)]
struct Cli {
    /// TOML config file; defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit one request and print its result as JSON
    Request {
        /// Request body, e.g. '{"payload":"hello"}'
        body: String,
    },

    /// Run many concurrent requests through an in-process worker group
    Demo {
        #[arg(long, default_value_t = 20)]
        tasks: usize,

        /// Sever every broker connection after this many milliseconds
        #[arg(long)]
        sever_after_ms: Option<u64>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RequestBody {
    payload: String,
}

#[derive(Debug, Serialize)]
struct SuccessBody {
    task_id: String,
    result: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // stdout carries the JSON answer, logs go to stderr
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("could not install log subscriber: {e}");
    }

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => return fail(&anyhow::Error::new(e), ErrorKind::InvalidConfig),
    };

    let outcome = match cli.command {
        Commands::Request { body } => request(config, &body).await,
        Commands::Demo {
            tasks,
            sever_after_ms,
        } => demo(config, tasks, sever_after_ms.map(Duration::from_millis)).await,
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            let kind = e
                .downcast_ref::<BridgeError>()
                .map_or(ErrorKind::Broker, BridgeError::kind);
            fail(&e, kind)
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<BridgeConfig, ConfigError> {
    match path {
        Some(path) => BridgeConfig::load(path),
        None => Ok(BridgeConfig::default()),
    }
}

fn start_bridge(config: BridgeConfig, broker: &InMemoryBroker) -> Result<Bridge, BridgeError> {
    BridgeBuilder::new(Arc::new(broker.clone()))
        .config(config)
        .handler(Arc::new(EchoHandler))
        .build()
}

async fn request(config: BridgeConfig, raw: &str) -> anyhow::Result<ExitCode> {
    let body: RequestBody = match serde_json::from_str(raw) {
        Ok(body) => body,
        Err(e) => {
            let err = BridgeError::Decode(format!("malformed request body: {e}"));
            return Ok(fail(&anyhow::Error::new(err), ErrorKind::Decode));
        }
    };

    let broker = InMemoryBroker::new();
    let bridge = start_bridge(config, &broker)?;
    let id = UlidGenerator::new(SystemClock).generate_task_id();
    info!(task_id = %id, "submitting request");

    let outcome = bridge
        .router()
        .submit_with_default_timeout(Task::new(id, body.payload.into_bytes()))
        .await;
    bridge.shutdown().await;

    match outcome.and_then(|delivery| render(&delivery)) {
        Ok(success) => {
            println!("{}", serde_json::to_string(&success)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            let kind = e.kind();
            Ok(fail(&anyhow::Error::new(e), kind))
        }
    }
}

async fn demo(
    config: BridgeConfig,
    tasks: usize,
    sever_after: Option<Duration>,
) -> anyhow::Result<ExitCode> {
    let broker = InMemoryBroker::new();
    let bridge = start_bridge(config, &broker)?;
    let ids = UlidGenerator::new(SystemClock);
    info!(tasks, workers = bridge.worker_count(), "demo starting");

    if let Some(delay) = sever_after {
        let broker = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            warn!("severing every broker connection");
            broker.sever_connections();
        });
    }

    let started = Instant::now();
    let submissions = (0..tasks).map(|i| {
        let task = Task::new(ids.generate_task_id(), format!("demo-{i}").into_bytes());
        bridge.router().submit_with_default_timeout(task)
    });

    let outcomes = tokio::select! {
        outcomes = join_all(submissions) => outcomes,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, shutting down");
            bridge.shutdown().await;
            return Ok(ExitCode::from(130));
        }
    };

    let mut failures = 0usize;
    for outcome in outcomes {
        match outcome.and_then(|delivery| render(&delivery)) {
            Ok(success) => println!("{}", serde_json::to_string(&success)?),
            Err(e) => {
                failures += 1;
                let body = ErrorBody {
                    error: e.to_string(),
                    kind: e.kind().as_str(),
                };
                println!("{}", serde_json::to_string(&body)?);
            }
        }
    }

    bridge.shutdown().await;
    let stats = broker.stats();
    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        failures,
        published = stats.published,
        acked = stats.acked,
        redelivered = stats.redelivered,
        connects = stats.connect_attempts,
        "demo finished"
    );

    Ok(if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn render(delivery: &Delivery) -> Result<SuccessBody, BridgeError> {
    let envelope = TaskEnvelope::decode(delivery.body())?;
    Ok(SuccessBody {
        task_id: envelope.task_id().to_string(),
        result: String::from_utf8_lossy(envelope.payload()).into_owned(),
    })
}

fn fail(err: &anyhow::Error, kind: ErrorKind) -> ExitCode {
    let body = ErrorBody {
        error: format!("{err:#}"),
        kind: kind.as_str(),
    };
    match serde_json::to_string(&body) {
        Ok(json) => println!("{json}"),
        Err(_) => println!("{{\"error\":\"unprintable\",\"kind\":\"{}\"}}", kind.as_str()),
    }
    ExitCode::from(u8::try_from(kind.exit_code()).unwrap_or(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_request_and_demo() {
        let cli = Cli::try_parse_from(["conduit", "request", r#"{"payload":"hi"}"#]).unwrap();
        assert!(matches!(cli.command, Commands::Request { .. }));

        let cli = Cli::try_parse_from(["conduit", "--config", "c.toml", "demo", "--tasks", "5"])
            .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("c.toml")));
        assert!(matches!(cli.command, Commands::Demo { tasks: 5, sever_after_ms: None }));
    }

    #[test]
    fn request_body_requires_a_payload_string() {
        assert!(serde_json::from_str::<RequestBody>(r#"{"payload":"x"}"#).is_ok());
        assert!(serde_json::from_str::<RequestBody>(r#"{"payload":1}"#).is_err());
        assert!(serde_json::from_str::<RequestBody>(r#"{}"#).is_err());
    }

    #[tokio::test]
    async fn malformed_request_is_a_client_error() {
        let code = request(BridgeConfig::default(), "not json").await.unwrap();
        assert_eq!(code, ExitCode::from(2));
    }
}
