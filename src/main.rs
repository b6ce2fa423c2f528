use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Error};
use clap::Parser;
use serde_json::{json, Value};
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, Instrument};

use jobq::server::{self, ClientRequest, WorkResponseMessage};
use jobq::{telemetry, Analyzer, JobRequest, JobService, ServerConfig};

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version)]
pub struct ConfigContext {
    #[arg(
        short = 'p',
        long = "poll_interval",
        env = "JOBQ_POLL_INTERVAL",
        help = "Seconds to wait between polls when the queue is empty",
        default_value = "1"
    )]
    poll_interval: u64,

    #[arg(
        short = 't',
        long = "stale_timeout",
        env = "JOBQ_STALE_TIMEOUT",
        help = "Seconds after which a PROCESSING job is considered dead",
        default_value = "60"
    )]
    stale_timeout: u64,

    #[arg(
        short = 'r',
        long = "reap_interval",
        env = "JOBQ_REAP_INTERVAL",
        help = "Seconds between reaper sweeps",
        default_value = "30"
    )]
    reap_interval: u64,

    #[arg(
        short = 'b',
        long = "error_backoff",
        env = "JOBQ_ERROR_BACKOFF",
        help = "Seconds to back off after a storage error",
        default_value = "5"
    )]
    error_backoff: u64,

    #[arg(
        short = 'j',
        long = "jaeger_endpoint",
        env = "JOBQ_JAEGER_ENDPOINT",
        help = "Jaeger collector endpoint, e.g. http://jaeger:14268/api/traces"
    )]
    jaeger_endpoint: Option<String>,
}

impl ConfigContext {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            poll_interval: Duration::from_secs(self.poll_interval),
            error_backoff: Duration::from_secs(self.error_backoff),
            reap_interval: Duration::from_secs(self.reap_interval),
            stale_timeout: Duration::from_secs(self.stale_timeout),
        }
    }
}

/// Stand-in analysis engine: summarises the inputs, rejects anything marked corrupt.
fn demo_analysis(inputs: &[String]) -> Result<Value, Error> {
    std::thread::sleep(Duration::from_millis(100));
    if let Some(bad) = inputs.iter().find(|input| input.contains("corrupt")) {
        return Err(anyhow!("Unreadable dataset: {}", bad));
    }
    Ok(json!({
        "datasets": inputs.len(),
        "inputs": inputs,
    }))
}

#[instrument(skip(cancel_token, config))]
async fn setup(cancel_token: CancellationToken, config: ConfigContext) -> Result<(), Error> {
    // Channel for sending requests to be processed
    let (send_to_server, recv_from_client) = mpsc::unbounded_channel();

    // Channel for getting response from server
    let (send_to_client, mut recv_from_server) = mpsc::unbounded_channel();

    let server_spawn = {
        let cancel_token = cancel_token.clone();
        let server_config = config.server_config();
        let analyzer: Arc<dyn Analyzer> = Arc::new(demo_analysis);
        tokio::spawn(
            async move {
                if let Err(err) = server::serve(
                    cancel_token,
                    JobService::in_memory(),
                    server_config,
                    analyzer,
                    recv_from_client,
                    send_to_client,
                )
                .await
                {
                    error!("Error starting server: {}", err);
                }
            }
            .instrument(info_span!("server")),
        )
    };

    // Simulating client requests: a duplicate in a different order, and one that fails
    let requests = [
        vec!["sales-2023.csv", "sales-2024.csv"],
        vec!["sales-2024.csv", "sales-2023.csv"],
        vec!["inventory.csv"],
        vec!["corrupt-export.csv"],
    ];
    for inputs in requests {
        let job_request = JobRequest {
            inputs: inputs.into_iter().map(String::from).collect(),
            owner: "demo-project".into(),
        };
        send_to_server.send(ClientRequest::Submit(job_request))?;
    }

    debug!("Done submitting jobs");
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Server Cancelled");
                break;
            },
            server_response = recv_from_server.recv() => {
                match server_response {
                    Some(WorkResponseMessage::JobCompleted(job_id)) | Some(WorkResponseMessage::JobFailed(job_id, _)) => {
                        send_to_server.send(ClientRequest::Fetch(job_id))?;
                    },
                    Some(WorkResponseMessage::Fetched(view)) => {
                        let job = serde_json::to_string(&view)?;
                        info!(event = "Fetched", job = %job);
                    },
                    Some(msg) => {
                        info!(event = "Message", msg = ?msg);
                    },
                    None => {
                        debug!("Server connection closed unexpectedly, exiting");
                        break;
                    }
                }
            }
        }
    }

    println!("Waiting for server to shutdown...");
    server_spawn.await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "jobq=debug");
    }

    let config = ConfigContext::parse();
    telemetry::init(config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();

    let cloned_token = token.clone();
    let app = tokio::spawn(setup(cloned_token, config));

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {println!("Received SIGTERM"); token.cancel()},
            _ = sigint.recv() => {println!("Received SIGINT"); token.cancel()},
        }
    });
    app.await??;
    println!("Shutting down.");
    telemetry::shutdown();

    Ok(())
}
