mod error;

use crate::error::{ErrorKind, Result};
use clap::{Parser, Subcommand};
use exn::ResultExt;
use serde::Serialize;
use srcwatch_config::Config;
use srcwatch_service::{Incoming, Outbound, Request, Response, Service, ServiceOptions};
use srcwatch_source::{Hasher, Registry};
use srcwatch_watch::{WatchManager, WatchOptions};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "srcwatch", version, about = "Inspect, hash and watch sources by URI")]
struct Cli {
    /// Config file; defaults to `srcwatch/config.toml` in the platform config directory.
    #[arg(long, global = true, env = "SRCWATCH_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List registered schemes and what they support
    Info,
    /// Print the metadata record of a source
    Metadata { uri: String },
    /// Print the content hash of each source
    Hash {
        #[arg(required = true)]
        uris: Vec<String>,
    },
    /// Print change/delete events until interrupted
    Watch {
        #[arg(required = true)]
        uris: Vec<String>,
    },
    /// Answer JSON-lines requests from stdin on stdout
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).or_raise(|| ErrorKind::Config)?;
    init_tracing(&config.log.filter);

    let registry = Arc::new(Registry::with_defaults(Hasher::new(config.hash.chunk_size)));
    let watches = WatchManager::new(Arc::clone(&registry), WatchOptions { debounce: config.watch.debounce() });
    let service = Service::new(registry, watches, ServiceOptions { open_limit: config.service.open_limit });

    match cli.command {
        Command::Info => print_json(&service.registry().info()),
        Command::Metadata { uri } => {
            let metadata = service.registry().extract_metadata(&uri).await.or_raise(|| ErrorKind::Command("metadata"))?;
            print_json(&metadata)
        },
        Command::Hash { uris } => {
            #[derive(Serialize)]
            struct Hashed<'a> {
                uri: &'a str,
                hash: String,
            }
            for uri in &uris {
                let hash = service.registry().hash(uri).await.or_raise(|| ErrorKind::Command("hash"))?;
                print_line(&Hashed { uri, hash: hash.to_string() })?;
            }
            Ok(())
        },
        Command::Watch { uris } => watch(service, uris).await,
        Command::Serve => serve(service).await,
    }
}

/// Logs go to stderr; stdout is reserved for machine-readable output.
fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_json(value: &impl Serialize) -> Result<()> {
    let json = serde_json::to_string_pretty(value).or_raise(|| ErrorKind::Output)?;
    println!("{json}");
    Ok(())
}

fn print_line(value: &impl Serialize) -> Result<()> {
    let json = serde_json::to_string(value).or_raise(|| ErrorKind::Output)?;
    println!("{json}");
    Ok(())
}

async fn watch(service: Service, uris: Vec<String>) -> Result<()> {
    let (session, mut notifications) = service.open_session();
    for uri in uris {
        let response = service.handle(&session, Request::WatchStart { uri: uri.clone() }).await;
        if !response.success {
            tracing::error!(%uri, error = response.error.as_deref().unwrap_or_default(), "Could not watch");
            service.shutdown().await;
            exn::bail!(ErrorKind::Command("watch"));
        }
        tracing::info!(%uri, "Watching");
    }

    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);
    loop {
        tokio::select! {
            notification = notifications.recv() => match notification {
                Some(notification) => print_line(&Outbound::from(notification))?,
                None => break,
            },
            _ = &mut interrupted => break,
        }
    }

    service.close_session(&session).await;
    service.shutdown().await;
    Ok(())
}

async fn serve(service: Service) -> Result<()> {
    serve_lines(service, BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await
}

/// One session per connection: every input line is a request, every output
/// line is either a response or an out-of-band watch message. Responses are
/// written as requests finish, so callers correlate them by `id`.
async fn serve_lines<R, W>(service: Service, input: R, mut output: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (lines_tx, mut lines_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(line) = lines_rx.recv().await {
            output.write_all(line.as_bytes()).await?;
            output.write_all(b"\n").await?;
            output.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let (session, mut notifications) = service.open_session();
    let session = Arc::new(session);
    let forwarder = {
        let lines_tx = lines_tx.clone();
        tokio::spawn(async move {
            while let Some(notification) = notifications.recv().await {
                match serde_json::to_string(&Outbound::from(notification)) {
                    Ok(line) => {
                        if lines_tx.send(line).is_err() {
                            break;
                        }
                    },
                    Err(err) => tracing::warn!(error = %err, "Could not encode watch message"),
                }
            }
        })
    };

    // A slow hash must not hold up a watch stop queued behind it.
    let mut requests = JoinSet::new();
    let mut input = input.lines();
    while let Some(line) = input.next_line().await.or_raise(|| ErrorKind::Input)? {
        if line.trim().is_empty() {
            continue;
        }
        let (service, session, lines_tx) = (service.clone(), Arc::clone(&session), lines_tx.clone());
        requests.spawn(async move {
            let response = match serde_json::from_str::<Incoming>(&line) {
                Ok(Incoming { id, request }) => service.handle(&session, request).await.with_id(id),
                Err(err) => Response::malformed(format!("malformed request: {err}")),
            };
            match serde_json::to_string(&response) {
                Ok(encoded) => {
                    let _ = lines_tx.send(encoded);
                },
                Err(err) => tracing::warn!(error = %err, "Could not encode response"),
            }
        });
        // Reap finished requests so the set doesn't grow with the session.
        while requests.try_join_next().is_some() {}
    }
    while requests.join_next().await.is_some() {}

    service.close_session(&session).await;
    let report = service.shutdown().await;
    tracing::debug!(closed = report.closed, failed = report.failed, "Input closed");
    forwarder.abort();
    // Cancelled is the expected outcome.
    let _ = forwarder.await;
    drop(lines_tx);
    writer.await.or_raise(|| ErrorKind::Output)?.or_raise(|| ErrorKind::Output)?;
    Ok(())
}
