use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use graphd::protocol::SharedSink;
use graphd::{Config, Flow, ServerState, Session};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Runs one protocol session over stdin/stdout. Logs go to stderr.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::from_env();
    info!(?config, "starting graphd");
    let state = ServerState::new(config, Handle::current());

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut out = FramedWrite::new(tokio::io::stdout(), LinesCodec::new());
        while let Some(line) = rx.recv().await {
            out.send(line).await?;
        }
        anyhow::Ok(())
    });

    let sink: SharedSink = Arc::new(tx);
    let mut session = Session::open(&state, sink).context("failed to open session")?;
    let mut lines = FramedRead::new(tokio::io::stdin(), LinesCodec::new());
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "error reading request");
                break;
            }
        };
        if session.handle_line(&line).await == Flow::Close {
            break;
        }
    }
    session.close();
    drop(session);

    match tokio::time::timeout(Duration::from_secs(1), writer).await {
        Ok(joined) => joined.context("writer task panicked")??,
        Err(_) => warn!("output still held open, exiting"),
    }
    Ok(())
}
