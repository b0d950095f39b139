use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::admission;
use crate::config::Config;
use crate::pipeline::Pipeline;
use crate::{Error, Result};

async fn read(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Serves the webhook over TLS until the process receives ctrl-c
pub async fn run(config: &Config, pipeline: Arc<Pipeline>) -> Result<()> {
    let cert = read(&config.tls_cert).await?;
    let key = read(&config.tls_key).await?;

    let (addr, server) = warp::serve(admission::routes(pipeline))
        .tls()
        .cert(cert)
        .key(key)
        .bind_with_graceful_shutdown(config.listen_addr, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "failed to listen for shutdown signal");
            }
        });

    info!(addr = %addr, "listening");
    server.await;
    info!("shut down");

    Ok(())
}
