//! Node commands: wires the UDP link to a file server or a client.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::info;

use busfile_client::FileClient;
use busfile_protocol::NodeId;
use busfile_server::FileServer;
use busfile_store::DirStore;
use busfile_transport::udp;

use crate::config::Config;

/// Serves the configured root until Ctrl-C.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let (server, addr) = start_server(&config, &cancel).await?;
    info!(
        node = %config.node_id,
        %addr,
        root = %server.store().root().display(),
        capacity = server.capacity(),
        "file server running"
    );

    tokio::signal::ctrl_c().await?;
    info!(open = server.active_sessions(), "shutting down");
    cancel.cancel();
    Ok(())
}

/// Uploads `local` to `remote` on `node`.
pub async fn put(config: &Config, node: NodeId, local: &Path, remote: &str) -> anyhow::Result<()> {
    let data = std::fs::read(local).with_context(|| format!("reading {}", local.display()))?;
    let cancel = CancellationToken::new();
    let client = connect(config, node, &cancel).await?;

    let result = client.upload(remote, &data).await;
    cancel.cancel();
    result.with_context(|| format!("uploading to {node}:{remote}"))?;

    info!(%node, remote, bytes = data.len(), sha256 = %digest(&data), "upload finished");
    Ok(())
}

/// Downloads `remote` from `node` into `local`.
pub async fn get(config: &Config, node: NodeId, remote: &str, local: &Path) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let client = connect(config, node, &cancel).await?;

    let result = client.download(remote).await;
    cancel.cancel();
    let data = result.with_context(|| format!("downloading {node}:{remote}"))?;

    std::fs::write(local, &data).with_context(|| format!("writing {}", local.display()))?;
    info!(%node, remote, bytes = data.len(), sha256 = %digest(&data), "download finished");
    Ok(())
}

async fn start_server(
    config: &Config,
    cancel: &CancellationToken,
) -> anyhow::Result<(Arc<FileServer<DirStore>>, SocketAddr)> {
    std::fs::create_dir_all(&config.root)
        .with_context(|| format!("creating {}", config.root.display()))?;
    let link = udp::bind(config.node_id, config.bind, config.peers()?, cancel.clone()).await?;

    let store = Arc::new(DirStore::new(&config.root));
    let server_config = config.server_config();
    let server = Arc::new(FileServer::new(store, server_config.clone()));
    server.register(&*link.endpoint);

    // Sweep idle sessions even when no request needs a slot.
    if let Some(period) = server_config.session_timeout {
        let reaper = Arc::clone(&server);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let reclaimed = reaper.reclaim_idle();
                        if reclaimed > 0 {
                            info!(reclaimed, "closed idle sessions");
                        }
                    }
                }
            }
        });
    }

    Ok((server, link.local_addr))
}

async fn connect(
    config: &Config,
    node: NodeId,
    cancel: &CancellationToken,
) -> anyhow::Result<FileClient> {
    let link = udp::bind(config.node_id, config.bind, config.peers()?, cancel.clone()).await?;
    let client = FileClient::new(link.endpoint, config.client_config());
    client.configure(node)?;
    Ok(client)
}

/// Hex SHA-256 of `data`.
fn digest(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
