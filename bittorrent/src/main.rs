use std::{
    env,
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
};

use bittorrent::{
    spawn_store, AdmissionRole, ClientConfig, DownloadEvent, Handshaker, MetaInfo, Registry,
    Torrent, TorrentCommand, TorrentConfig,
};

const DEFAULT_PORT: u16 = 6881;

#[tokio::main]
async fn main() {
    let format = tracing_subscriber::fmt::format();
    let sub = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .event_format(format)
        .finish();
    tracing::subscriber::set_global_default(sub).unwrap();

    let path = env::args().nth(1).expect("usage: bittorrent <path-to-torrent>");
    let metainfo = MetaInfo::new(PathBuf::from(path)).expect("failed to parse metainfo");

    let client = ClientConfig {
        listen_address: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), DEFAULT_PORT),
        ..ClientConfig::default()
    };
    let config = TorrentConfig::default();

    // One listener demultiplexes inbound connections across every active
    // torrent (§9 "Named lookup"): the Handshaker reads the handshake first
    // and resolves the info-hash against the registry before committing to
    // a reply.
    let registry = Registry::new();
    let (_store_handle, store) = spawn_store(config.output_dir.clone());
    let listener = tokio::net::TcpListener::bind(client.listen_address)
        .await
        .expect("failed to bind listener");
    let handshaker = Handshaker::new(registry.clone(), client.client_id);
    tokio::spawn(accept_loop(listener, handshaker));

    let (handle, _torrent_tx, mut events) =
        Torrent::spawn(metainfo, config, client, registry, store)
            .await
            .expect("failed to start torrent");

    while let Some(event) = events.recv().await {
        match event {
            DownloadEvent::PieceCompleted { index } => tracing::info!(index, "piece completed"),
            DownloadEvent::Completed => {
                tracing::info!("torrent complete");
                break;
            }
        }
    }

    handle.await.ok();
}

async fn accept_loop(listener: tokio::net::TcpListener, handshaker: Handshaker) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!("accept error: {}", e);
                continue;
            }
        };
        let handshaker = handshaker.clone();
        tokio::spawn(async move {
            match handshaker.accept(stream).await {
                Ok((stream, tx, peer_id)) => {
                    let _ = tx.send(TorrentCommand::HandshakeCompleted {
                        peer: addr,
                        stream,
                        peer_id,
                        role: AdmissionRole::Accepted,
                    });
                }
                Err(e) => tracing::debug!(%addr, "handshake failed: {}", e),
            }
        });
    }
}
