//! Tracker announce subsystem (§6): HTTP and UDP variants behind one
//! `Tracker` trait, each an independent actor driven by the torrent's
//! announce parameters published over a watch channel.

use std::{net::SocketAddr, time::Instant};
use tokio::task::JoinHandle;
use tracing::Instrument;
use url::Url;
use crate::{torrent::{TorrentCommand, TorrentTx}, InfoHash, PeerId};

mod http;
mod udp;
pub use udp::UdpTracker;
pub use http::HttpTracker;

type Result<T> = std::result::Result<T, TrackerError>;
pub type TrackerTx = tokio::sync::watch::Sender<Option<AnnounceParams>>;
pub type TrackerRx = tokio::sync::watch::Receiver<Option<AnnounceParams>>;

// Fallback interval when a tracker never gave us one.
const DEFAULT_MIN_ANNOUNCE_INTERVAL: u64 = 60;

#[derive(thiserror::Error, Debug)]
pub enum TrackerError {

    #[error("request error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("error deserializing response: {0}")]
    BencodeError(#[from] bencode::Error),

    #[error("timeout")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("invalid url")]
    InvalidUrl,

    #[error("bad http status")]
    BadHttpStatus,

    #[error("response error: {0}")]
    ResponseError(String),

}

pub struct TrackersHandle {

    urls: Vec<Url>,

    handles: Vec<JoinHandle<()>>,

    tracker_rx: TrackerRx,

    pub tracker_tx: TrackerTx,

}

impl TrackersHandle {

    pub fn new(urls: Vec<Vec<Url>>) -> Self {

        let (tracker_tx, tracker_rx) = tokio::sync::watch::channel(None);
        let urls = urls.into_iter().flatten().collect();

        Self {
            urls,
            tracker_rx,
            tracker_tx,
            handles: Vec::new(),
        }
    }

    pub async fn start(&mut self, torrent_tx: TorrentTx) {

        let mut handles = vec![];
        for url in self.urls.iter() {

            let mut tracker: Box<dyn Tracker> = match url.scheme() {
                "http" | "https" => Box::new(HttpTracker::new(url.clone())),
                "udp" => Box::new(UdpTracker::new(url.clone()).await),
                _ => {
                    tracing::warn!("unsupported tracker scheme: {}", url.scheme());
                    continue;
                },
            };

            let tx = torrent_tx.clone();
            let rx = self.tracker_rx.clone();
            let handle = tokio::spawn(async move {
                if let Err(e) = tracker.run(tx, rx).await {
                    tracing::error!("tracker error: {}", e);
                }
            }.instrument(tracing::info_span!("tracker", url = %url)));
            handles.push(handle);
        }

        self.handles = handles;
    }

    pub async fn shutdown(&mut self) {
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                tracing::error!("tracker join error: {}", e);
            }
        }
    }
}

#[async_trait::async_trait]
pub trait Tracker: Send + Sync {

    async fn announce(&mut self, params: AnnounceParams) -> Result<Vec<SocketAddr>>;

    fn can_announce(&self, time: Instant) -> bool;

    fn should_announce(&self, time: Instant) -> bool;

    async fn run(
        &mut self,
        torrent_tx: TorrentTx,
        mut tracker_rx: TrackerRx,
    ) -> Result<()> {
        loop {

            tracker_rx.changed().await.ok();
            let params = *tracker_rx.borrow();
            let time = Instant::now();

            if let Some(params) = params {
                if params.event.is_some()
                    || (params.num_want > Some(0) && self.can_announce(time))
                    || self.should_announce(time)
                {
                    let peers = self.announce(params).await?;
                    if torrent_tx.send(TorrentCommand::AnnounceResult(peers)).is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[derive(Debug, Copy, Clone, Default)]
pub struct AnnounceParams {

    pub info_hash: InfoHash,

    pub client_id: PeerId,

    pub port: u16,

    pub uploaded: u64,

    pub downloaded: u64,

    pub left: u64,

    pub event: Option<Event>,

    pub num_want: Option<usize>,

}

/// `event_id` mapping per §6: ""→0, "completed"→1, "started"→2, "stopped"→3.
#[derive(Copy, Clone, Debug, PartialEq, Default)]
pub enum Event {

    Completed,

    #[default]
    Started,

    Stopped,

}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Completed => write!(f, "completed"),
            Event::Started => write!(f, "started"),
            Event::Stopped => write!(f, "stopped"),
        }
    }
}

impl Event {
    pub fn id(self) -> u32 {
        match self {
            Event::Started => 2,
            Event::Completed => 1,
            Event::Stopped => 3,
        }
    }
}
