//! On-disk piece store (§6's storage contract), grounded on the teacher's
//! `fs::Disk` actor shape — a single long-lived task reached through a
//! mailbox, file IO offloaded to `spawn_blocking` — reshaped from a
//! block-level write-buffer into the simpler piece-file contract §6
//! actually specifies: one file per piece at `<base>/<dir_name>/<i>.piece`,
//! composed into named files only on request.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{sync::{mpsc, oneshot, Mutex}, task};
use crate::{metainfo::path_deserialize, piece::Piece, piece_cache::PieceCache, torrent::{TorrentCommand, TorrentTx}, InfoHash};

#[derive(Debug, Clone, serde_derive::Deserialize, serde_derive::Serialize)]
pub struct FileInfo {

    #[serde(deserialize_with = "path_deserialize")]
    pub path: PathBuf,

    pub length: usize,

    #[serde(skip)]
    pub offset: usize,

    #[serde(default)]
    pub md5sum: Option<String>,

}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("torrent {0} is not active in the store")]
    NotActive(String),

    #[error("torrent {0} is already active in the store")]
    AlreadyActive(String),

}

pub type Result<T> = std::result::Result<T, StoreError>;
pub type StoreTx = mpsc::UnboundedSender<StoreCommand>;
type StoreRx = mpsc::UnboundedReceiver<StoreCommand>;

pub enum StoreCommand {

    Activate {
        info_hash: InfoHash,
        dir_name: String,
        piece_hashes: Vec<[u8; 20]>,
        cache_capacity: usize,
        reply: oneshot::Sender<Result<()>>,
    },

    Deactivate {
        info_hash: InfoHash,
    },

    GetMissing {
        info_hash: InfoHash,
        reply: oneshot::Sender<Result<HashSet<u32>>>,
    },

    Store {
        info_hash: InfoHash,
        piece: Piece,
        data: Vec<u8>,
        reply_to: TorrentTx,
    },

    Retrieve {
        info_hash: InfoHash,
        index: u32,
        reply_to: TorrentTx,
    },

    Compose {
        info_hash: InfoHash,
        files: Vec<FileInfo>,
        reply: oneshot::Sender<Result<PathBuf>>,
    },

}

/// A thin async handle other actors hold to talk to the Store task —
/// the "callbacks as messages" pattern (§9): callers that want a reply
/// carry their own reply address (a oneshot, or the torrent's own mailbox
/// for `Store`/`Retrieve`, whose results arrive as ordinary torrent events).
#[derive(Clone)]
pub struct StoreHandle {
    tx: StoreTx,
}

impl StoreHandle {

    pub async fn activate(&self, info_hash: InfoHash, dir_name: String, piece_hashes: Vec<[u8; 20]>, cache_capacity: usize) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::Activate { info_hash, dir_name, piece_hashes, cache_capacity, reply })
            .map_err(|_| StoreError::NotActive(hex::encode(info_hash)))?;
        rx.await.map_err(|_| StoreError::NotActive(hex::encode(info_hash)))?
    }

    pub fn deactivate(&self, info_hash: InfoHash) {
        let _ = self.tx.send(StoreCommand::Deactivate { info_hash });
    }

    pub async fn get_missing(&self, info_hash: InfoHash) -> Result<HashSet<u32>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::GetMissing { info_hash, reply })
            .map_err(|_| StoreError::NotActive(hex::encode(info_hash)))?;
        rx.await.map_err(|_| StoreError::NotActive(hex::encode(info_hash)))?
    }

    pub fn store(&self, info_hash: InfoHash, piece: Piece, data: Vec<u8>, reply_to: TorrentTx) {
        let _ = self.tx.send(StoreCommand::Store { info_hash, piece, data, reply_to });
    }

    pub fn retrieve(&self, info_hash: InfoHash, index: u32, reply_to: TorrentTx) {
        let _ = self.tx.send(StoreCommand::Retrieve { info_hash, index, reply_to });
    }

    pub async fn compose(&self, info_hash: InfoHash, files: Vec<FileInfo>) -> Result<PathBuf> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::Compose { info_hash, files, reply })
            .map_err(|_| StoreError::NotActive(hex::encode(info_hash)))?;
        rx.await.map_err(|_| StoreError::NotActive(hex::encode(info_hash)))?
    }
}

struct ActiveTorrent {
    dir: PathBuf,
    piece_hashes: Vec<[u8; 20]>,
    cache: Mutex<PieceCache>,
}

impl ActiveTorrent {
    fn piece_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!("{index}.piece"))
    }
}

pub struct Store {
    base: PathBuf,
    torrents: HashMap<InfoHash, Arc<ActiveTorrent>>,
    rx: StoreRx,
}

pub fn spawn(base: PathBuf) -> (task::JoinHandle<()>, StoreHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut store = Store { base, torrents: HashMap::new(), rx };
    let handle = tokio::spawn(async move { store.run().await });
    (handle, StoreHandle { tx })
}

impl Store {

    #[tracing::instrument(name = "store", skip_all)]
    async fn run(&mut self) {
        tracing::info!("store starting, base={:?}", self.base);
        while let Some(cmd) = self.rx.recv().await {
            match cmd {

                StoreCommand::Activate { info_hash, dir_name, piece_hashes, cache_capacity, reply } => {
                    let result = self.activate(info_hash, dir_name, piece_hashes, cache_capacity);
                    let _ = reply.send(result);
                }

                StoreCommand::Deactivate { info_hash } => {
                    self.torrents.remove(&info_hash);
                    tracing::info!("torrent {} deactivated", hex::encode(info_hash));
                }

                StoreCommand::GetMissing { info_hash, reply } => {
                    let result = self.get_missing(info_hash);
                    let _ = reply.send(result);
                }

                StoreCommand::Store { info_hash, piece, data, reply_to } => {
                    self.store(info_hash, piece, data, reply_to);
                }

                StoreCommand::Retrieve { info_hash, index, reply_to } => {
                    self.retrieve(info_hash, index, reply_to);
                }

                StoreCommand::Compose { info_hash, files, reply } => {
                    let result = self.compose(info_hash, files);
                    let _ = reply.send(result);
                }

            }
        }
        tracing::info!("store shutdown");
    }

    fn activate(&mut self, info_hash: InfoHash, dir_name: String, piece_hashes: Vec<[u8; 20]>, cache_capacity: usize) -> Result<()> {
        if self.torrents.contains_key(&info_hash) {
            return Err(StoreError::AlreadyActive(hex::encode(info_hash)));
        }
        let dir = self.base.join(dir_name);
        std::fs::create_dir_all(&dir)?;
        self.torrents.insert(info_hash, Arc::new(ActiveTorrent {
            dir,
            piece_hashes,
            cache: Mutex::new(PieceCache::new(cache_capacity)),
        }));
        Ok(())
    }

    fn get_missing(&self, info_hash: InfoHash) -> Result<HashSet<u32>> {
        let torrent = self.torrents.get(&info_hash).ok_or_else(|| StoreError::NotActive(hex::encode(info_hash)))?;
        let mut missing = HashSet::new();
        for index in 0..torrent.piece_hashes.len() as u32 {
            if !torrent.piece_path(index).is_file() {
                missing.insert(index);
            }
        }
        Ok(missing)
    }

    fn store(&mut self, info_hash: InfoHash, piece: Piece, data: Vec<u8>, reply_to: TorrentTx) {
        let Some(torrent) = self.torrents.get(&info_hash).cloned() else {
            let _ = reply_to.send(TorrentCommand::StoreResult { index: piece.index, result: Err(()) });
            return;
        };
        let index = piece.index;
        tokio::task::spawn_blocking(move || {
            let path = torrent.piece_path(index);
            let result = write_piece(&path, &data);
            match result {
                Ok(()) => {
                    tracing::trace!("stored piece {} at {:?}", index, path);
                    let _ = reply_to.send(TorrentCommand::StoreResult { index, result: Ok(()) });
                }
                Err(e) => {
                    tracing::warn!("failed to store piece {}: {}", index, e);
                    let _ = reply_to.send(TorrentCommand::StoreResult { index, result: Err(()) });
                }
            }
        });
    }

    fn retrieve(&mut self, info_hash: InfoHash, index: u32, reply_to: TorrentTx) {
        let Some(torrent) = self.torrents.get(&info_hash).cloned() else {
            let _ = reply_to.send(TorrentCommand::RetrievalResult { index, result: Err(()) });
            return;
        };
        tokio::spawn(async move {
            if let Some(cached) = torrent.cache.lock().await.get(index) {
                let _ = reply_to.send(TorrentCommand::RetrievalResult { index, result: Ok((*cached).clone()) });
                return;
            }
            let path = torrent.piece_path(index);
            let result = tokio::task::spawn_blocking(move || std::fs::read(&path)).await;
            match result {
                Ok(Ok(data)) => {
                    torrent.cache.lock().await.add(index, data.clone());
                    let _ = reply_to.send(TorrentCommand::RetrievalResult { index, result: Ok(data) });
                }
                _ => {
                    tracing::warn!("failed to retrieve piece {}", index);
                    let _ = reply_to.send(TorrentCommand::RetrievalResult { index, result: Err(()) });
                }
            }
        });
    }

    fn compose(&mut self, info_hash: InfoHash, files: Vec<FileInfo>) -> Result<PathBuf> {
        let torrent = self.torrents.get(&info_hash).ok_or_else(|| StoreError::NotActive(hex::encode(info_hash)))?.clone();
        let out_dir = torrent.dir.join("complete");
        std::fs::create_dir_all(&out_dir)?;

        // Piece-to-file reassembly: walk pieces in order, writing the
        // relevant byte ranges into each output file as we go.
        let piece_len = guess_piece_len(&files, torrent.piece_hashes.len());
        let mut writers: Vec<(PathBuf, std::fs::File)> = Vec::with_capacity(files.len());
        for file in &files {
            let path = out_dir.join(&file.path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let handle = std::fs::OpenOptions::new().create(true).write(true).truncate(true).open(&path)?;
            writers.push((path, handle));
        }

        for index in 0..torrent.piece_hashes.len() as u32 {
            let data = std::fs::read(torrent.piece_path(index))?;
            let piece_offset = index as usize * piece_len;
            write_into_files(&files, &mut writers, piece_offset, &data)?;
        }

        Ok(out_dir)
    }

}

fn write_piece(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)
}

fn guess_piece_len(files: &[FileInfo], num_pieces: usize) -> usize {
    let total: usize = files.iter().map(|f| f.length).sum();
    if num_pieces == 0 { total } else { total.div_ceil(num_pieces) }
}

fn write_into_files(files: &[FileInfo], writers: &mut [(PathBuf, std::fs::File)], global_offset: usize, data: &[u8]) -> std::io::Result<()> {
    use std::io::{Seek, SeekFrom, Write};
    let mut pos = global_offset;
    let mut remaining = data;
    for (i, file) in files.iter().enumerate() {
        let file_start = file.offset;
        let file_end = file.offset + file.length;
        if pos >= file_end || remaining.is_empty() {
            continue;
        }
        if pos + remaining.len() <= file_start {
            break;
        }
        let write_start = pos.max(file_start);
        let write_end = (pos + remaining.len()).min(file_end);
        if write_start >= write_end {
            continue;
        }
        let slice = &remaining[(write_start - pos)..(write_end - pos)];
        let (_, handle) = &mut writers[i];
        handle.seek(SeekFrom::Start((write_start - file_start) as u64))?;
        handle.write_all(slice)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn activate_then_store_then_retrieve_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let (_handle, store) = spawn(tmp.path().to_path_buf());
        let info_hash = [1u8; 20];
        let piece_hash = {
            use sha1::Digest;
            let mut h = sha1::Sha1::new();
            h.update(b"hello world");
            h.finalize().into()
        };
        store.activate(info_hash, "t1".to_string(), vec![piece_hash], 1024).await.unwrap();

        let missing = store.get_missing(info_hash).await.unwrap();
        assert_eq!(missing, HashSet::from([0]));

        let (torrent_tx, mut torrent_rx) = mpsc::unbounded_channel();
        let piece = crate::piece::Piece::new(0, piece_hash, 11);
        store.store(info_hash, piece, b"hello world".to_vec(), torrent_tx.clone());
        let event = torrent_rx.recv().await.unwrap();
        match event {
            TorrentCommand::StoreResult { index, result } => {
                assert_eq!(index, 0);
                assert!(result.is_ok());
            }
            _ => panic!("unexpected event"),
        }

        store.retrieve(info_hash, 0, torrent_tx);
        let event = torrent_rx.recv().await.unwrap();
        match event {
            TorrentCommand::RetrievalResult { index, result } => {
                assert_eq!(index, 0);
                assert_eq!(result.unwrap(), b"hello world".to_vec());
            }
            _ => panic!("unexpected event"),
        }
    }

    #[tokio::test]
    async fn get_missing_on_unknown_torrent_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let (_handle, store) = spawn(tmp.path().to_path_buf());
        assert!(store.get_missing([9u8; 20]).await.is_err());
    }
}
