use rand::seq::SliceRandom;
use serde::{de, Deserialize};
use serde_derive::{Deserialize as De, Serialize};
use sha1::Digest;
use url::Url;
use crate::store::FileInfo;

#[derive(Debug, thiserror::Error)]
pub enum MetaInfoError {

    #[error("bencode error whilst decoding metainfo: {0}")]
    BencodeError(#[from] bencode::Error),

    #[error("invalid file extension, expected .torrent")]
    InvalidExtension,

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("invalid pieces length, must be divisible by 20")]
    InvalidPiecesLength,

    #[error("file(s) with size 0")]
    FileNoSize,

    #[error("file(s) with no path")]
    FileEmptyPath,

    #[error("file has absolute path")]
    FileAbsolutePath,

    #[error("info dict was not present as a raw byte span in the source file")]
    MissingInfoSpan,
}

// Deserialiser helpers, folded in from the teacher's separate `de` module
// since nothing else in the crate needs them.

fn url_deserialize<'de, D>(deserializer: D) -> Result<Url, D::Error>
where
    D: de::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Url::parse(&s).map_err(de::Error::custom)
}

fn announce_list_deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<Vec<Url>>>, D::Error>
where
    D: de::Deserializer<'de>,
{
    let raw = Vec::<Vec<String>>::deserialize(deserializer)?;
    let mut announce_list = Vec::new();

    for tier in raw {
        let mut urls = Vec::new();
        for url in tier {
            urls.push(Url::parse(&url).map_err(de::Error::custom)?);
        }
        announce_list.push(urls);
    }

    let total = announce_list.iter().map(|v| v.len()).sum::<usize>();
    if total == 0 { Ok(None) } else { Ok(Some(announce_list)) }
}

pub(crate) fn path_deserialize<'de, D>(deserializer: D) -> Result<std::path::PathBuf, D::Error>
where
    D: de::Deserializer<'de>,
{
    let raw = Vec::<String>::deserialize(deserializer)?;
    if raw.is_empty() {
        return Err(MetaInfoError::FileEmptyPath).map_err(de::Error::custom);
    }
    Ok(raw.into_iter().collect())
}

#[derive(Debug, Clone, De, Serialize)]
pub struct File {

    #[serde(deserialize_with = "path_deserialize")]
    pub path: std::path::PathBuf,

    pub length: u64,

    pub md5sum: Option<String>,

}

#[derive(Clone, De, Serialize)]
pub struct Info {

    // File name.
    pub name: String,

    // String consisting of the concatenation of all 20-byte SHA1 hash values, one per piece.
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,

    // Number of bytes in each piece (integer).
    #[serde(rename = "piece length")]
    pub piece_length: u32,

    // A 32-character hexadecimal string corresponding to the MD5 sum of the file.
    #[serde(default)]
    pub md5sum: Option<String>,

    // Length of the file in bytes (integer).
    #[serde(default)]
    pub length: Option<u64>,

    // A list of dictionaries, one for each file.
    #[serde(default)]
    pub files: Option<Vec<File>>,

    // If set to 1, the client MUST publish its presence only via the
    // trackers named in this metainfo file.
    #[serde(default)]
    pub private: Option<u8>,

    #[serde(default)]
    #[serde(rename = "root hash")]
    pub root_hash: Option<String>,

}

#[allow(dead_code)]
#[derive(Deserialize, Clone)]
pub struct MetaInfo {

    // The announce URL of the tracker (string).
    #[serde(deserialize_with = "url_deserialize")]
    pub announce: Url,

    // A dictionary that describes the file(s) of the torrent.
    pub info: Info,

    // sha1 hash of the raw info dict bytes as they appeared in the source
    // file — computed separately, see `new` below.
    #[serde(skip)]
    pub info_hash: [u8; 20],

    // (optional) the string encoding format used to generate the pieces part of the info
    // dictionary in the .torrent metafile (string).
    #[serde(default)]
    pub encoding: Option<String>,

    // (optional) an extension to the official specification, offering
    // backwards-compatibility with clients that only understand `announce`.
    #[serde(default)]
    #[serde(rename = "announce-list")]
    #[serde(deserialize_with = "announce_list_deserialize")]
    pub announce_list: Option<Vec<Vec<Url>>>,

    // (optional) the creation time of the torrent, in standard UNIX epoch format.
    #[serde(default)]
    #[serde(rename = "creation date")]
    pub creation_date: Option<i64>,

    // (optional) free-form textual comments of the author (string).
    #[serde(rename = "comment")]
    pub comment: Option<String>,

    // (optional) name and version of the program used to create the .torrent (string).
    #[serde(default)]
    #[serde(rename = "created by")]
    pub created_by: Option<String>,

}

impl MetaInfo {

    pub fn new<P: AsRef<std::path::Path>>(path: P) -> Result<MetaInfo, MetaInfoError> {

        if path.as_ref().extension().unwrap_or_default() != "torrent" {
            return Err(MetaInfoError::InvalidExtension);
        }

        let raw = std::fs::read(path)?;
        let mut metainfo: MetaInfo = bencode::decode_bytes(&raw)?;

        if metainfo.info.pieces.len() % 20 != 0 || metainfo.info.pieces.is_empty() {
            return Err(MetaInfoError::InvalidPiecesLength);
        }

        // Info-hash is SHA-1 of the exact bytes of the `info` value as they
        // appeared in the source file, not a re-encoding of the
        // deserialized struct — re-encoding would silently diverge from
        // the original on key order or any field serde doesn't round-trip
        // byte-for-byte, producing an info-hash no peer or tracker agrees
        // with.
        let span = bencode::top_level_value_span(&raw, b"info").ok_or(MetaInfoError::MissingInfoSpan)?;
        let mut hasher = sha1::Sha1::new();
        hasher.update(&raw[span]);
        metainfo.info_hash = hasher.finalize().into();

        tracing::debug!("metainfo created: {:#?}", metainfo);
        Ok(metainfo)
    }

    pub fn piece_hashes(&self) -> Vec<[u8; 20]> {
        self.info.pieces
            .chunks_exact(20)
            // Safe: length was checked to be a multiple of 20 in `new`.
            .map(|c| c.try_into().unwrap())
            .collect()
    }

    pub fn piece_len(&self) -> usize { self.info.piece_length as usize }

    pub fn num_pieces(&self) -> u32 { self.info.pieces.len() as u32 / 20 }

    pub fn is_multi_file(&self) -> bool { self.info.files.is_some() }

    pub fn single_file_len(&self) -> Option<u64> { self.info.length }

    pub fn total_len(&self) -> u64 {
        if let Some(files) = &self.info.files {
            files.iter().map(|f| f.length).sum()
        } else {
            self.info.length.unwrap_or(0)
        }
    }

    pub fn info_hash(&self) -> [u8; 20] { self.info_hash }

    pub fn name(&self) -> &str { &self.info.name }

    pub fn trackers(&self) -> Vec<Vec<Url>> {
        // If announce_list is present, we use that.
        if let Some(announce_list) = self.announce_list.clone() {
            let mut tiers = Vec::new();
            for mut tier in announce_list {
                tier.shuffle(&mut rand::thread_rng());
                tiers.push(tier);
            }
            tiers
        } else {
            vec![vec![self.announce.clone()]]
        }
    }

    pub fn files(&self) -> Vec<FileInfo> {
        if let Some(files) = &self.info.files {
            let mut offset = 0;
            files.iter().map(|f| {
                let file_info = FileInfo {
                    path: f.path.clone(),
                    length: f.length as usize,
                    offset,
                    md5sum: f.md5sum.clone(),
                };
                offset += f.length as usize;
                file_info
            }).collect()
        } else {
            vec![FileInfo {
                path: self.info.name.clone().into(),
                length: self.info.length.unwrap_or(0) as usize,
                offset: 0,
                md5sum: None,
            }]
        }
    }

    // Formatting methods.

    pub fn creation_date_fmt(&self) -> Option<String> {
        self.creation_date.map(|v| {
            chrono::DateTime::from_timestamp(v, 0)
                .map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "Invalid date".to_string())
        })
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    pub fn size_fmt(&self) -> String {
        format_size(self.total_len())
    }
}

fn format_size(bytes: u64) -> String {
    let mut size = bytes as f64;
    let mut unit = "B";
    if size > 1024.0 {
        size /= 1024.0;
        unit = "KiB";
    }
    if size > 1024.0 {
        size /= 1024.0;
        unit = "MiB";
    }
    if size > 1024.0 {
        size /= 1024.0;
        unit = "GiB";
    }
    if size > 1024.0 {
        size /= 1024.0;
        unit = "TiB";
    }
    format!("{:.2} {}", size, unit)
}

impl std::fmt::Debug for MetaInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaInfo")
            .field("announce", &self.announce.as_str())
            .field("info", &self.info)
            .field("info_hash", &self.info_hash_hex())
            .field("encoding", &self.encoding)
            .field("announce_list", &self.announce_list.as_ref().map(|v|
                v.iter().map(|v|
                    v.iter().map(|v|
                        v.as_str()
                    ).collect()
                ).collect::<Vec<Vec<&str>>>()
            ))
            .field("creation_date", &self.creation_date_fmt())
            .field("comment", &self.comment)
            .field("created_by", &self.created_by)
            .finish()
    }
}

// The pieces field is large and not useful in logs, so Debug is hand-rolled.
impl std::fmt::Debug for Info {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Info")
            .field("name", &self.name)
            .field("num pieces", &(self.pieces.len() / 20))
            .field("piece_length", &self.piece_length)
            .field("md5sum", &self.md5sum)
            .field("length", &self.length)
            .field("files", &self.files)
            .field("private", &self.private)
            .field("root_hash", &self.root_hash)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn bencode_str(s: &str) -> Vec<u8> {
        let mut v = format!("{}:", s.len()).into_bytes();
        v.extend_from_slice(s.as_bytes());
        v
    }

    fn bencode_bytes(b: &[u8]) -> Vec<u8> {
        let mut v = format!("{}:", b.len()).into_bytes();
        v.extend_from_slice(b);
        v
    }

    fn bencode_int(i: i64) -> Vec<u8> {
        format!("i{}e", i).into_bytes()
    }

    /// Builds a minimal single-file `.torrent` as raw bytes, returning it
    /// alongside the SHA-1 of its `info` dict (the expected info-hash).
    fn single_file_torrent() -> (Vec<u8>, [u8; 20]) {
        let piece_data = b"hello world";
        let mut hasher = sha1::Sha1::new();
        hasher.update(piece_data);
        let piece_hash: [u8; 20] = hasher.finalize().into();

        let mut info = Vec::new();
        info.push(b'd');
        info.extend(bencode_str("length"));
        info.extend(bencode_int(piece_data.len() as i64));
        info.extend(bencode_str("name"));
        info.extend(bencode_str("a.txt"));
        info.extend(bencode_str("piece length"));
        info.extend(bencode_int(piece_data.len() as i64));
        info.extend(bencode_str("pieces"));
        info.extend(bencode_bytes(&piece_hash));
        info.push(b'e');

        let mut hasher = sha1::Sha1::new();
        hasher.update(&info);
        let info_hash: [u8; 20] = hasher.finalize().into();

        let mut top = Vec::new();
        top.push(b'd');
        top.extend(bencode_str("announce"));
        top.extend(bencode_str("http://example.com/announce"));
        top.extend(bencode_str("info"));
        top.extend(info);
        top.push(b'e');

        (top, info_hash)
    }

    fn write_torrent(bytes: &[u8]) -> tempfile::TempPath {
        let mut file = tempfile::Builder::new().suffix(".torrent").tempfile().unwrap();
        file.write_all(bytes).unwrap();
        file.into_temp_path()
    }

    #[test]
    fn parses_single_file_metainfo_and_hashes_the_raw_info_span() {
        let (bytes, expected_hash) = single_file_torrent();
        let path = write_torrent(&bytes);

        let metainfo = MetaInfo::new(&path).unwrap();
        assert!(!metainfo.is_multi_file());
        assert_eq!(metainfo.num_pieces(), 1);
        assert_eq!(metainfo.total_len(), 11);
        assert_eq!(metainfo.info_hash(), expected_hash);
    }

    #[test]
    fn rejects_a_non_torrent_extension() {
        let mut file = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
        file.write_all(b"d4:infod6:pieces0:ee").unwrap();
        let path = file.into_temp_path();
        assert!(matches!(MetaInfo::new(&path), Err(MetaInfoError::InvalidExtension)));
    }
}
