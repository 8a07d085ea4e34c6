//! Vote and log metadata files.

use crate::types::{ClusterLogId, ClusterVote};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

/// Log bookkeeping persisted beside the segments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogMeta {
    pub last_purged: Option<ClusterLogId>,
    pub committed: Option<ClusterLogId>,
}

pub fn invalid_data<E>(e: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Read a JSON document, `None` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let reader = BufReader::new(File::open(path)?);
    serde_json::from_reader(reader).map(Some).map_err(invalid_data)
}

/// Replace a JSON document atomically (write temp, fsync, rename).
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let temp = path.with_extension("json.tmp");
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&temp)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, value).map_err(invalid_data)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    fs::rename(&temp, path)
}

pub fn load_vote(dir: &Path) -> io::Result<Option<ClusterVote>> {
    read_json(&dir.join("vote.json"))
}

pub fn save_vote(dir: &Path, vote: &ClusterVote) -> io::Result<()> {
    write_json(&dir.join("vote.json"), vote)
}

pub fn load_meta(dir: &Path) -> io::Result<LogMeta> {
    Ok(read_json(&dir.join("meta.json"))?.unwrap_or_default())
}

pub fn save_meta(dir: &Path, meta: &LogMeta) -> io::Result<()> {
    write_json(&dir.join("meta.json"), meta)
}
