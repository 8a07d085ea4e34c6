//! NDJSON segment files.
//!
//! Segment `N` holds the entries whose index lies in `[N * SPAN, (N + 1) * SPAN)`
//! and is named after its first index. Only the newest segment is open for
//! appends; purging drops whole files and truncation rewrites one file.

use crate::types::ClusterEntry;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use super::meta::invalid_data;

/// Index span covered by one segment file.
pub const SEGMENT_SPAN: u64 = 1024;

struct OpenSegment {
    start: u64,
    writer: BufWriter<File>,
}

/// The set of segment files under one directory.
pub struct SegmentSet {
    dir: PathBuf,
    open: Option<OpenSegment>,
}

impl SegmentSet {
    pub fn new(dir: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, open: None })
    }

    pub fn start_of(index: u64) -> u64 {
        index - index % SEGMENT_SPAN
    }

    fn file_name(start: u64) -> String {
        format!("{:020}.ndjson", start)
    }

    fn parse_name(name: &str) -> Option<u64> {
        name.strip_suffix(".ndjson")?.parse().ok()
    }

    fn path(&self, start: u64) -> PathBuf {
        self.dir.join(Self::file_name(start))
    }

    /// Segment files sorted by first index.
    pub fn list(&self) -> io::Result<Vec<(u64, PathBuf)>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let start = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(Self::parse_name);
            if let Some(start) = start {
                found.push((start, path));
            }
        }
        found.sort_by_key(|(start, _)| *start);
        Ok(found)
    }

    /// Read every segment into an index-ordered map.
    pub fn load(&self) -> io::Result<BTreeMap<u64, ClusterEntry>> {
        let mut entries = BTreeMap::new();
        for (_, path) in self.list()? {
            read_segment(&path, &mut entries)?;
        }
        Ok(entries)
    }

    /// Append entries, rolling to a new file at each span boundary.
    pub fn append<'a, I>(&mut self, entries: I) -> io::Result<()>
    where
        I: IntoIterator<Item = &'a ClusterEntry>,
    {
        for entry in entries {
            let start = Self::start_of(entry.log_id.index);
            if self.open.as_ref().map(|s| s.start) != Some(start) {
                self.roll_to(start)?;
            }
            let line = serde_json::to_string(entry).map_err(invalid_data)?;
            if let Some(open) = self.open.as_mut() {
                writeln!(open.writer, "{}", line)?;
            }
        }
        self.sync()
    }

    fn roll_to(&mut self, start: u64) -> io::Result<()> {
        self.sync()?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(start))?;
        self.open = Some(OpenSegment {
            start,
            writer: BufWriter::new(file),
        });
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        if let Some(open) = self.open.as_mut() {
            open.writer.flush()?;
            open.writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// Delete every segment whose whole span is at or below `index`.
    pub fn drop_through(&mut self, index: u64) -> io::Result<()> {
        for (start, path) in self.list()? {
            if start + SEGMENT_SPAN - 1 > index {
                continue;
            }
            if self.open.as_ref().map(|s| s.start) == Some(start) {
                self.open = None;
            }
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Drop everything from `index` on; `kept` are the surviving entries of
    /// the segment containing `index`.
    pub fn cut_at(&mut self, index: u64, kept: &[ClusterEntry]) -> io::Result<()> {
        self.open = None;
        let boundary = Self::start_of(index);
        for (start, path) in self.list()? {
            if start > boundary || (start == boundary && kept.is_empty()) {
                fs::remove_file(path)?;
            }
        }
        if !kept.is_empty() {
            self.rewrite(boundary, kept)?;
        }
        Ok(())
    }

    fn rewrite(&mut self, start: u64, entries: &[ClusterEntry]) -> io::Result<()> {
        let path = self.path(start);
        let temp = path.with_extension("ndjson.tmp");
        {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&temp)?;
            let mut writer = BufWriter::new(file);
            for entry in entries {
                let line = serde_json::to_string(entry).map_err(invalid_data)?;
                writeln!(writer, "{}", line)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&temp, &path)
    }
}

fn read_segment(path: &Path, into: &mut BTreeMap<u64, ClusterEntry>) -> io::Result<()> {
    let reader = BufReader::new(File::open(path)?);
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: ClusterEntry = serde_json::from_str(&line).map_err(invalid_data)?;
        into.insert(entry.log_id.index, entry);
    }
    Ok(())
}
