// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Gzip-compressed JSON Lines writer.
//!
//! Records are encoded and compressed as they arrive, so memory stays bounded
//! by the encoder window regardless of how many rows a harvest produces.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;

/// Destination of the compressed stream.
pub trait ArchiveSink: Write {
    /// Pushes everything written so far to durable storage.
    fn sync(&mut self) -> io::Result<()>;
}

impl ArchiveSink for BufWriter<File> {
    fn sync(&mut self) -> io::Result<()> {
        self.flush()?;
        self.get_ref().sync_all()
    }
}

impl ArchiveSink for Vec<u8> {
    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct StreamingArchiveWriter<S: ArchiveSink> {
    encoder: GzEncoder<S>,
    records: u64,
    line: Vec<u8>,
}

impl StreamingArchiveWriter<BufWriter<File>> {
    /// Creates (or truncates) `path` and writes the archive into it.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<S: ArchiveSink> StreamingArchiveWriter<S> {
    pub fn new(sink: S) -> Self {
        Self {
            encoder: GzEncoder::new(sink, Compression::default()),
            records: 0,
            line: Vec::with_capacity(1024),
        }
    }

    /// Appends `record` as one line of compact JSON.
    pub fn write(&mut self, record: &Value) -> io::Result<()> {
        self.line.clear();
        serde_json::to_writer(&mut self.line, record)?;
        self.line.push(b'\n');
        self.encoder.write_all(&self.line)?;
        self.records += 1;
        Ok(())
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    /// Writes the gzip trailer, syncs the sink and returns it with the number
    /// of records written.
    pub fn close(self) -> io::Result<(S, u64)> {
        let mut sink = self.encoder.finish()?;
        sink.sync()?;
        Ok((sink, self.records))
    }
}

/// Scratch directory holding the archives of one run. Removed on drop.
pub struct ScratchDir {
    dir: tempfile::TempDir,
}

impl ScratchDir {
    pub fn new_in(parent: impl AsRef<Path>) -> io::Result<Self> {
        std::fs::create_dir_all(parent.as_ref())?;
        let dir = tempfile::Builder::new()
            .prefix("pdb-snapshot-")
            .tempdir_in(parent)?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}
