//! Length-prefixed snapshot files with a crc32 trailer.
//!
//! Layout of `db.data` inside the snapshot directory:
//!
//! ```text
//! [u32 len][start] [u32 len][end] [u64 rows]
//! rows * ( [u32 len][key] [u32 len][u64 expires_at || value] )
//! [u32 crc32 of everything above]
//! ```

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use anyhow::{bail, Context};

use crate::mem::Row;

const SNAPSHOT_FILE: &str = "db.data";

pub(crate) struct Loaded {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
    pub rows: Vec<(Vec<u8>, Row)>,
}

struct ChecksumWriter<W: Write> {
    inner: W,
    hasher: crc32fast::Hasher,
}

impl<W: Write> ChecksumWriter<W> {
    fn put(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.hasher.update(data);
        self.inner.write_all(data)?;
        Ok(())
    }

    fn put_chunk(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.put(&(data.len() as u32).to_be_bytes())?;
        self.put(data)
    }
}

pub(crate) fn write<'a>(
    path: &Path,
    start: &[u8],
    end: &[u8],
    rows: impl Iterator<Item = (&'a [u8], &'a Row)>,
) -> anyhow::Result<()> {
    fs::create_dir_all(path).context("create snapshot dir")?;
    let file = File::create(path.join(SNAPSHOT_FILE)).context("create snapshot file")?;
    let mut out = ChecksumWriter {
        inner: BufWriter::new(file),
        hasher: crc32fast::Hasher::new(),
    };

    out.put_chunk(start)?;
    out.put_chunk(end)?;

    let rows: Vec<_> = rows.collect();
    out.put(&(rows.len() as u64).to_be_bytes())?;
    for (key, row) in rows {
        out.put_chunk(key)?;
        let mut record = Vec::with_capacity(8 + row.value.len());
        record.extend_from_slice(&row.expires_at.to_be_bytes());
        record.extend_from_slice(&row.value);
        out.put_chunk(&record)?;
    }

    let crc = out.hasher.finalize();
    out.inner.write_all(&crc.to_be_bytes())?;
    let mut file = out.inner.into_inner().context("flush snapshot")?;
    file.sync_all().context("sync snapshot")?;
    Ok(())
}

struct ChecksumReader<R: Read> {
    inner: R,
    hasher: crc32fast::Hasher,
}

impl<R: Read> ChecksumReader<R> {
    fn take(&mut self, len: usize) -> anyhow::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf)?;
        self.hasher.update(&buf);
        Ok(buf)
    }

    fn take_chunk(&mut self) -> anyhow::Result<Vec<u8>> {
        let len = u32::from_be_bytes(self.take(4)?.try_into().unwrap()) as usize;
        self.take(len)
    }
}

pub(crate) fn read(path: &Path) -> anyhow::Result<Loaded> {
    let file = File::open(path.join(SNAPSHOT_FILE)).context("open snapshot file")?;
    let mut input = ChecksumReader {
        inner: BufReader::new(file),
        hasher: crc32fast::Hasher::new(),
    };

    let start = input.take_chunk()?;
    let end = input.take_chunk()?;
    let count = u64::from_be_bytes(input.take(8)?.try_into().unwrap());

    let mut rows = Vec::with_capacity(count.min(1 << 20) as usize);
    for _ in 0..count {
        let key = input.take_chunk()?;
        let record = input.take_chunk()?;
        if record.len() < 8 {
            bail!("snapshot row for key {key:?} is truncated");
        }
        let expires_at = u64::from_be_bytes(record[..8].try_into().unwrap());
        rows.push((
            key,
            Row {
                value: record[8..].to_vec(),
                expires_at,
            },
        ));
    }

    let expected = input.hasher.finalize();
    let mut trailer = [0u8; 4];
    input.inner.read_exact(&mut trailer).context("read snapshot crc")?;
    let actual = u32::from_be_bytes(trailer);
    if expected != actual {
        bail!("snapshot checksum mismatch: stored {actual:#x}, computed {expected:#x}");
    }

    Ok(Loaded { start, end, rows })
}
