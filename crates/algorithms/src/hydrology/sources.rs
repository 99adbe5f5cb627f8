//! Disk-backed list of source cells
//!
//! A source is a cell that no neighbour drains into. The direction phase
//! appends one fixed-size record per source; the accumulation phase reads the
//! records back in chunks. Records are `(x: i32, y: i32)`, little endian.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Seek, SeekFrom};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flowtile_core::{Error, Result};
use tempfile::NamedTempFile;

/// Size of one record in bytes
pub const RECORD_BYTES: u64 = 8;

/// Range of records handed to one accumulation worker at a time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Index of the first record
    pub offset: u64,
    /// Number of records
    pub len: usize,
}

fn temp_file(dir: Option<&Path>) -> Result<NamedTempFile> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("flowtile-sources-").suffix(".bin");
    let file = match dir {
        Some(dir) => builder.tempfile_in(dir)?,
        None => builder.tempfile()?,
    };
    Ok(file)
}

/// Append-only writer of source records
#[derive(Debug)]
pub struct SourceWriter {
    out: BufWriter<NamedTempFile>,
    count: u64,
}

impl SourceWriter {
    /// Start a new temporary sources file in `dir`, or the system temp dir
    pub fn create(dir: Option<&Path>) -> Result<Self> {
        Ok(Self {
            out: BufWriter::new(temp_file(dir)?),
            count: 0,
        })
    }

    pub fn push(&mut self, x: usize, y: usize) -> Result<()> {
        self.out.write_i32::<LittleEndian>(coord(x)?)?;
        self.out.write_i32::<LittleEndian>(coord(y)?)?;
        self.count += 1;
        Ok(())
    }

    /// Records written so far
    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Close the writer and make the records readable
    pub fn finish(self) -> Result<SourceFile> {
        let file = self.out.into_inner().map_err(|e| e.into_error())?;
        Ok(SourceFile {
            file,
            count: self.count,
        })
    }
}

fn coord(v: usize) -> Result<i32> {
    i32::try_from(v).map_err(|_| Error::InvalidSourceFile(format!("coordinate {} exceeds i32", v)))
}

/// Finished sources file. The file is deleted when this value is dropped.
#[derive(Debug)]
pub struct SourceFile {
    file: NamedTempFile,
    count: u64,
}

impl SourceFile {
    /// Join per-worker files, in order, into one file
    pub fn concat(parts: Vec<SourceFile>, dir: Option<&Path>) -> Result<Self> {
        let mut writer = SourceWriter::create(dir)?;
        for part in parts {
            let mut reader = part.file.reopen()?;
            let copied = io::copy(&mut reader, &mut writer.out)?;
            if copied != part.count * RECORD_BYTES {
                return Err(Error::InvalidSourceFile(format!(
                    "expected {} bytes, copied {}",
                    part.count * RECORD_BYTES,
                    copied
                )));
            }
            writer.count += part.count;
        }
        writer.finish()
    }

    /// Number of records
    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Split the records into chunks of at most `chunk_size` records
    pub fn chunks(&self, chunk_size: usize) -> Vec<Chunk> {
        let size = chunk_size.max(1) as u64;
        (0..self.count)
            .step_by(size as usize)
            .map(|offset| Chunk {
                offset,
                len: size.min(self.count - offset) as usize,
            })
            .collect()
    }

    /// Read the records of one chunk.
    ///
    /// Every call opens its own handle, so workers can read concurrently.
    pub fn read_chunk(&self, chunk: Chunk) -> Result<Vec<(usize, usize)>> {
        if chunk.offset + chunk.len as u64 > self.count {
            return Err(Error::InvalidSourceFile(format!(
                "chunk {}..{} past end of {} records",
                chunk.offset,
                chunk.offset + chunk.len as u64,
                self.count
            )));
        }
        let mut file: File = self.file.reopen()?;
        file.seek(SeekFrom::Start(chunk.offset * RECORD_BYTES))?;
        let mut reader = BufReader::new(file);

        let mut records = Vec::with_capacity(chunk.len);
        for _ in 0..chunk.len {
            let x = reader.read_i32::<LittleEndian>()?;
            let y = reader.read_i32::<LittleEndian>()?;
            if x < 0 || y < 0 {
                return Err(Error::InvalidSourceFile(format!("negative coordinate ({}, {})", x, y)));
            }
            records.push((x as usize, y as usize));
        }
        Ok(records)
    }

    /// Every record, in file order
    pub fn read_all(&self) -> Result<Vec<(usize, usize)>> {
        self.read_chunk(Chunk {
            offset: 0,
            len: self.count as usize,
        })
    }
}
