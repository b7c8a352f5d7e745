use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Buffered I/O over one backing file plus a single-block replay buffer.
///
/// The replay buffer remembers the payload of the most recent
/// [`read_next()`](Self::read_next) or [`write_next()`](Self::write_next),
/// so the transfer engine can retransmit a lost block without touching the
/// file again. It holds exactly one block: each successful call overwrites
/// it, and [`reset()`](Self::reset) empties it once the block is
/// acknowledged.
#[derive(Debug)]
pub struct FileBuffer {
    io: Io,
    path: PathBuf,
    size: Option<u64>,
    replay: Vec<u8>,
}

/// The buffered side is picked by the request type: read requests read,
/// write requests write, never both.
#[derive(Debug)]
enum Io {
    Reader(BufReader<File>),
    Writer(BufWriter<File>),
}

impl FileBuffer {
    /// Wraps `file` for a read request. `path` is the full resolved path
    /// of the backing file, used by [`matches()`](Self::matches).
    pub fn reading(file: File, path: PathBuf) -> std::io::Result<Self> {
        let size = file.metadata()?.len();
        Ok(Self {
            io: Io::Reader(BufReader::new(file)),
            path,
            size: Some(size),
            replay: Vec::new(),
        })
    }

    /// Wraps `file` for a write request.
    pub fn writing(file: File, path: PathBuf) -> Self {
        Self {
            io: Io::Writer(BufWriter::new(file)),
            path,
            size: None,
            replay: Vec::new(),
        }
    }

    /// Reads the next block, filling as much of `buf` as the file allows.
    ///
    /// Keeps reading until `buf` is full or the file ends, so a return
    /// count below `buf.len()` means end of file: the caller sends that
    /// short block as the final one. A return of zero means the previous
    /// block ended exactly at the file boundary and an empty final block
    /// is due.
    ///
    /// On any non-zero read the replay buffer is overwritten with exactly
    /// the bytes placed in `buf`.
    pub fn read_next(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let Io::Reader(reader) = &mut self.io else {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "file view is open for writing",
            ));
        };

        let mut read = 0;
        while read < buf.len() {
            match reader.read(&mut buf[read..]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        if read > 0 {
            self.replay.clear();
            self.replay.extend_from_slice(&buf[..read]);
        }
        Ok(read)
    }

    /// Writes one received block and overwrites the replay buffer with it.
    pub fn write_next(&mut self, data: &[u8]) -> std::io::Result<usize> {
        let Io::Writer(writer) = &mut self.io else {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "file view is open for reading",
            ));
        };

        writer.write_all(data)?;
        if !data.is_empty() {
            self.replay.clear();
            self.replay.extend_from_slice(data);
        }
        Ok(data.len())
    }

    /// Copies the replay buffer into `buf`, returning the number of bytes
    /// copied. Pass a `buf` of at least [`replay_len()`](Self::replay_len)
    /// bytes to get the whole block.
    pub fn replay(&self, buf: &mut [u8]) -> usize {
        let n = self.replay.len().min(buf.len());
        buf[..n].copy_from_slice(&self.replay[..n]);
        n
    }

    /// The payload held for retransmission.
    pub fn replay_bytes(&self) -> &[u8] {
        &self.replay
    }

    /// Length of the block held for retransmission.
    pub fn replay_len(&self) -> usize {
        self.replay.len()
    }

    /// Empties the replay buffer. Call once the block it holds has been
    /// acknowledged.
    pub fn reset(&mut self) {
        self.replay.clear();
    }

    /// Flushes pending writes to the backing file and empties the replay
    /// buffer. Closing the file itself is the owner's job.
    pub fn close(&mut self) -> std::io::Result<()> {
        if let Io::Writer(writer) = &mut self.io {
            writer.flush()?;
        }
        self.replay.clear();
        Ok(())
    }

    /// Rewinds the backing file to its start and discards buffered state,
    /// making the view reusable for a fresh transfer of the same file.
    pub fn rewind(&mut self) -> std::io::Result<()> {
        self.replay.clear();
        match &mut self.io {
            Io::Reader(reader) => {
                reader.seek(SeekFrom::Start(0))?;
            }
            Io::Writer(writer) => {
                writer.flush()?;
                writer.seek(SeekFrom::Start(0))?;
            }
        }
        Ok(())
    }

    /// Whether this view's backing file is `path`.
    ///
    /// Compares full paths. Both sides must come through the same
    /// resolution (the server joins request filenames to its root
    /// directory), so equal paths mean the same file.
    pub fn matches(&self, path: &Path) -> bool {
        self.path == path
    }

    /// The full resolved path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the backing file in bytes, known for read views only.
    pub fn size(&self) -> Option<u64> {
        self.size
    }
}
