//! Durable journal of raw client frames for store-and-forward mode.
//!
//! A journal file is the exact byte sequence the client sent: each frame's
//! 4-byte length prefix followed by its payload, in arrival order. Replaying
//! a journal to a relay is therefore indistinguishable from having forwarded
//! the connection directly.

use bytes::Bytes;
use rand::Rng;
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read},
    path::{Path, PathBuf},
};
use std::io::Write as _;
use tracing::debug;

use crate::codec::PREFIX_LEN;

const NAME_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const NAME_LEN: usize = 8;

/// An open journal file. Exactly one owner at a time: the ingesting
/// connection hands the whole value to the replay task when it finishes.
pub struct Journal {
    file: File,
    path: PathBuf,
}

impl Journal {
    /// Create a uniquely-named journal file under `dir`.
    pub fn create(dir: &Path) -> io::Result<Journal> {
        fs::create_dir_all(dir)?;
        let mut rng = rand::thread_rng();
        loop {
            let name: String = (0..NAME_LEN)
                .map(|_| NAME_CHARS[rng.gen_range(0..NAME_CHARS.len())] as char)
                .collect();
            let path = dir.join(format!("journal.{}", name));
            match OpenOptions::new().create_new(true).write(true).open(&path) {
                Ok(file) => {
                    debug!("created journal file {}", path.display());
                    return Ok(Journal { file, path });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one frame exactly as received, length prefix included.
    pub fn append_frame(&mut self, payload: &[u8]) -> io::Result<()> {
        self.file.write_all(&(payload.len() as u32).to_be_bytes())?;
        self.file.write_all(payload)
    }

    /// Flush the journal to stable storage.
    pub fn sync(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }

    /// Open a second handle reading the journal from the beginning.
    pub fn open_reader(&self, max_frame: usize) -> io::Result<JournalReader> {
        Ok(JournalReader {
            file: File::open(&self.path)?,
            max_frame,
        })
    }

    /// Remove the backing file after a successful replay.
    pub fn remove(self) -> io::Result<()> {
        let Journal { file, path } = self;
        drop(file);
        debug!("removing journal file {}", path.display());
        fs::remove_file(&path)
    }
}

/// Sequential frame reader over a journal file.
pub struct JournalReader {
    file: File,
    max_frame: usize,
}

impl JournalReader {
    /// The next frame payload, or `None` at a clean end of file. A journal
    /// that ends mid-frame is corrupt and reported as an error.
    pub fn next_frame(&mut self) -> io::Result<Option<Bytes>> {
        let mut prefix = [0u8; PREFIX_LEN];
        match read_full(&mut self.file, &mut prefix)? {
            0 => return Ok(None),
            PREFIX_LEN => {}
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated frame length in journal",
                ))
            }
        }

        let len = u32::from_be_bytes(prefix) as usize;
        if len > self.max_frame {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "oversized frame in journal",
            ));
        }

        let mut payload = vec![0u8; len];
        self.file.read_exact(&mut payload)?;
        Ok(Some(Bytes::from(payload)))
    }
}

fn read_full(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_round_trip_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = Journal::create(dir.path()).unwrap();
        let frames: Vec<&[u8]> = vec![b"first", b"", b"third frame"];
        for frame in &frames {
            journal.append_frame(frame).unwrap();
        }
        journal.sync().unwrap();

        let mut reader = journal.open_reader(1024).unwrap();
        for frame in &frames {
            assert_eq!(&reader.next_frame().unwrap().unwrap()[..], *frame);
        }
        assert!(reader.next_frame().unwrap().is_none());
    }

    #[test]
    fn file_contents_are_exact_wire_frames() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = Journal::create(dir.path()).unwrap();
        journal.append_frame(b"abc").unwrap();
        journal.sync().unwrap();

        let contents = fs::read(journal.path()).unwrap();
        assert_eq!(contents, [0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn truncated_journal_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = Journal::create(dir.path()).unwrap();
        journal.append_frame(b"abc").unwrap();

        // Chop the last payload byte off.
        let contents = fs::read(journal.path()).unwrap();
        fs::write(journal.path(), &contents[..contents.len() - 1]).unwrap();

        let mut reader = journal.open_reader(1024).unwrap();
        assert!(reader.next_frame().is_err());
    }

    #[test]
    fn remove_deletes_the_backing_file() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::create(dir.path()).unwrap();
        let path = journal.path().to_path_buf();
        assert!(path.exists());
        journal.remove().unwrap();
        assert!(!path.exists());
    }
}
