//! Durable storage for Raft node metadata and the log.
//!
//! Each node owns a single metadata file `md_<id>.dat` with a fixed layout:
//!
//! ```text
//! Offset   Size   Field
//! 0        8      current term          (little-endian u64)
//! 8        8      voted for             (little-endian u64, 0 = none)
//! 16       8      log length            (little-endian u64)
//! 24       4072   reserved (zero)
//! PAGE_SIZE + i * ENTRY_SIZE, for i in 0..log length:
//!   +0     8      entry term            (little-endian u64)
//!   +8     8      command length L      (little-endian u64, L <= 112)
//!   +16    L      command bytes
//!   +16+L  rest   padding
//! ```
//!
//! Entry slots are fixed-size, so the slot position encodes the entry index
//! and the whole log can be rewritten from any index with a single seek. A
//! truncated log does not rewrite the abandoned slots; the shrunk log length
//! in the header shadows them, and restore never reads past it.

use std::fs::{File, OpenOptions};
use std::io::{Read as _, Seek as _, SeekFrom, Write as _};
use std::path::Path;

use crate::errdata;
use crate::error::Result;
use crate::raft::{Entry, Index, NodeID, Term};

/// The size of the metadata file header page.
pub const PAGE_SIZE: usize = 4096;
/// The size of an entry slot, header included.
pub const ENTRY_SIZE: usize = 128;
/// The size of an entry slot header (term and command length).
pub const ENTRY_HEADER: usize = 16;
/// The maximum size of a single command, such that a slot header plus command
/// fits in a slot.
pub const MAX_COMMAND_BYTES: usize = ENTRY_SIZE - ENTRY_HEADER;

/// Durable storage for a node's term, vote, and log.
///
/// persist() is the only durability point: it must not return until the given
/// state is on stable storage. Callers invoke it before releasing control at
/// every point that must survive a crash (term bumps, vote grants, appends,
/// truncations).
pub trait Store: Send {
    /// Restores the persisted term, vote, and log entries, or None if the
    /// store has never been persisted to (or only a partial header made it to
    /// disk before a crash, which is equivalent). Errors are fatal.
    fn restore(&mut self) -> Result<Option<(Term, Option<NodeID>, Vec<Entry>)>>;

    /// Persists the term, vote, and log length, rewriting entry slots from
    /// write_from onward if given, and syncs to stable storage before
    /// returning. Errors are fatal.
    fn persist(
        &mut self,
        term: Term,
        vote: Option<NodeID>,
        entries: &[Entry],
        write_from: Option<usize>,
    ) -> Result<()>;
}

/// A file-backed store using the fixed page layout above.
pub struct FileStore {
    file: File,
}

impl FileStore {
    /// Creates or opens the metadata file for the given node under dir.
    pub fn new(dir: &Path, id: NodeID) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create(true);
        #[cfg(unix)]
        std::os::unix::fs::OpenOptionsExt::mode(&mut opts, 0o755);
        let file = opts.open(dir.join(format!("md_{id}.dat")))?;
        Ok(Self { file })
    }
}

impl Store for FileStore {
    fn restore(&mut self) -> Result<Option<(Term, Option<NodeID>, Vec<Entry>)>> {
        // A short header means either a fresh file or a crash mid-rewrite of
        // the first persist. Both restore as empty; a re-initialized log is
        // exactly what the node had before that persist.
        if self.file.metadata()?.len() < PAGE_SIZE as u64 {
            return Ok(None);
        }

        let mut page = [0; PAGE_SIZE];
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(&mut page)?;

        let term = u64::from_le_bytes(page[0..8].try_into().expect("invalid slice"));
        let vote = match u64::from_le_bytes(page[8..16].try_into().expect("invalid slice")) {
            0 => None,
            id => Some(id),
        };
        let length = u64::from_le_bytes(page[16..24].try_into().expect("invalid slice"));

        // Short entry reads are corruption, unlike short header reads: the
        // header's log length is only written after the entries it covers.
        let mut entries = Vec::with_capacity(length as usize);
        let mut slot = [0; ENTRY_SIZE];
        for index in 0..length {
            self.file.read_exact(&mut slot)?;
            let term = u64::from_le_bytes(slot[0..8].try_into().expect("invalid slice"));
            let size = u64::from_le_bytes(slot[8..16].try_into().expect("invalid slice")) as usize;
            if size > MAX_COMMAND_BYTES {
                return errdata!("entry {index} command length {size} exceeds slot");
            }
            let command = slot[ENTRY_HEADER..ENTRY_HEADER + size].to_vec();
            entries.push(Entry { index: index as Index, term, command });
        }

        Ok(Some((term, vote, entries)))
    }

    fn persist(
        &mut self,
        term: Term,
        vote: Option<NodeID>,
        entries: &[Entry],
        write_from: Option<usize>,
    ) -> Result<()> {
        let mut page = [0; PAGE_SIZE];
        page[0..8].copy_from_slice(&term.to_le_bytes());
        page[8..16].copy_from_slice(&vote.unwrap_or(0).to_le_bytes());
        page[16..24].copy_from_slice(&(entries.len() as u64).to_le_bytes());
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&page)?;

        if let Some(from) = write_from {
            self.file.seek(SeekFrom::Start((PAGE_SIZE + ENTRY_SIZE * from) as u64))?;
            let mut writer = std::io::BufWriter::new(&self.file);
            for entry in &entries[from..] {
                assert!(
                    entry.command.len() <= MAX_COMMAND_BYTES,
                    "command length {} exceeds entry slot",
                    entry.command.len()
                );
                let mut slot = [0; ENTRY_SIZE];
                slot[0..8].copy_from_slice(&entry.term.to_le_bytes());
                slot[8..16].copy_from_slice(&(entry.command.len() as u64).to_le_bytes());
                slot[ENTRY_HEADER..ENTRY_HEADER + entry.command.len()]
                    .copy_from_slice(&entry.command);
                writer.write_all(&slot)?;
            }
            writer.flush()?;
        }

        self.file.sync_all()?;
        Ok(())
    }
}

/// An in-memory store for testing. Clones share the same backing state, which
/// allows tests to reopen a "restarted" store.
#[derive(Clone, Default)]
pub struct Memory {
    inner: std::sync::Arc<std::sync::Mutex<Option<(Term, Option<NodeID>, Vec<Entry>)>>>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for Memory {
    fn restore(&mut self) -> Result<Option<(Term, Option<NodeID>, Vec<Entry>)>> {
        Ok(self.inner.lock().expect("lock poisoned").clone())
    }

    fn persist(
        &mut self,
        term: Term,
        vote: Option<NodeID>,
        entries: &[Entry],
        _write_from: Option<usize>,
    ) -> Result<()> {
        for entry in entries {
            assert!(
                entry.command.len() <= MAX_COMMAND_BYTES,
                "command length {} exceeds entry slot",
                entry.command.len()
            );
        }
        *self.inner.lock().expect("lock poisoned") = Some((term, vote, entries.to_vec()));
        Ok(())
    }
}
