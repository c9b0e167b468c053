//! In-memory/on-disk spool for a message body being received over DATA
//! (C3). Small messages stay in memory; anything crossing
//! [`MEMORY_THRESHOLD`] spills to an unlinked temporary file so a slow or
//! malicious sender can't blow up server memory with a single huge message.

use std::{
    fs::File,
    io::{self, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    pin::Pin,
    task::{Context, Poll},
};

use futures::io::{AsyncRead, Cursor};

/// Above this many bytes buffered in memory, the spool spills to a temp file.
pub const MEMORY_THRESHOLD: usize = 64 * 1024;

enum BodySpoolState {
    Memory(Vec<u8>),
    File(File),
}

/// A message body being received over DATA. Stays in memory below
/// [`MEMORY_THRESHOLD`]; above that it spills to an anonymous (created then
/// immediately unlinked) temp file below `dir`, which should be the
/// operator's configured spool directory rather than the OS temp dir so
/// large messages land on disk the operator actually provisioned.
pub struct BodySpool {
    dir: PathBuf,
    state: BodySpoolState,
}

impl BodySpool {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        BodySpool {
            dir: dir.into(),
            state: BodySpoolState::Memory(Vec::new()),
        }
    }

    pub fn len(&self) -> io::Result<u64> {
        match &self.state {
            BodySpoolState::Memory(v) => Ok(v.len() as u64),
            BodySpoolState::File(f) => f.metadata().map(|m| m.len()),
        }
    }

    /// Appends `buf`, spilling to a temp file below the configured spool
    /// directory the first time the combined size would cross
    /// [`MEMORY_THRESHOLD`].
    pub fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match &mut self.state {
            BodySpoolState::Memory(v) if v.len() + buf.len() > MEMORY_THRESHOLD => {
                let mut f = tempfile::tempfile_in(&self.dir)?;
                f.write_all(v)?;
                f.write_all(buf)?;
                self.state = BodySpoolState::File(f);
                Ok(())
            }
            BodySpoolState::Memory(v) => {
                v.extend_from_slice(buf);
                Ok(())
            }
            BodySpoolState::File(f) => f.write_all(buf),
        }
    }

    /// The path to the backing file, if this spool has already spilled to
    /// disk. Used to hard-link a delivered message for subsequent
    /// recipients instead of rewriting it.
    pub fn as_file(&self) -> Option<&File> {
        match &self.state {
            BodySpoolState::Memory(_) => None,
            BodySpoolState::File(f) => Some(f),
        }
    }

    /// Whether this spool has spilled to disk yet.
    pub fn is_spilled(&self) -> bool {
        matches!(self.state, BodySpoolState::File(_))
    }

    /// The configured spool directory this body would spill below.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// A fresh, independently-seekable reader over the whole spooled body.
    pub fn reader(&self) -> io::Result<BodySpoolReader> {
        match &self.state {
            BodySpoolState::Memory(v) => Ok(BodySpoolReader::Memory(Cursor::new(v.clone()))),
            BodySpoolState::File(f) => {
                let mut f = f.try_clone()?;
                f.seek(SeekFrom::Start(0))?;
                Ok(BodySpoolReader::File(smol::fs::File::from(f)))
            }
        }
    }
}

pub enum BodySpoolReader {
    Memory(Cursor<Vec<u8>>),
    File(smol::fs::File),
}

// Neither variant is self-referential, so moving the enum around (as
// happens when it sits behind a `Pin` we never actually need structurally)
// is sound.
impl Unpin for BodySpoolReader {}

impl AsyncRead for BodySpoolReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            BodySpoolReader::Memory(c) => Pin::new(c).poll_read(cx, buf),
            BodySpoolReader::File(f) => Pin::new(f).poll_read(cx, buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::AsyncReadExt;

    #[test]
    fn stays_in_memory_below_threshold() {
        let mut spool = BodySpool::new(std::env::temp_dir());
        spool.write_all(b"hello world").unwrap();
        assert!(!spool.is_spilled());
        assert_eq!(spool.len().unwrap(), 11);
    }

    #[test]
    fn spills_to_file_above_threshold() {
        let mut spool = BodySpool::new(std::env::temp_dir());
        spool.write_all(&vec![b'a'; MEMORY_THRESHOLD + 1]).unwrap();
        assert!(spool.is_spilled());
        assert_eq!(spool.len().unwrap(), MEMORY_THRESHOLD as u64 + 1);
    }

    #[test]
    fn reader_roundtrips_memory_spool() {
        smol::block_on(async {
            let mut spool = BodySpool::new(std::env::temp_dir());
            spool.write_all(b"Subject: hi\r\n\r\nbody\r\n").unwrap();
            let mut reader = spool.reader().unwrap();
            let mut out = Vec::new();
            reader.read_to_end(&mut out).await.unwrap();
            assert_eq!(out, b"Subject: hi\r\n\r\nbody\r\n");
        });
    }

    #[test]
    fn reader_roundtrips_file_spool_independently() {
        smol::block_on(async {
            let mut spool = BodySpool::new(std::env::temp_dir());
            spool.write_all(&vec![b'x'; MEMORY_THRESHOLD + 10]).unwrap();
            let mut r1 = spool.reader().unwrap();
            let mut r2 = spool.reader().unwrap();
            let mut out1 = Vec::new();
            let mut out2 = Vec::new();
            r1.read_to_end(&mut out1).await.unwrap();
            r2.read_to_end(&mut out2).await.unwrap();
            assert_eq!(out1.len(), MEMORY_THRESHOLD + 10);
            assert_eq!(out1, out2);
        });
    }

    /// Scenario S6: a 70 KiB DATA payload crosses `MEMORY_THRESHOLD` and must
    /// spill below the *configured* spool directory as an anonymous,
    /// already-unlinked file opened 0600 — not into the OS temp dir.
    #[test]
    fn scenario_s6_spills_below_configured_dir_unlinked_and_mode_0600() {
        use std::os::unix::fs::PermissionsExt;

        let spool_root = tempfile::tempdir().unwrap();
        let mut spool = BodySpool::new(spool_root.path());
        let payload = vec![b'm'; 70 * 1024];
        spool.write_all(&payload).unwrap();

        assert!(spool.is_spilled(), "70 KiB payload should have spilled to disk");
        assert_eq!(spool.len().unwrap(), payload.len() as u64);

        let file = spool.as_file().expect("spilled spool exposes a backing file");
        let mode = file.metadata().unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "spill file should be created with mode 0600");

        // tempfile::tempfile_in creates then immediately unlinks its file, so
        // the configured directory should show nothing despite the still-open
        // descriptor holding the data.
        let entries: Vec<_> = std::fs::read_dir(spool_root.path()).unwrap().collect();
        assert!(
            entries.is_empty(),
            "spill file should already be unlinked from the spool dir: {:?}",
            entries
        );
    }

    /// A spool directory that doesn't exist should surface as an I/O error
    /// from the spill itself, proving the spill really targets the
    /// configured directory rather than silently falling back to the OS
    /// temp dir.
    #[test]
    fn spill_fails_when_configured_dir_is_missing() {
        let root = tempfile::tempdir().unwrap();
        let missing = root.path().join("does-not-exist");
        let mut spool = BodySpool::new(&missing);
        let err = spool
            .write_all(&vec![b'a'; MEMORY_THRESHOLD + 1])
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
