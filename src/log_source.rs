//! Line reader over a growing log file.
//!
//! Lines are handed out only once their newline has been written. A line
//! longer than [`MAX_LINE_LEN`] is cut at the limit and the remainder of that
//! physical line is skipped. The source also notices when the file was
//! rotated away (different inode, or gone) or truncated in place.

use std::fs::{File, Metadata};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::RotationError;

/// Longest line handed to the classifier, in bytes.
pub const MAX_LINE_LEN: usize = 255;

/// How hard to try reopening a rotated log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReopenPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for ReopenPolicy {
    fn default() -> Self {
        // One try per second for an hour
        Self {
            attempts: 3600,
            interval: Duration::from_secs(1),
        }
    }
}

/// Where reading resumes in a reopened log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReopenFrom {
    /// The rotation was seen as it happened; earlier lines are not ours.
    End,
    /// The rotation was noticed late; the whole new file is unread.
    Start,
}

impl ReopenFrom {
    fn seek(self) -> SeekFrom {
        match self {
            ReopenFrom::End => SeekFrom::End(0),
            ReopenFrom::Start => SeekFrom::Start(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    dev: u64,
    ino: u64,
}

impl FileIdentity {
    fn of(meta: &Metadata) -> Self {
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
        }
    }
}

struct OpenLog {
    reader: BufReader<File>,
    identity: FileIdentity,
}

/// Tail reader for the auth log.
pub struct LogSource {
    path: PathBuf,
    log: Option<OpenLog>,
    /// Bytes consumed from the current file
    position: u64,
    pending: Vec<u8>,
    /// Skipping the tail of an over-long line
    discarding: bool,
}

impl LogSource {
    /// Open `path` positioned at its end; only lines written later are read.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Self::open_at(path.as_ref(), SeekFrom::End(0))
    }

    /// Open `path` at its first byte.
    pub fn open_from_start<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Self::open_at(path.as_ref(), SeekFrom::Start(0))
    }

    fn open_at(path: &Path, from: SeekFrom) -> io::Result<Self> {
        let mut source = Self {
            path: path.to_path_buf(),
            log: None,
            position: 0,
            pending: Vec::with_capacity(MAX_LINE_LEN),
            discarding: false,
        };
        source.attach(from)?;
        Ok(source)
    }

    fn attach(&mut self, from: SeekFrom) -> io::Result<()> {
        let mut file = File::open(&self.path)?;
        let identity = FileIdentity::of(&file.metadata()?);
        let position = file.seek(from)?;

        self.log = Some(OpenLog {
            reader: BufReader::new(file),
            identity,
        });
        self.position = position;
        self.pending.clear();
        self.discarding = false;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.log.is_some()
    }

    /// Offset of the next unread byte.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Next complete line, or `None` if no full line is available yet.
    pub fn next_line(&mut self) -> io::Result<Option<String>> {
        let Some(log) = self.log.as_mut() else {
            return Ok(None);
        };

        loop {
            let available = match log.reader.fill_buf() {
                Ok(buf) => buf,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if available.is_empty() {
                return Ok(None);
            }

            let newline = available.iter().position(|b| *b == b'\n');

            if self.discarding {
                let skip = newline.map_or(available.len(), |end| end + 1);
                self.discarding = newline.is_none();
                log.reader.consume(skip);
                self.position += skip as u64;
                continue;
            }

            let room = MAX_LINE_LEN - self.pending.len();
            match newline {
                Some(end) if end <= room => {
                    self.pending.extend_from_slice(&available[..end]);
                    log.reader.consume(end + 1);
                    self.position += end as u64 + 1;
                    return Ok(Some(take_line(&mut self.pending)));
                }
                _ => {
                    let keep = newline.unwrap_or(available.len()).min(room);
                    self.pending.extend_from_slice(&available[..keep]);
                    log.reader.consume(keep);
                    self.position += keep as u64;

                    if self.pending.len() == MAX_LINE_LEN {
                        self.discarding = true;
                        return Ok(Some(take_line(&mut self.pending)));
                    }
                }
            }
        }
    }

    /// True when the path no longer names the file being read.
    pub fn is_rotated(&self) -> bool {
        let Some(log) = &self.log else {
            return true;
        };

        match std::fs::metadata(&self.path) {
            Ok(meta) => FileIdentity::of(&meta) != log.identity,
            Err(_) => true,
        }
    }

    /// Restart from offset 0 if the file shrank below the read position.
    pub fn check_truncation(&mut self) -> io::Result<bool> {
        let Some(log) = self.log.as_mut() else {
            return Ok(false);
        };

        let len = log.reader.get_ref().metadata()?.len();
        if len >= self.position {
            return Ok(false);
        }

        info!(
            "{} was truncated ({} < {}), reading from the beginning",
            self.path.display(),
            len,
            self.position
        );
        log.reader.seek(SeekFrom::Start(0))?;
        self.position = 0;
        self.pending.clear();
        self.discarding = false;
        Ok(true)
    }

    /// Drop the file handle and any partial line.
    pub fn close(&mut self) {
        if self.log.take().is_some() {
            debug!("closed {}", self.path.display());
        }
        if !self.pending.is_empty() {
            debug!(
                "dropping {} bytes of unterminated line from {}",
                self.pending.len(),
                self.path.display()
            );
        }
        self.pending.clear();
        self.discarding = false;
    }

    /// Reopen the path after rotation, positioned per `from`.
    ///
    /// Tries once per `policy.interval`, at most `policy.attempts` times.
    pub async fn reopen(
        &mut self,
        policy: ReopenPolicy,
        from: ReopenFrom,
    ) -> Result<(), RotationError> {
        self.close();

        for attempt in 1..=policy.attempts {
            match self.attach(from.seek()) {
                Ok(()) => {
                    info!(
                        "reopened {} after {} attempt(s) at offset {}",
                        self.path.display(),
                        attempt,
                        self.position
                    );
                    return Ok(());
                }
                Err(e) => {
                    if attempt == 1 {
                        warn!("waiting for {} to reappear: {}", self.path.display(), e);
                    }
                    if attempt < policy.attempts {
                        tokio::time::sleep(policy.interval).await;
                    }
                }
            }
        }

        Err(RotationError::Exhausted {
            path: self.path.clone(),
            attempts: policy.attempts,
        })
    }
}

fn take_line(pending: &mut Vec<u8>) -> String {
    let line = String::from_utf8_lossy(pending).into_owned();
    pending.clear();
    line
}
