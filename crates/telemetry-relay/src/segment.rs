// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Append-only segment files and their delivery lifecycle.
//!
//! A segment's state is carried by its extension:
//!
//! ```text
//!   .open ──rotate──> .log ──checkout──> .inflight ──confirm──> .sent ──purge──> (deleted)
//!                      ^                     │
//!                      └──────release────────┘
//! ```
//!
//! Only one `.open` segment exists at a time. A `.log` segment is ready for
//! delivery once it has not been modified for the quiescence window. Any
//! `.open` or `.inflight` segment found at startup is returned to `.log`, so a
//! crash mid-delivery resends rather than loses data.

use chrono::Utc;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

use crate::error::RelayError;

const PREFIX: &str = "segment_";
const OPEN_EXT: &str = "open";
const CLOSED_EXT: &str = "log";
const IN_FLIGHT_EXT: &str = "inflight";
const SENT_EXT: &str = "sent";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Open,
    Closed,
    InFlight,
    Sent,
}

impl SegmentState {
    fn extension(self) -> &'static str {
        match self {
            Self::Open => OPEN_EXT,
            Self::Closed => CLOSED_EXT,
            Self::InFlight => IN_FLIGHT_EXT,
            Self::Sent => SENT_EXT,
        }
    }

    fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        if !name.starts_with(PREFIX) {
            return None;
        }
        match path.extension()?.to_str()? {
            OPEN_EXT => Some(Self::Open),
            CLOSED_EXT => Some(Self::Closed),
            IN_FLIGHT_EXT => Some(Self::InFlight),
            SENT_EXT => Some(Self::Sent),
            _ => None,
        }
    }
}

/// Rotation, readiness and retention windows.
#[derive(Debug, Clone, Copy)]
pub struct SegmentPolicy {
    pub max_file_size: u64,
    pub rotation_interval: Duration,
    pub quiescence: Duration,
    pub retention: Duration,
}

impl Default for SegmentPolicy {
    fn default() -> Self {
        Self {
            max_file_size: 10 * 1024 * 1024,
            rotation_interval: Duration::from_secs(5 * 60),
            quiescence: Duration::from_secs(60),
            retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// A closed segment on disk.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    pub path: PathBuf,
    /// File stem without the state extension, e.g. `segment_20240501T123045123_000001`
    pub name: String,
    pub size: u64,
    pub modified: SystemTime,
}

#[derive(Debug)]
struct ActiveSegment {
    path: PathBuf,
    file: File,
    size: u64,
    opened_at: Instant,
}

#[derive(Debug)]
pub struct SegmentStore {
    dir: PathBuf,
    policy: SegmentPolicy,
    active: Option<ActiveSegment>,
    sequence: u64,
}

fn with_state(path: &Path, state: SegmentState) -> PathBuf {
    path.with_extension(state.extension())
}

fn segment_name(path: &Path) -> String {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or_default()
        .to_string()
}

fn age(modified: SystemTime, now: SystemTime) -> Duration {
    now.duration_since(modified).unwrap_or(Duration::ZERO)
}

impl SegmentStore {
    /// Opens (creating if needed) a segment directory and recovers interrupted segments.
    pub fn open(dir: impl Into<PathBuf>, policy: SegmentPolicy) -> Result<Self, RelayError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let store = Self {
            dir,
            policy,
            active: None,
            sequence: 0,
        };
        let recovered = store.recover()?;
        if recovered > 0 {
            info!("RELAY | Recovered {recovered} interrupted segments");
        }
        Ok(store)
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn policy(&self) -> &SegmentPolicy {
        &self.policy
    }

    #[must_use]
    pub fn active_path(&self) -> Option<&Path> {
        self.active.as_ref().map(|active| active.path.as_path())
    }

    #[must_use]
    pub fn active_size(&self) -> u64 {
        self.active.as_ref().map_or(0, |active| active.size)
    }

    fn recover(&self) -> Result<usize, RelayError> {
        let mut recovered = 0;
        for path in self.list(&[SegmentState::Open, SegmentState::InFlight])? {
            fs::rename(&path, with_state(&path, SegmentState::Closed))?;
            recovered += 1;
        }
        Ok(recovered)
    }

    fn list(&self, states: &[SegmentState]) -> Result<Vec<PathBuf>, RelayError> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if SegmentState::from_path(&path).is_some_and(|state| states.contains(&state)) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    fn open_new(&mut self) -> Result<(), RelayError> {
        self.sequence += 1;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
        let path = self
            .dir
            .join(format!("{PREFIX}{stamp}_{:06}.{OPEN_EXT}", self.sequence));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        debug!("Opened segment {}", path.display());
        self.active = Some(ActiveSegment {
            path,
            file,
            size: 0,
            opened_at: Instant::now(),
        });
        Ok(())
    }

    /// Appends bytes to the active segment, rotating first when the segment is older than
    /// the rotation interval and afterwards when it has reached the size limit.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), RelayError> {
        self.maybe_rotate()?;
        if self.active.is_none() {
            self.open_new()?;
        }
        let max_file_size = self.policy.max_file_size;
        let full = match self.active.as_mut() {
            Some(active) => {
                active.file.write_all(bytes)?;
                active.size += bytes.len() as u64;
                active.size >= max_file_size
            }
            None => false,
        };

        if full {
            self.rotate()?;
        }
        Ok(())
    }

    /// Closes the active segment when it has been open for the rotation interval.
    pub fn maybe_rotate(&mut self) -> Result<Option<PathBuf>, RelayError> {
        let expired = self
            .active
            .as_ref()
            .is_some_and(|active| active.opened_at.elapsed() >= self.policy.rotation_interval);
        if expired {
            self.rotate()
        } else {
            Ok(None)
        }
    }

    /// Closes the active segment, if any, and returns its closed path.
    pub fn rotate(&mut self) -> Result<Option<PathBuf>, RelayError> {
        let Some(active) = self.active.take() else {
            return Ok(None);
        };
        active.file.sync_all()?;
        drop(active.file);
        let closed = with_state(&active.path, SegmentState::Closed);
        fs::rename(&active.path, &closed)?;
        debug!("Rotated segment {} ({} bytes)", closed.display(), active.size);
        Ok(Some(closed))
    }

    /// Closed segments left untouched for the quiescence window, oldest first.
    pub fn ready_segments(&self) -> Result<Vec<SegmentInfo>, RelayError> {
        let now = SystemTime::now();
        let mut ready = Vec::new();
        for path in self.list(&[SegmentState::Closed])? {
            if self.active_path() == Some(path.as_path()) {
                continue;
            }
            let metadata = fs::metadata(&path)?;
            let modified = metadata.modified()?;
            if age(modified, now) >= self.policy.quiescence {
                ready.push(SegmentInfo {
                    name: segment_name(&path),
                    size: metadata.len(),
                    modified,
                    path,
                });
            }
        }
        Ok(ready)
    }

    pub fn has_ready(&self) -> Result<bool, RelayError> {
        Ok(!self.ready_segments()?.is_empty())
    }

    fn transition(&self, path: &Path, from: SegmentState, to: SegmentState) -> Result<PathBuf, RelayError> {
        if SegmentState::from_path(path) != Some(from) {
            return Err(RelayError::Storage(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a {:?} segment", path.display(), from),
            )));
        }
        let target = with_state(path, to);
        fs::rename(path, &target)?;
        Ok(target)
    }

    pub fn mark_in_flight(&self, path: &Path) -> Result<PathBuf, RelayError> {
        self.transition(path, SegmentState::Closed, SegmentState::InFlight)
    }

    /// Marks an in-flight segment delivered. Its retention window starts now.
    pub fn mark_transmitted(&self, path: &Path) -> Result<PathBuf, RelayError> {
        let sent = self.transition(path, SegmentState::InFlight, SegmentState::Sent)?;
        OpenOptions::new()
            .write(true)
            .open(&sent)?
            .set_modified(SystemTime::now())?;
        Ok(sent)
    }

    /// Returns an in-flight segment to the ready pool.
    pub fn release(&self, path: &Path) -> Result<PathBuf, RelayError> {
        self.transition(path, SegmentState::InFlight, SegmentState::Closed)
    }

    /// Deletes delivered segments whose retention window has passed.
    pub fn purge_expired(&self) -> Result<usize, RelayError> {
        let now = SystemTime::now();
        let mut purged = 0;
        for path in self.list(&[SegmentState::Sent])? {
            let modified = fs::metadata(&path)?.modified()?;
            if age(modified, now) < self.policy.retention {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => purged += 1,
                Err(e) => warn!("Failed to purge {}: {e}", path.display()),
            }
        }
        if purged > 0 {
            debug!("Purged {purged} delivered segments");
        }
        Ok(purged)
    }

    /// Count of segments in `state`.
    pub fn count(&self, state: SegmentState) -> Result<usize, RelayError> {
        Ok(self.list(&[state])?.len())
    }
}
