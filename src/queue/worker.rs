//! Jobs run off the queue lock: moving finished files into place and
//! re-hashing temp files against their trees.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use super::item::QueueItemId;
use super::segment::{Segment, SegmentSet};
use crate::hash::TthValue;
use crate::services::HashStore;

/// Moves a finished temp file to its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveJob {
    pub item: QueueItemId,
    pub from: PathBuf,
    pub to: PathBuf,
}

/// Where a moved file ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveOutcome {
    Moved(PathBuf),
    /// The target directory was unusable; the file was renamed to its
    /// final name inside the temp directory instead.
    MovedInPlace(PathBuf),
}

impl MoveOutcome {
    pub fn path(&self) -> &Path {
        match self {
            MoveOutcome::Moved(path) | MoveOutcome::MovedInPlace(path) => path,
        }
    }
}

impl MoveJob {
    pub async fn run(&self) -> io::Result<MoveOutcome> {
        if self.from == self.to {
            return Ok(MoveOutcome::Moved(self.to.clone()));
        }

        let primary = async {
            if let Some(parent) = self.to.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::rename(&self.from, &self.to).await
        };

        match primary.await {
            Ok(()) => {
                debug!(item = %self.item, to = %self.to.display(), "moved finished file");
                Ok(MoveOutcome::Moved(self.to.clone()))
            }
            Err(err) => {
                let Some(name) = self.to.file_name() else {
                    return Err(err);
                };
                let fallback = self.from.with_file_name(name);
                warn!(
                    item = %self.item,
                    to = %self.to.display(),
                    error = %err,
                    "move failed, renaming in place"
                );
                tokio::fs::rename(&self.from, &fallback).await?;
                Ok(MoveOutcome::MovedInPlace(fallback))
            }
        }
    }
}

/// Verifies a temp file block by block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecheckJob {
    pub item: QueueItemId,
    pub path: PathBuf,
    pub tth: TthValue,
    pub size: u64,
    pub block_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecheckResult {
    pub item: QueueItemId,
    /// Ranges of the blocks that verified.
    pub good: SegmentSet,
    pub bad_blocks: usize,
    pub block_count: usize,
}

impl RecheckResult {
    pub fn is_complete(&self) -> bool {
        self.bad_blocks == 0 && self.block_count > 0
    }
}

impl RecheckJob {
    /// Hashes the file on a blocking thread.
    pub async fn run(self, hashes: Arc<dyn HashStore>) -> io::Result<RecheckResult> {
        let RecheckJob {
            item,
            path,
            tth,
            size,
            block_size,
        } = self;

        let flags = tokio::task::spawn_blocking(move || hashes.verify_blocks(&path, &tth, size))
            .await
            .map_err(io::Error::other)??;

        let mut good = SegmentSet::new();
        let block_size = block_size.max(1);
        for (index, ok) in flags.iter().enumerate() {
            if *ok {
                let start = index as u64 * block_size;
                good.add(Segment::new(start, block_size), size);
            }
        }

        Ok(RecheckResult {
            item,
            bad_blocks: flags.iter().filter(|ok| !**ok).count(),
            block_count: flags.len(),
            good,
        })
    }
}
