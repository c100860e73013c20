//! Compaction picking state and the merge that performs a compaction.

pub mod compactor;

use crate::comparator::Comparator;
use crate::db::key_types::InternalKeyComparator;
use crate::db::options::NUM_LEVELS;
use crate::version::version_edit::{FileMetaData, VersionEdit};
use crate::version::{max_grand_parent_overlap_bytes, total_file_size, Version};
use std::cmp::Ordering;
use std::sync::Arc;

/// Information about a compaction: the inputs from `level` and
/// `level + 1`, and the edit that will install its result.
pub struct Compaction {
    level: usize,
    max_output_file_size: u64,
    max_grand_parent_overlap: u64,
    icmp: InternalKeyComparator,
    input_version: Arc<Version>,
    pub edit: VersionEdit,

    /// Each compaction reads inputs from `level` and `level + 1`
    pub(crate) inputs: [Vec<Arc<FileMetaData>>; 2],

    /// State used to check for number of overlapping grandparent files
    /// (parent == level + 1, grandparent == level + 2)
    pub(crate) grandparents: Vec<Arc<FileMetaData>>,
    /// Index in grandparents
    grandparent_index: usize,
    /// Some output key has been seen
    seen_key: bool,
    /// Bytes of overlap between current output and grandparent files
    overlapped_bytes: u64,

    /// State for implementing `is_base_level_for_key`.
    ///
    /// `level_ptrs` holds indices into `input_version.files`: our state is
    /// that we are positioned at one of the file ranges for each higher
    /// level than the ones involved in this compaction (i.e. for all
    /// L >= level + 2).
    level_ptrs: [usize; NUM_LEVELS],
}

impl Compaction {
    pub(crate) fn new(
        icmp: InternalKeyComparator,
        max_file_size: usize,
        level: usize,
        input_version: Arc<Version>,
    ) -> Compaction {
        Compaction {
            level,
            max_output_file_size: max_file_size as u64,
            max_grand_parent_overlap: max_grand_parent_overlap_bytes(max_file_size),
            icmp,
            input_version,
            edit: VersionEdit::default(),
            inputs: [vec![], vec![]],
            grandparents: vec![],
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            level_ptrs: [0; NUM_LEVELS],
        }
    }

    #[inline]
    pub(crate) fn icmp(&self) -> &InternalKeyComparator {
        &self.icmp
    }

    /// Return the level that is being compacted. Inputs from `level` and
    /// `level + 1` will be merged to produce a set of `level + 1` files.
    #[inline]
    pub fn level(&self) -> usize {
        self.level
    }

    #[inline]
    pub fn num_input_files(&self, which: usize) -> usize {
        self.inputs[which].len()
    }

    #[inline]
    pub fn max_output_file_size(&self) -> u64 {
        self.max_output_file_size
    }

    #[inline]
    pub fn input_version(&self) -> &Arc<Version> {
        &self.input_version
    }

    /// Is this a trivial compaction that can be implemented by just
    /// moving a single input file to the next level (no merging or
    /// splitting)?
    pub fn is_trivial_move(&self) -> bool {
        // Avoid a move if there is lots of overlapping grandparent data.
        // Otherwise, the move could create a parent file that will require
        // a very expensive merge later on.
        self.num_input_files(0) == 1
            && self.num_input_files(1) == 0
            && total_file_size(&self.grandparents) <= self.max_grand_parent_overlap
    }

    /// Add all inputs to this compaction as delete operations to the edit.
    pub fn add_input_deletions(&mut self) {
        for which in 0..2 {
            for f in &self.inputs[which] {
                self.edit.delete_file(self.level + which, f.number);
            }
        }
    }

    /// Returns true if the information we have available guarantees that
    /// the compaction is producing data in `level + 1` for which no data
    /// exists in levels greater than `level + 1`.
    pub fn is_base_level_for_key(&mut self, user_key: &[u8]) -> bool {
        // Maybe use binary search to find right entry instead of linear search?
        let ucmp = self.icmp.user_comparator();
        for lvl in self.level + 2..NUM_LEVELS {
            let files = self.input_version.files(lvl);
            while self.level_ptrs[lvl] < files.len() {
                let f = &files[self.level_ptrs[lvl]];
                if ucmp.compare(user_key, f.largest.user_key()) != Ordering::Greater {
                    // We've advanced far enough
                    if ucmp.compare(user_key, f.smallest.user_key()) != Ordering::Less {
                        // Key falls in this file's range, so definitely not base level
                        return false;
                    }
                    break;
                }
                self.level_ptrs[lvl] += 1;
            }
        }
        true
    }

    /// Returns true iff we should stop building the current output
    /// before processing `internal_key`.
    pub fn should_stop_before(&mut self, internal_key: &[u8]) -> bool {
        // Scan to find earliest grandparent file that contains key.
        while self.grandparent_index < self.grandparents.len()
            && self.icmp.compare(
                internal_key,
                self.grandparents[self.grandparent_index].largest.encode(),
            ) == Ordering::Greater
        {
            if self.seen_key {
                self.overlapped_bytes += self.grandparents[self.grandparent_index].file_size;
            }
            self.grandparent_index += 1;
        }
        self.seen_key = true;

        if self.overlapped_bytes > self.max_grand_parent_overlap {
            // Too much overlap for current output; start new output
            self.overlapped_bytes = 0;
            true
        } else {
            false
        }
    }
}
