use crate::db::options::NUM_LEVELS;
use std::ops::AddAssign;

/// Per level compaction stats. `stats[level]` stores the stats for
/// compactions that produced data for the specified level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub micros: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl AddAssign for CompactionStats {
    fn add_assign(&mut self, other: CompactionStats) {
        self.micros += other.micros;
        self.bytes_read += other.bytes_read;
        self.bytes_written += other.bytes_written;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LevelStatistics {
    pub files: usize,
    pub bytes: u64,
    pub compaction: CompactionStats,
}

/// Snapshot of the shape of the tree, as returned by `DB::get_statistics`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Statistics {
    pub levels: [LevelStatistics; NUM_LEVELS],
    pub memtable_bytes: usize,
}

impl Statistics {
    pub fn total_files(&self) -> usize {
        self.levels.iter().map(|l| l.files).sum()
    }

    /// The table printed for the `lsmkv.stats` property.
    pub fn to_table(&self) -> String {
        let mut value = String::from(
            "                               Compactions\n\
             Level  Files Size(MB) Time(sec) Read(MB) Write(MB)\n\
             --------------------------------------------------\n",
        );
        for (level, stats) in self.levels.iter().enumerate() {
            if stats.files > 0 || stats.compaction.micros > 0 {
                value.push_str(&format!(
                    "{:3} {:8} {:8.0} {:9.0} {:8.0} {:9.0}\n",
                    level,
                    stats.files,
                    stats.bytes as f64 / 1048576.0,
                    stats.compaction.micros as f64 / 1e6,
                    stats.compaction.bytes_read as f64 / 1048576.0,
                    stats.compaction.bytes_written as f64 / 1048576.0,
                ));
            }
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use crate::db::statistics::{CompactionStats, Statistics};

    #[test]
    fn test_stats_table() {
        let mut stats = Statistics::default();
        stats.levels[0].files = 3;
        stats.levels[0].bytes = 3 << 20;
        stats.levels[1].compaction += CompactionStats {
            micros: 2_000_000,
            bytes_read: 1 << 20,
            bytes_written: 1 << 20,
        };
        stats.levels[1].compaction += CompactionStats {
            micros: 1_000_000,
            bytes_read: 0,
            bytes_written: 1 << 20,
        };
        assert_eq!(stats.total_files(), 3);
        assert_eq!(stats.levels[1].compaction.micros, 3_000_000);
        let table = stats.to_table();
        assert_eq!(table.lines().count(), 5);
        assert!(table.lines().nth(3).unwrap().starts_with("  0        3"));
        assert!(!table.contains("\n  2 "));
    }
}
