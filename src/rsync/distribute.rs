use super::list::FileEntry;

/// Files above this size are placed with best-fit; everything else goes
/// round-robin. Scanning worker totals for every small relation file would
/// cost more than the imbalance it removes.
const LARGE_FILE_THRESHOLD: u64 = 1024 * 1024 * 1024;

/// Splits `files` across `workers` buckets, balancing byte totals.
/// Files are sorted by size descending first, so the large tail lands
/// before round-robin fills in the rest. Buckets may be empty.
pub fn distribute(mut files: Vec<FileEntry>, workers: usize) -> Vec<Vec<FileEntry>> {
    if workers == 0 {
        return Vec::new();
    }
    let mut buckets: Vec<Vec<FileEntry>> = vec![Vec::new(); workers];
    if files.is_empty() {
        return buckets;
    }

    files.sort_by(|a, b| b.size.cmp(&a.size));

    let mut totals = vec![0u64; workers];
    let mut cursor = 0;

    for file in files {
        if file.size > LARGE_FILE_THRESHOLD {
            // best-fit: the worker with the smallest total, lowest index wins ties
            let mut target = 0;
            for i in 1..workers {
                if totals[i] < totals[target] {
                    target = i;
                }
            }
            totals[target] += file.size;
            buckets[target].push(file);
        } else {
            totals[cursor] += file.size;
            buckets[cursor].push(file);
            cursor = (cursor + 1) % workers;
        }
    }
    buckets
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{distribute, FileEntry};

    fn entry(path: &str, size: u64) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            size,
        }
    }

    fn totals(buckets: &[Vec<FileEntry>]) -> Vec<u64> {
        buckets
            .iter()
            .map(|b| b.iter().map(|f| f.size).sum())
            .collect()
    }

    #[test]
    fn balances_small_files() {
        let files: Vec<FileEntry> = (1..=10)
            .map(|i| entry(&format!("f{i}"), 100 * i))
            .collect();
        let buckets = distribute(files, 3);
        assert_eq!(buckets.len(), 3);

        let totals = totals(&buckets);
        let max = totals.iter().copied().max().unwrap_or(0);
        let min = totals.iter().copied().min().unwrap_or(0);
        assert!(
            max - min <= 1000,
            "load imbalance too high: totals={totals:?}"
        );
    }

    #[test]
    fn output_is_a_permutation_of_input() {
        let files: Vec<FileEntry> = (0..37).map(|i| entry(&format!("f{i}"), i * 13)).collect();
        let buckets = distribute(files.clone(), 4);

        let mut seen: BTreeMap<String, u64> = BTreeMap::new();
        for bucket in &buckets {
            for file in bucket {
                *seen.entry(file.path.clone()).or_insert(0) += 1;
            }
        }
        assert_eq!(seen.len(), files.len());
        assert!(seen.values().all(|count| *count == 1));
    }

    #[test]
    fn large_files_use_best_fit() {
        const GIB: u64 = 1024 * 1024 * 1024;

        let mut files = Vec::new();
        for i in 0..10 {
            files.push(entry(&format!("large_{i}"), (2 + i) * GIB));
        }
        for i in 0..96 {
            files.push(entry(&format!("small_{i}"), (10 + i) * 1024 * 1024));
        }

        let workers = 8;
        let buckets = distribute(files, workers);
        let totals = totals(&buckets);
        let total: u64 = totals.iter().sum();
        let avg = total / workers as u64;
        let max = totals.iter().copied().max().unwrap_or(0);
        let min = totals.iter().copied().min().unwrap_or(0);

        // best-fit on the large tail keeps the spread well under one
        // average bucket
        assert!(
            max - min <= avg,
            "distribution imbalance too high: totals={totals:?}"
        );
    }

    #[test]
    fn empty_inputs() {
        assert!(distribute(vec![entry("a", 1)], 0).is_empty());
        let buckets = distribute(Vec::new(), 3);
        assert_eq!(buckets.len(), 3);
        assert!(buckets.iter().all(Vec::is_empty));
    }

    #[test]
    fn more_workers_than_files() {
        let buckets = distribute(vec![entry("a", 10), entry("b", 20)], 5);
        assert_eq!(buckets.len(), 5);
        let non_empty = buckets.iter().filter(|b| !b.is_empty()).count();
        assert_eq!(non_empty, 2);
    }
}
