use std::{
    io::{BufRead, BufReader, Read},
    sync::LazyLock,
    time::Duration,
};

use regex::Regex;

use crate::{error::Result, format::format_size};

/// Aggregated counters from an rsync `--stats` block.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Stats {
    pub num_files: u64,
    pub created_files: u64,
    pub created_reg: u64,
    pub created_dir: u64,
    pub deleted_files: u64,
    pub deleted_reg: u64,
    pub deleted_dir: u64,
    pub reg_transferred: u64,
    pub total_file_size: u64,
    pub total_transferred_size: u64,
    pub literal_data: u64,
    pub matched_data: u64,
    pub reg_files: u64,
    pub dir_files: u64,
    pub link_files: u64,
    pub file_list_size: u64,
    pub file_list_gen_seconds: f64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

static RE_NUM_FILES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*Number of files:\s+([0-9,]+)(?:\s*\(([^)]+)\))?").unwrap());
static RE_CREATED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*Number of created files:\s+([0-9,]+)(?:\s*\(([^)]+)\))?").unwrap()
});
static RE_DELETED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*Number of deleted files:\s+([0-9,]+)(?:\s*\(([^)]+)\))?").unwrap()
});
static RE_REG_TRANSFERRED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*Number of regular files transferred:\s+([0-9,]+)").unwrap());
static RE_TOTAL_SIZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*Total file size:\s+([0-9.,A-Za-z]+)").unwrap());
static RE_TRANSFERRED_SIZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*Total transferred file size:\s+([0-9.,A-Za-z]+)").unwrap());
static RE_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*Literal data:\s+([0-9.,A-Za-z]+)").unwrap());
static RE_MATCHED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*Matched data:\s+([0-9.,A-Za-z]+)").unwrap());
static RE_LIST_SIZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*File list size:\s+([0-9.,A-Za-z]+)").unwrap());
static RE_LIST_GEN_TIME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*File list generation time:\s+([0-9.,]+) seconds?").unwrap());
static RE_BYTES_SENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*Total bytes sent:\s+([0-9.,A-Za-z]+)").unwrap());
static RE_BYTES_RECEIVED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*Total bytes received:\s+([0-9.,A-Za-z]+)").unwrap());

/// Parses an rsync `--stats` block. Lines that match none of the known
/// prefixes are ignored, so feeding a whole worker log is fine; only reader
/// I/O can fail.
pub fn parse_stats<R: Read>(reader: R) -> Result<Stats> {
    let mut stats = Stats::default();
    for line in BufReader::new(reader).lines() {
        let line = line?;
        parse_line(&mut stats, &line);
    }
    Ok(stats)
}

fn parse_line(stats: &mut Stats, line: &str) {
    if let Some(caps) = RE_NUM_FILES.captures(line) {
        stats.num_files = to_int(&caps[1]);
        if let Some(categories) = caps.get(2) {
            for (key, value) in parse_categories(categories.as_str()) {
                match key {
                    "reg" => stats.reg_files = value,
                    "dir" => stats.dir_files = value,
                    "link" | "sym" => stats.link_files = value,
                    _ => {}
                }
            }
        }
    } else if let Some(caps) = RE_CREATED.captures(line) {
        stats.created_files = to_int(&caps[1]);
        if let Some(categories) = caps.get(2) {
            for (key, value) in parse_categories(categories.as_str()) {
                match key {
                    "reg" | "regular" | "regular files" => stats.created_reg = value,
                    "dir" | "directories" => stats.created_dir = value,
                    _ => {}
                }
            }
        }
    } else if let Some(caps) = RE_DELETED.captures(line) {
        stats.deleted_files = to_int(&caps[1]);
        if let Some(categories) = caps.get(2) {
            for (key, value) in parse_categories(categories.as_str()) {
                match key {
                    "reg" | "regular" | "regular files" | "file" | "files" => {
                        stats.deleted_reg = value;
                    }
                    "dir" | "directories" => stats.deleted_dir = value,
                    _ => {}
                }
            }
        }
    } else if let Some(caps) = RE_REG_TRANSFERRED.captures(line) {
        stats.reg_transferred = to_int(&caps[1]);
    } else if let Some(caps) = RE_TOTAL_SIZE.captures(line) {
        stats.total_file_size = to_bytes(&caps[1]);
    } else if let Some(caps) = RE_TRANSFERRED_SIZE.captures(line) {
        stats.total_transferred_size = to_bytes(&caps[1]);
    } else if let Some(caps) = RE_LITERAL.captures(line) {
        stats.literal_data = to_bytes(&caps[1]);
    } else if let Some(caps) = RE_MATCHED.captures(line) {
        stats.matched_data = to_bytes(&caps[1]);
    } else if let Some(caps) = RE_LIST_SIZE.captures(line) {
        stats.file_list_size = to_bytes(&caps[1]);
    } else if let Some(caps) = RE_LIST_GEN_TIME.captures(line) {
        let value: f64 = caps[1].replace(',', ".").parse().unwrap_or(0.0);
        if value > stats.file_list_gen_seconds {
            stats.file_list_gen_seconds = value;
        }
    } else if let Some(caps) = RE_BYTES_SENT.captures(line) {
        stats.bytes_sent = to_bytes(&caps[1]);
    } else if let Some(caps) = RE_BYTES_RECEIVED.captures(line) {
        stats.bytes_received = to_bytes(&caps[1]);
    }
}

/// Decomposes a category suffix like `reg: 16, dir: 2, link: 1`.
fn parse_categories(input: &str) -> Vec<(&str, u64)> {
    input
        .split(',')
        .filter_map(|part| {
            let (key, value) = part.trim().split_once(':')?;
            Some((key.trim(), to_int(value)))
        })
        .collect()
}

fn to_int(s: &str) -> u64 {
    let digits: String = s.chars().filter(char::is_ascii_digit).collect();
    digits.parse().unwrap_or(0)
}

/// Converts size tokens like `1234`, `2.3K` or `1.2 MiB` to bytes.
/// Suffixes are base 1024; fractional results round down.
pub fn to_bytes(s: &str) -> u64 {
    let s = s.trim();
    if s.is_empty() {
        return 0;
    }
    let has_unit = s
        .chars()
        .any(|c| !c.is_ascii_digit() && c != '.' && c != ',' && c != ' ');
    if !has_unit {
        return to_int(s);
    }

    let compact: String = s.chars().filter(|c| *c != ' ' && *c != ',').collect();
    let split = compact
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(compact.len());
    let Ok(value) = compact[..split].parse::<f64>() else {
        return 0;
    };
    let multiplier: f64 = match compact[split..].chars().next() {
        Some('K' | 'k') => f64::from(1u32 << 10),
        Some('M' | 'm') => f64::from(1u32 << 20),
        Some('G' | 'g') => f64::from(1u32 << 30),
        Some('T' | 't') => (1u64 << 40) as f64,
        Some('P' | 'p') => (1u64 << 50) as f64,
        _ => 1.0,
    };
    (value * multiplier) as u64
}

impl Stats {
    /// Elementwise sum; the file-list generation time keeps the maximum.
    /// `bytes_received` sums too, but per-worker values are per-connection
    /// totals, so the engine overrides the aggregate with the progress
    /// counter once all workers finish.
    #[must_use]
    pub fn add(self, other: Stats) -> Stats {
        Stats {
            num_files: self.num_files + other.num_files,
            created_files: self.created_files + other.created_files,
            created_reg: self.created_reg + other.created_reg,
            created_dir: self.created_dir + other.created_dir,
            deleted_files: self.deleted_files + other.deleted_files,
            deleted_reg: self.deleted_reg + other.deleted_reg,
            deleted_dir: self.deleted_dir + other.deleted_dir,
            reg_transferred: self.reg_transferred + other.reg_transferred,
            total_file_size: self.total_file_size + other.total_file_size,
            total_transferred_size: self.total_transferred_size + other.total_transferred_size,
            literal_data: self.literal_data + other.literal_data,
            matched_data: self.matched_data + other.matched_data,
            reg_files: self.reg_files + other.reg_files,
            dir_files: self.dir_files + other.dir_files,
            link_files: self.link_files + other.link_files,
            file_list_size: self.file_list_size + other.file_list_size,
            file_list_gen_seconds: self.file_list_gen_seconds.max(other.file_list_gen_seconds),
            bytes_sent: self.bytes_sent + other.bytes_sent,
            bytes_received: self.bytes_received + other.bytes_received,
        }
    }

    /// Formatted multi-line block mirroring rsync's own `--stats` layout,
    /// with a throughput trailer.
    pub fn summary(&self, elapsed: Duration) -> String {
        let secs = elapsed.as_secs_f64().max(1.0);
        let up_rate = (self.bytes_sent as f64 / secs) as u64;
        let down_rate = (self.bytes_received as f64 / secs) as u64;

        format!(
            "\nNumber of files: {} (reg: {}, dir: {}, link: {})\n\
             Number of created files: {} (reg: {}, dir: {})\n\
             Number of deleted files: {} (reg: {}, dir: {})\n\
             Number of regular files transferred: {}\n\
             Total file size: {}\n\
             Total transferred file size: {}\n\
             Literal data: {}\n\
             Matched data: {}\n\
             File list size: {}\n\
             File list generation time: {:.3} seconds\n\
             Total bytes sent: {}\n\
             Total bytes received: {}\n\n\
             sent {} ({}/sec) received {} ({}/sec)",
            self.num_files,
            self.reg_files,
            self.dir_files,
            self.link_files,
            self.created_files,
            self.created_reg,
            self.created_dir,
            self.deleted_files,
            self.deleted_reg,
            self.deleted_dir,
            self.reg_transferred,
            format_size(self.total_file_size),
            format_size(self.total_transferred_size),
            format_size(self.literal_data),
            format_size(self.matched_data),
            format_size(self.file_list_size),
            self.file_list_gen_seconds,
            format_size(self.bytes_sent),
            format_size(self.bytes_received),
            format_size(self.bytes_sent),
            format_size(up_rate),
            format_size(self.bytes_received),
            format_size(down_rate),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{parse_stats, to_bytes, Stats};

    const SAMPLE: &str = "Number of files: 10 (reg: 7, dir: 2, link: 1)\n\
                          Number of created files: 3 (reg: 3)\n\
                          Number of deleted files: 1 (dir: 1)\n\
                          Number of regular files transferred: 2\n\
                          Total file size: 5,120 bytes\n\
                          Total transferred file size: 4,096 bytes\n\
                          Literal data: 4,096 bytes\n\
                          Matched data: 0 bytes\n\
                          File list size: 120\n\
                          File list generation time: 0.002 seconds\n\
                          Total bytes sent: 2.00K\n\
                          Total bytes received: 80\n";

    #[test]
    fn parses_sample_block() {
        let stats = parse_stats(SAMPLE.as_bytes()).expect("parse");
        assert_eq!(stats.num_files, 10);
        assert_eq!(stats.reg_files, 7);
        assert_eq!(stats.dir_files, 2);
        assert_eq!(stats.link_files, 1);
        assert_eq!(stats.created_files, 3);
        assert_eq!(stats.created_reg, 3);
        assert_eq!(stats.deleted_files, 1);
        assert_eq!(stats.deleted_dir, 1);
        assert_eq!(stats.reg_transferred, 2);
        assert_eq!(stats.total_file_size, 5120);
        assert_eq!(stats.total_transferred_size, 4096);
        assert_eq!(stats.bytes_sent, 2048);
        assert_eq!(stats.bytes_received, 80);
        assert!((stats.file_list_gen_seconds - 0.002).abs() < f64::EPSILON);
    }

    #[test]
    fn unknown_lines_are_ignored() {
        let noisy = format!("sending incremental file list\n{SAMPLE}garbage trailing line\n");
        let stats = parse_stats(noisy.as_bytes()).expect("parse");
        assert_eq!(stats.num_files, 10);
    }

    #[test]
    fn byte_sizes() {
        assert_eq!(to_bytes("0"), 0);
        assert_eq!(to_bytes("1234"), 1234);
        assert_eq!(to_bytes("5,120"), 5120);
        assert_eq!(to_bytes("1K"), 1024);
        assert_eq!(to_bytes("2.00K"), 2048);
        assert_eq!(to_bytes("1.5 MiB"), 1_572_864);
        assert_eq!(to_bytes("1G"), 1 << 30);
        assert_eq!(to_bytes("1T"), 1 << 40);
        assert_eq!(to_bytes("1P"), 1 << 50);
    }

    #[test]
    fn add_sums_fields_and_maxes_gen_time() {
        let a = Stats {
            num_files: 10,
            created_files: 5,
            deleted_files: 2,
            reg_transferred: 8,
            total_file_size: 1000,
            total_transferred_size: 900,
            literal_data: 800,
            matched_data: 100,
            reg_files: 8,
            dir_files: 2,
            file_list_size: 100,
            file_list_gen_seconds: 1.5,
            bytes_sent: 950,
            bytes_received: 900,
            created_reg: 5,
            deleted_reg: 2,
            ..Stats::default()
        };
        let b = Stats {
            num_files: 15,
            created_files: 8,
            deleted_files: 1,
            reg_transferred: 12,
            total_file_size: 2000,
            total_transferred_size: 1800,
            literal_data: 1600,
            matched_data: 200,
            reg_files: 12,
            dir_files: 3,
            file_list_size: 150,
            file_list_gen_seconds: 2.3,
            bytes_sent: 1850,
            bytes_received: 1800,
            created_reg: 8,
            deleted_reg: 1,
            ..Stats::default()
        };

        let sum = a.add(b);
        assert_eq!(sum.num_files, 25);
        assert_eq!(sum.created_files, 13);
        assert_eq!(sum.deleted_files, 3);
        assert_eq!(sum.reg_transferred, 20);
        assert_eq!(sum.total_file_size, 3000);
        assert_eq!(sum.total_transferred_size, 2700);
        assert_eq!(sum.literal_data, 2400);
        assert_eq!(sum.matched_data, 300);
        assert_eq!(sum.file_list_size, 250);
        assert!((sum.file_list_gen_seconds - 2.3).abs() < f64::EPSILON);
        assert_eq!(sum.bytes_sent, 2800);
        assert_eq!(sum.bytes_received, 2700);
    }

    #[test]
    fn summary_round_trips_through_parser() {
        let stats = Stats {
            num_files: 25,
            reg_files: 20,
            dir_files: 5,
            link_files: 0,
            created_files: 13,
            created_reg: 13,
            deleted_files: 3,
            deleted_reg: 3,
            reg_transferred: 20,
            total_file_size: 3000,
            total_transferred_size: 2700,
            literal_data: 2400,
            matched_data: 300,
            file_list_size: 250,
            file_list_gen_seconds: 2.3,
            bytes_sent: 2800,
            bytes_received: 2700,
            ..Stats::default()
        };

        let rendered = stats.summary(Duration::from_secs(10));
        let reparsed = parse_stats(rendered.as_bytes()).expect("reparse");

        assert_eq!(reparsed.num_files, stats.num_files);
        assert_eq!(reparsed.reg_files, stats.reg_files);
        assert_eq!(reparsed.dir_files, stats.dir_files);
        assert_eq!(reparsed.created_files, stats.created_files);
        assert_eq!(reparsed.created_reg, stats.created_reg);
        assert_eq!(reparsed.deleted_files, stats.deleted_files);
        assert_eq!(reparsed.deleted_reg, stats.deleted_reg);
        assert_eq!(reparsed.reg_transferred, stats.reg_transferred);
        assert!((reparsed.file_list_gen_seconds - stats.file_list_gen_seconds).abs() < 1e-9);
    }
}
