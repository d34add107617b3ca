use std::io::{BufRead, BufReader, Read};

use crate::error::Result;

/// A single regular file reported by `rsync --list-only`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the module root.
    pub path: String,
    /// Size in bytes.
    pub size: u64,
}

/// Parses `rsync --list-only` output. Expected lines look like
///
/// ```text
/// -rw-r--r--        4096 2024/01/01 00:00:00 path/to/file
/// ```
///
/// Some rsync builds insert a hard-link count column before the size.
/// Non-file lines and malformed records are skipped; only reader I/O can
/// fail.
pub fn parse_list<R: Read>(reader: R) -> Result<Vec<FileEntry>> {
    let mut out = Vec::new();
    for line in BufReader::new(reader).lines() {
        let line = line?;
        if !line.starts_with('-') {
            // only regular files
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 {
            continue;
        }
        // Size is fields[1], unless a link count precedes it; a bare integer
        // in fields[1] followed by a parseable fields[2] means the size
        // moved one column to the right.
        let mut size_index = 1;
        if fields.len() >= 6
            && fields[1].parse::<u64>().is_ok()
            && clean_number(fields[2]).parse::<u64>().is_ok()
        {
            size_index = 2;
        }
        let Ok(size) = clean_number(fields[size_index]).parse::<u64>() else {
            continue;
        };
        let path = fields[fields.len() - 1].to_string();
        out.push(FileEntry { path, size });
    }
    Ok(out)
}

/// Strips thousand separators (commas or dots) from a number token.
fn clean_number(s: &str) -> String {
    s.chars().filter(char::is_ascii_digit).collect()
}

#[cfg(test)]
mod tests {
    use super::parse_list;

    #[test]
    fn parses_plain_and_separated_sizes() {
        let sample = "-rw-r--r--        1 4096 2024/01/01 10:00:00 base/1/123\n\
                      -rw-r--r--        1 1,048 2024/01/01 10:00:00 base/1/456\n";
        let files = parse_list(sample.as_bytes()).expect("parse");
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path, "base/1/123");
        assert_eq!(files[0].size, 4096);
        assert_eq!(files[1].size, 1048);
    }

    #[test]
    fn old_format_without_link_count() {
        let sample = "-rw-r--r-- 8192 2024/01/01 10:00:00 base/1/789\n";
        let files = parse_list(sample.as_bytes()).expect("parse");
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].size, 8192);
    }

    #[test]
    fn skips_directories_links_and_malformed() {
        let sample = "drwxr-xr-x          4,096 2024/01/01 10:00:00 base\n\
                      lrwxrwxrwx             12 2024/01/01 10:00:00 pg_wal\n\
                      -rw-r--r-- garbage\n\
                      -rw-r--r-- notasize 2024/01/01 10:00:00 base/oops x\n\
                      -rw-r--r--        512 2024/01/01 10:00:00 base/1/1\n";
        let files = parse_list(sample.as_bytes()).expect("parse");
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "base/1/1");
        assert_eq!(files[0].size, 512);
    }

    #[test]
    fn preserves_input_order() {
        let sample = "-rw-r--r-- 2 2024/01/01 10:00:00 b\n\
                      -rw-r--r-- 1 2024/01/01 10:00:00 a\n";
        let files = parse_list(sample.as_bytes()).expect("parse");
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, ["b", "a"]);
    }
}
