//! Reading `/proc/self/mountinfo`.

use std::path::{Path, PathBuf};

/// One line of `/proc/self/mountinfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub mount_id: u32,
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub source: String,
    /// Per-superblock options, e.g. `upperdir=/x`
    pub super_options: Vec<(String, Option<String>)>,
}

impl MountEntry {
    /// Value of the superblock option `key`, if present.
    pub fn option(&self, key: &str) -> Option<&str> {
        self.super_options
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_deref())
    }
}

/// Undoes the octal escaping the kernel applies to spaces, tabs, newlines
/// and backslashes.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = std::str::from_utf8(&bytes[i + 1..i + 4]).ok();
            if let Some(value) = digits.and_then(|d| u8::from_str_radix(d, 8).ok()) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn parse_line(line: &str) -> Option<MountEntry> {
    let (head, tail) = line.split_once(" - ")?;
    let head: Vec<&str> = head.split_whitespace().collect();
    if head.len() < 6 {
        return None;
    }
    let mut tail = tail.split_whitespace();
    let fs_type = tail.next()?.to_string();
    let source = unescape(tail.next()?);
    let super_options = tail
        .next()
        .unwrap_or("")
        .split(',')
        .filter(|opt| !opt.is_empty())
        .map(|opt| match opt.split_once('=') {
            Some((k, v)) => (k.to_string(), Some(unescape(v))),
            None => (opt.to_string(), None),
        })
        .collect();

    Some(MountEntry {
        mount_id: head[0].parse().ok()?,
        mount_point: PathBuf::from(unescape(head[4])),
        fs_type,
        source,
        super_options,
    })
}

/// Parses the contents of a mountinfo file, skipping malformed lines.
pub fn parse(text: &str) -> Vec<MountEntry> {
    text.lines().filter_map(parse_line).collect()
}

/// Reads the calling process's mount table.
pub fn read_self() -> std::io::Result<Vec<MountEntry>> {
    let text = std::fs::read_to_string("/proc/self/mountinfo")?;
    Ok(parse(&text))
}

/// Finds the mount `path` lives on: the longest mount point that prefixes
/// it, the most recent one winning when a point is mounted over.
pub fn find_mount<'a>(entries: &'a [MountEntry], path: &Path) -> Option<&'a MountEntry> {
    let mut best: Option<&MountEntry> = None;
    for entry in entries {
        if !path.starts_with(&entry.mount_point) {
            continue;
        }
        let better = match best {
            None => true,
            Some(current) => {
                entry.mount_point.as_os_str().len() >= current.mount_point.as_os_str().len()
            }
        };
        if better {
            best = Some(entry);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw,errors=remount-ro
35 22 0:31 / /proc rw,nosuid - proc proc rw
60 22 0:52 / /var/lib/merged rw,relatime - overlay overlay rw,lowerdir=/l1:/l2,upperdir=/var/upper,workdir=/var/work
61 22 0:53 / /mnt/with\\040space rw - tmpfs tmpfs rw,size=1024k
";

    #[test]
    fn test_parse_sample() {
        let entries = parse(SAMPLE);
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].fs_type, "ext4");
        assert_eq!(entries[0].option("errors"), Some("remount-ro"));
        assert_eq!(entries[2].option("upperdir"), Some("/var/upper"));
        assert_eq!(entries[2].option("lowerdir"), Some("/l1:/l2"));
        assert_eq!(entries[3].mount_point, PathBuf::from("/mnt/with space"));
    }

    #[test]
    fn test_find_mount_longest_prefix() {
        let entries = parse(SAMPLE);
        let found = find_mount(&entries, Path::new("/var/lib/merged/sub/dir")).unwrap();
        assert_eq!(found.fs_type, "overlay");
        let found = find_mount(&entries, Path::new("/home/user")).unwrap();
        assert_eq!(found.fs_type, "ext4");
        let found = find_mount(&entries, Path::new("/var/lib/mergedx")).unwrap();
        assert_eq!(found.fs_type, "ext4");
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let entries = parse("garbage\n1 2 3\n");
        assert!(entries.is_empty());
    }
}
