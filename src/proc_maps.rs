//! Minimal `/proc/<pid>/maps` parsing.
//!
//! spec.md §1 lists maps parsing as an assumed external collaborator, but
//! no crate in the example corpus provides it, so this is a small
//! self-contained reader of the well-known text format — one line per
//! mapping, `start-end perms offset dev inode pathname`.

use std::fs;
use std::io;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapEntry {
    pub begin: u64,
    pub end: u64,
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    pub shared: bool,
    pub offset: u64,
    pub desc: String,
}

impl MapEntry {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.begin && addr < self.end
    }

    pub fn size(&self) -> u64 {
        self.end - self.begin
    }
}

pub fn read_maps(pid: libc::pid_t) -> io::Result<Vec<MapEntry>> {
    let text = fs::read_to_string(format!("/proc/{}/maps", pid))?;
    Ok(parse_maps(&text))
}

pub fn parse_maps(text: &str) -> Vec<MapEntry> {
    text.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<MapEntry> {
    // ADDR_RANGE PERMS OFFSET DEV INODE [PATHNAME]
    let mut fields = line.splitn(6, char::is_whitespace).filter(|s| !s.is_empty());
    let range = fields.next()?;
    let perms = fields.next()?;
    let offset = fields.next()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;
    let desc = fields.next().unwrap_or("").trim().to_string();

    let (begin_s, end_s) = range.split_once('-')?;
    let begin = u64::from_str_radix(begin_s, 16).ok()?;
    let end = u64::from_str_radix(end_s, 16).ok()?;
    let offset = u64::from_str_radix(offset, 16).ok()?;

    let mut perm_chars = perms.chars();
    let read = perm_chars.next()? == 'r';
    let write = perm_chars.next()? == 'w';
    let exec = perm_chars.next()? == 'x';
    let shared = perm_chars.next()? == 's';

    Some(MapEntry {
        begin,
        end,
        read,
        write,
        exec,
        shared,
        offset,
        desc,
    })
}

/// `split_once` was stabilized in a later edition than this crate targets;
/// provide it for `&str` so `parse_line` stays readable.
trait SplitOnce {
    fn split_once(&self, delim: char) -> Option<(&str, &str)>;
}

impl SplitOnce for str {
    fn split_once(&self, delim: char) -> Option<(&str, &str)> {
        let idx = self.find(delim)?;
        Some((&self[..idx], &self[idx + delim.len_utf8()..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
00400000-00401000 r-xp 00000000 08:01 123456                           /bin/true
00601000-00602000 rw-p 00001000 08:01 123456                           /bin/true
7ffff7ffa000-7ffff7ffd000 r--p 00000000 00:00 0                        [vvar]
7ffff7ffd000-7ffff7fff000 r-xp 00000000 00:00 0                        [vdso]
7fffffffd000-7ffffffff000 rw-p 00000000 00:00 0                        [stack]
";

    #[test]
    fn parses_all_lines() {
        let maps = parse_maps(SAMPLE);
        assert_eq!(maps.len(), 5);
        assert_eq!(maps[0].begin, 0x0040_0000);
        assert_eq!(maps[0].end, 0x0040_1000);
        assert!(maps[0].read && !maps[0].write && maps[0].exec);
        assert_eq!(maps[0].desc, "/bin/true");
    }

    #[test]
    fn identifies_named_regions() {
        let maps = parse_maps(SAMPLE);
        assert!(maps.iter().any(|m| m.desc == "[vdso]"));
        assert!(maps.iter().any(|m| m.desc == "[vvar]"));
        assert!(maps.iter().any(|m| m.desc == "[stack]"));
    }

    #[test]
    fn contains_is_half_open() {
        let maps = parse_maps(SAMPLE);
        let text = &maps[0];
        assert!(text.contains(0x0040_0000));
        assert!(!text.contains(0x0040_1000));
    }
}
