//! LIST / MLSD / MLST response parser.
//!
//! Supports three formats:
//! 1. **Unix-style** (`ls -l`): `-rwxr-xr-x 1 owner group 1234 Jan  1 12:00 file.txt`
//! 2. **Windows/IIS-style**: `01-01-26  12:00AM       1234 file.txt`
//! 3. **MLSD facts** (RFC 3659): `type=file;size=1234;modify=20260101120000; file.txt`
//!
//! The parser tries MLSD first (if the line contains `=` and `;`), then
//! Unix, then Windows, falling back to an entry with only a name.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use lazy_static::lazy_static;
use pkd_core::{join_remote, Entry, EntryKind};
use regex::Regex;
use std::collections::HashMap;

lazy_static! {
    static ref UNIX_RE: Option<Regex> = Regex::new(
        r"(?x)
        ^([dlcbps-][rwxsStT-]{9})[@+.]?\s+   # permissions (+ ACL marker)
        (\d+)\s+                             # link count
        (\S+)\s+                             # owner
        (\S+)\s+                             # group
        (\d+)\s+                             # size
        (\w{3}\s+\d{1,2}\s+[\d:]+)\s+        # date
        (.+)$                                # filename (possibly with -> target)
        ",
    )
    .ok();
    static ref WINDOWS_RE: Option<Regex> = Regex::new(
        r"(?x)
        ^(\d{2}-\d{2}-\d{2,4})\s+            # date
        (\d{1,2}:\d{2}\s?(?:AM|PM)?)\s+      # time
        (<DIR>|\d+)\s+                       # size or <DIR>
        (.+)$                                # filename
        ",
    )
    .ok();
}

/// Parse a full LIST or MLSD body; entry paths are `dir` + name.
pub fn parse_listing(raw: &str, dir: &str) -> Vec<Entry> {
    raw.lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty())
        .filter(|l| !l.starts_with("total "))
        .filter_map(|line| parse_line(line, dir))
        .filter(|e| e.name != "." && e.name != "..")
        .collect()
}

fn parse_line(line: &str, dir: &str) -> Option<Entry> {
    if line.contains(';') && line.contains('=') && !line.starts_with(['-', 'd', 'l']) {
        // cdir/pdir facts yield None and are dropped.
        return parse_mlsd(line.trim_start(), dir);
    }
    if let Some(e) = parse_unix(line, dir) {
        return Some(e);
    }
    if let Some(e) = parse_windows(line, dir) {
        return Some(e);
    }
    let name = line.trim();
    Some(Entry::new(name, join_remote(dir, name), EntryKind::Other))
}

// ─── MLSD ────────────────────────────────────────────────────────────

/// Parse one MLSD/MLST fact line: `fact1=val1;fact2=val2; filename`.
/// With `dir` empty the name is taken as a full path (MLST replies).
pub fn parse_mlsd(line: &str, dir: &str) -> Option<Entry> {
    let (facts_str, name) = if let Some(pos) = line.find("; ") {
        (&line[..pos + 1], &line[pos + 2..])
    } else if let Some(pos) = line.rfind(' ') {
        (&line[..pos], &line[pos + 1..])
    } else {
        return None;
    };
    if name.is_empty() {
        return None;
    }

    let mut facts: HashMap<String, String> = HashMap::new();
    for segment in facts_str.split(';') {
        if let Some((k, v)) = segment.trim().split_once('=') {
            facts.insert(k.to_lowercase(), v.to_string());
        }
    }

    let kind = match facts.get("type").map(|s| s.to_lowercase()).as_deref() {
        Some("cdir") | Some("pdir") => return None,
        Some("dir") => EntryKind::Directory,
        Some("file") => EntryKind::File,
        Some("os.unix=symlink") | Some("os.unix=slink") => EntryKind::Symlink,
        _ => EntryKind::Other,
    };

    let (display, path) = if dir.is_empty() {
        let base = name.rsplit('/').next().unwrap_or(name).to_string();
        (base, name.to_string())
    } else {
        (name.to_string(), join_remote(dir, name))
    };

    let mut entry = Entry::new(display, path, kind);
    entry.size = facts.get("size").and_then(|v| v.parse::<u64>().ok());
    entry.modified = facts.get("modify").and_then(|v| parse_mlsd_time(v));
    entry.permissions = facts
        .get("unix.mode")
        .and_then(|m| u32::from_str_radix(m.trim_start_matches("0o"), 8).ok());
    Some(entry)
}

/// Parse `YYYYMMDDHHmmSS[.fraction]` (also used for MDTM replies).
pub fn parse_mlsd_time(s: &str) -> Option<DateTime<Utc>> {
    let base = s.get(..14).unwrap_or(s);
    NaiveDateTime::parse_from_str(base, "%Y%m%d%H%M%S")
        .ok()
        .map(|dt| Utc.from_utc_datetime(&dt))
}

// ─── Unix-style ──────────────────────────────────────────────────────

fn parse_unix(line: &str, dir: &str) -> Option<Entry> {
    let caps = UNIX_RE.as_ref()?.captures(line)?;

    let perms = caps.get(1)?.as_str();
    let size = caps.get(5)?.as_str().parse::<u64>().ok();
    let date_str = caps.get(6)?.as_str();
    let name_raw = caps.get(7)?.as_str();

    let kind = match perms.as_bytes().first() {
        Some(b'd') => EntryKind::Directory,
        Some(b'l') => EntryKind::Symlink,
        Some(b'-') => EntryKind::File,
        _ => EntryKind::Other,
    };

    let name = match (kind, name_raw.find(" -> ")) {
        (EntryKind::Symlink, Some(pos)) => &name_raw[..pos],
        _ => name_raw,
    };

    let mut entry = Entry::new(name, join_remote(dir, name), kind);
    entry.size = size;
    entry.modified = parse_unix_date(date_str, Utc::now());
    entry.permissions = Some(mode_bits(&perms[1..]));
    Some(entry)
}

/// `rwxr-xr-x` → `0o755` (setuid/setgid/sticky included).
pub fn mode_bits(perms: &str) -> u32 {
    let b = perms.as_bytes();
    let mut mode = 0u32;
    let at = |i: usize| b.get(i).copied().unwrap_or(b'-');
    for (group, shift) in [(0usize, 6u32), (3, 3), (6, 0)] {
        if at(group) == b'r' {
            mode |= 4 << shift;
        }
        if at(group + 1) == b'w' {
            mode |= 2 << shift;
        }
        match at(group + 2) {
            b'x' => mode |= 1 << shift,
            b's' | b't' => {
                mode |= 1 << shift;
                mode |= special_bit(group);
            }
            b'S' | b'T' => mode |= special_bit(group),
            _ => {}
        }
    }
    mode
}

fn special_bit(group: usize) -> u32 {
    match group {
        0 => 0o4000,
        3 => 0o2000,
        _ => 0o1000,
    }
}

/// Parse "Jan  1 12:00" (within the last six months) or "Jan  1  2025".
fn parse_unix_date(s: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let normalised = s.split_whitespace().collect::<Vec<_>>().join(" ");

    if normalised.contains(':') {
        let with_year = format!("{} {}", now.year(), normalised);
        let dt = NaiveDateTime::parse_from_str(&with_year, "%Y %b %d %H:%M").ok()?;
        let mut dt = Utc.from_utc_datetime(&dt);
        // ls omits the year for recent files; a date ahead of now is last year.
        if dt > now + ChronoDuration::days(1) {
            let prev = NaiveDateTime::parse_from_str(
                &format!("{} {}", now.year() - 1, normalised),
                "%Y %b %d %H:%M",
            )
            .ok()?;
            dt = Utc.from_utc_datetime(&prev);
        }
        return Some(dt);
    }

    let date = NaiveDate::parse_from_str(&normalised, "%b %d %Y").ok()?;
    Some(Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN)))
}

// ─── Windows-style ───────────────────────────────────────────────────

fn parse_windows(line: &str, dir: &str) -> Option<Entry> {
    let caps = WINDOWS_RE.as_ref()?.captures(line)?;

    let date_str = caps.get(1)?.as_str();
    let time_str = caps.get(2)?.as_str();
    let size_or_dir = caps.get(3)?.as_str();
    let name = caps.get(4)?.as_str();

    let (kind, size) = if size_or_dir == "<DIR>" {
        (EntryKind::Directory, None)
    } else {
        (EntryKind::File, size_or_dir.parse::<u64>().ok())
    };

    let mut entry = Entry::new(name, join_remote(dir, name), kind);
    entry.size = size;
    entry.modified = parse_windows_date(date_str, &time_str.replace(' ', ""));
    Some(entry)
}

fn parse_windows_date(date: &str, time: &str) -> Option<DateTime<Utc>> {
    let combined = format!("{} {}", date, time);
    for fmt in ["%m-%d-%y %I:%M%p", "%m-%d-%y %H:%M", "%m-%d-%Y %I:%M%p", "%m-%d-%Y %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(&combined, fmt) {
            return Some(Utc.from_utc_datetime(&dt));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_file() {
        let entries = parse_listing("-rw-r--r--   1 user group  1234 Jan  1  2025 readme.txt", "/pub");
        assert_eq!(entries.len(), 1);
        let e = &entries[0];
        assert_eq!(e.name, "readme.txt");
        assert_eq!(e.path, "/pub/readme.txt");
        assert_eq!(e.kind, EntryKind::File);
        assert_eq!(e.size, Some(1234));
        assert_eq!(e.permissions, Some(0o644));
        assert_eq!(
            e.modified.map(|d| d.date_naive()),
            NaiveDate::from_ymd_opt(2025, 1, 1)
        );
    }

    #[test]
    fn unix_dir_and_total_line() {
        let raw = "total 8\ndrwxr-xr-x   2 root root  4096 Mar  1 09:30 subdir\n";
        let entries = parse_listing(raw, "/");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, EntryKind::Directory);
        assert_eq!(entries[0].path, "/subdir");
        assert_eq!(entries[0].permissions, Some(0o755));
    }

    #[test]
    fn unix_symlink_strips_target() {
        let entries = parse_listing("lrwxrwxrwx   1 root root    22 Jan  5 08:00 link -> /var/target", "/");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, EntryKind::Symlink);
        assert_eq!(entries[0].name, "link");
    }

    #[test]
    fn recent_dates_never_land_in_the_future() {
        let now = Utc.with_ymd_and_hms(2026, 2, 10, 12, 0, 0).unwrap();
        let dt = parse_unix_date("Dec 24 18:30", now).unwrap();
        assert_eq!(dt.year(), 2025);
        let dt = parse_unix_date("Feb  9 08:00", now).unwrap();
        assert_eq!(dt.year(), 2026);
    }

    #[test]
    fn mode_bits_specials() {
        assert_eq!(mode_bits("rwsr-xr-x"), 0o4755);
        assert_eq!(mode_bits("rwxrwxrwt"), 0o1777);
        assert_eq!(mode_bits("rw-r-Sr--"), 0o2644);
        assert_eq!(mode_bits("---------"), 0);
    }

    #[test]
    fn mlsd_facts() {
        let entries = parse_listing(
            "type=file;size=1024;modify=20260101120000;unix.mode=0644; example.bin",
            "/data",
        );
        assert_eq!(entries.len(), 1);
        let e = &entries[0];
        assert_eq!(e.name, "example.bin");
        assert_eq!(e.path, "/data/example.bin");
        assert_eq!(e.size, Some(1024));
        assert_eq!(e.permissions, Some(0o644));
        assert_eq!(
            e.modified,
            Some(Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap())
        );
    }

    #[test]
    fn mlsd_skips_cdir_pdir_and_dots() {
        let raw = "type=cdir;modify=20260101000000; /data\n\
                   type=pdir;modify=20260101000000; /\n\
                   type=dir;; ..\n\
                   type=file;size=10; real.txt";
        let entries = parse_listing(raw, "/data");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "real.txt");
    }

    #[test]
    fn mlsd_missing_size_stays_absent() {
        let entries = parse_listing("type=dir;modify=20260101000000; docs", "/");
        assert_eq!(entries[0].kind, EntryKind::Directory);
        assert_eq!(entries[0].size, None);
    }

    #[test]
    fn mlst_line_with_full_path() {
        let e = parse_mlsd("type=file;size=42; /pub/a.txt", "").unwrap();
        assert_eq!(e.name, "a.txt");
        assert_eq!(e.path, "/pub/a.txt");
        assert_eq!(e.size, Some(42));
    }

    #[test]
    fn windows_entries() {
        let raw = "01-01-26  12:00AM      <DIR> My Documents\n02-15-26  03:04PM       1234 report.pdf";
        let entries = parse_listing(raw, "/");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, EntryKind::Directory);
        assert_eq!(entries[0].name, "My Documents");
        assert_eq!(entries[0].size, None);
        assert_eq!(entries[1].size, Some(1234));
        assert_eq!(entries[1].permissions, None);
        assert_eq!(
            entries[1].modified,
            Some(Utc.with_ymd_and_hms(2026, 2, 15, 15, 4, 0).unwrap())
        );
    }

    #[test]
    fn unknown_format_keeps_name_only() {
        let entries = parse_listing("something odd", "/x");
        assert_eq!(entries[0].kind, EntryKind::Other);
        assert_eq!(entries[0].size, None);
        assert_eq!(entries[0].path, "/x/something odd");
    }
}
