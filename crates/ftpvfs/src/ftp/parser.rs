//! LIST response parser.
//!
//! Supports three formats:
//! 1. **Unix-style** (`ls -l`): `-rwxr-xr-x 1 owner group 1234 Jan  1 12:00 file.txt`
//! 2. **Windows/IIS-style**: `01-01-26  12:00AM       1234 file.txt`
//! 3. **NetWare** fixed columns: type at 0, size from 35, date at 51..63,
//!    name from 64
//!
//! NetWare servers are recognised from SYST; everyone else gets Unix
//! first, then Windows. Lines matching neither are skipped.

use crate::ftp::types::{FileInfo, FileKind, ServerDialect};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref UNIX_LINE: Regex = Regex::new(
        r"(?x)
        ^([dlcbps-][rwxsStT-]{9})[+.@]?\s+  # permissions (optional ACL marker)
        (\d+)\s+                             # link count
        (\S+)\s+                             # owner
        (\S+)\s+                             # group
        (\d+|\d+,\s*\d+)\s+                  # size, or major, minor
        (\w{3}\s+\d{1,2}\s+[\d:]+)\s         # date
        (.+)$                                # filename (possibly with -> target)
        ",
    )
    .unwrap();
    static ref WINDOWS_LINE: Regex = Regex::new(
        r"(?x)
        ^(\d{2}-\d{2}-\d{2,4})\s+            # date
        (\d{1,2}:\d{2}(?:AM|PM)?)\s+         # time
        (<DIR>|\d+)\s+                       # size or <DIR>
        (.+)$                                # filename
        ",
    )
    .unwrap();
}

/// Parse a full LIST body into entries, dropping `.` and `..`.
pub fn parse_listing(raw: &str, dialect: ServerDialect) -> Vec<FileInfo> {
    raw.lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.trim().is_empty() && !is_total_line(l))
        .filter_map(|line| {
            let parsed = parse_line(line, dialect);
            if parsed.is_none() {
                log::debug!("Skipping unparsable listing line: {:?}", line);
            }
            parsed
        })
        .filter(|e| e.name != "." && e.name != "..")
        .collect()
}

/// Parse a single line from a listing.
pub fn parse_line(line: &str, dialect: ServerDialect) -> Option<FileInfo> {
    if dialect == ServerDialect::NetWare {
        return parse_netware(line);
    }
    parse_unix(line).or_else(|| parse_windows(line))
}

fn is_total_line(line: &str) -> bool {
    line.starts_with("total ")
}

// ─── Unix-style parser ───────────────────────────────────────────────

/// Parse a Unix `ls -l` line:
/// ```text
/// drwxr-xr-x   2 user group  4096 Jan  1 12:00 dirname
/// -rw-r--r--   1 user group  1234 Jan  1  2025 file.txt
/// lrwxrwxrwx   1 user group    42 Jan  1 12:00 link -> target
/// ```
fn parse_unix(line: &str) -> Option<FileInfo> {
    let caps = UNIX_LINE.captures(line)?;

    let perms = caps.get(1)?.as_str();
    let size_str = caps.get(5)?.as_str();
    let date_str = caps.get(6)?.as_str();
    let name_raw = caps.get(7)?.as_str().trim_start();

    let kind = match perms.as_bytes().first() {
        Some(b'd') => FileKind::Directory,
        Some(b'l') => FileKind::Symlink,
        Some(b'-') => FileKind::Regular,
        _ => FileKind::Unknown,
    };

    let (name, symlink_target) = match (kind, name_raw.find(" -> ")) {
        (FileKind::Symlink, Some(pos)) => (
            name_raw[..pos].to_string(),
            Some(name_raw[pos + 4..].to_string()),
        ),
        _ => (name_raw.to_string(), None),
    };
    // A few servers print the whole path for `LIST -L` on a single file.
    let name = match name.rfind('/') {
        Some(pos) if pos + 1 < name.len() => name[pos + 1..].to_string(),
        _ => name,
    };

    let size = if size_str.contains(',') {
        None
    } else {
        size_str.parse::<u64>().ok()
    };

    Some(FileInfo {
        name,
        kind,
        size,
        modified: parse_unix_date(date_str, Utc::now()),
        permissions: Some(mode_bits(perms)),
        owner: caps.get(3).map(|m| m.as_str().to_string()),
        group: caps.get(4).map(|m| m.as_str().to_string()),
        symlink_target,
    })
}

/// `rwxr-x---` style string (type character first) to permission bits.
fn mode_bits(perms: &str) -> u32 {
    let b = perms.as_bytes();
    let mut mode = 0u32;
    let flag = |i: usize, bit: u32| if b.get(i).map_or(false, |c| *c != b'-') { bit } else { 0 };
    mode |= flag(1, 0o400) | flag(2, 0o200);
    mode |= flag(4, 0o040) | flag(5, 0o020);
    mode |= flag(7, 0o004) | flag(8, 0o002);
    for (i, exec, special) in [(3, 0o100, 0o4000), (6, 0o010, 0o2000), (9, 0o001, 0o1000)] {
        match b.get(i) {
            Some(b'x') => mode |= exec,
            Some(b's') | Some(b't') => mode |= exec | special,
            Some(b'S') | Some(b'T') => mode |= special,
            _ => {}
        }
    }
    mode
}

/// Parse the date portion: "Jan  1 12:00" or "Jan  1  2025".
/// Dates without a year that would land in the future belong to last year.
fn parse_unix_date(s: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let normalised = s.split_whitespace().collect::<Vec<_>>().join(" ");

    if normalised.contains(':') {
        let in_year = |year: i32| {
            NaiveDateTime::parse_from_str(&format!("{} {}", year, normalised), "%Y %b %d %H:%M")
                .ok()
                .map(|dt| Utc.from_utc_datetime(&dt))
        };
        // Feb 29 does not parse in a non-leap current year
        return match in_year(now.year()) {
            Some(dt) if dt <= now + Duration::days(1) => Some(dt),
            _ => in_year(now.year() - 1),
        };
    }

    let date = NaiveDate::parse_from_str(&normalised, "%b %d %Y").ok()?;
    Some(Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN)))
}

// ─── Windows-style parser ────────────────────────────────────────────

/// Parse Windows / IIS style line:
/// ```text
/// 01-01-26  12:00AM       1234 file.txt
/// 01-01-26  12:00PM      <DIR> Directory Name
/// ```
fn parse_windows(line: &str) -> Option<FileInfo> {
    let caps = WINDOWS_LINE.captures(line)?;

    let date_str = caps.get(1)?.as_str();
    let time_str = caps.get(2)?.as_str();
    let size_or_dir = caps.get(3)?.as_str();
    let name = caps.get(4)?.as_str().to_string();

    let mut info = if size_or_dir == "<DIR>" {
        FileInfo::directory(name)
    } else {
        let mut f = FileInfo::new(name, FileKind::Regular);
        f.size = size_or_dir.parse::<u64>().ok();
        f
    };
    info.modified = parse_windows_date(date_str, time_str);
    Some(info)
}

fn parse_windows_date(date: &str, time: &str) -> Option<DateTime<Utc>> {
    let combined = format!("{} {}", date, time);
    let year = if date.len() > 8 { "%Y" } else { "%y" };
    for fmt in [format!("%m-%d-{} %I:%M%p", year), format!("%m-%d-{} %H:%M", year)] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(&combined, &fmt) {
            return Some(Utc.from_utc_datetime(&dt));
        }
    }
    None
}

// ─── NetWare parser ──────────────────────────────────────────────────

const NETWARE_SIZE_COL: usize = 35;
const NETWARE_DATE_COL: usize = 51;
const NETWARE_DATE_LEN: usize = 12;
const NETWARE_NAME_COL: usize = 64;

/// Parse a NetWare line by column:
/// ```text
/// d [RWCEAFMS] supervisor                      512 Jan 16 18:53  login
/// ```
fn parse_netware(line: &str) -> Option<FileInfo> {
    let name = line.get(NETWARE_NAME_COL..)?.trim_end();
    if name.is_empty() {
        return None;
    }
    let kind = match line.as_bytes().first() {
        Some(b'd') => FileKind::Directory,
        Some(b'-') => FileKind::Regular,
        _ => FileKind::Unknown,
    };

    let mut info = FileInfo::new(name, kind);
    info.size = line
        .get(NETWARE_SIZE_COL..)
        .map(|s| s.trim_start())
        .map(|s| s.split(|c: char| !c.is_ascii_digit()).next().unwrap_or(""))
        .and_then(|digits| digits.parse::<u64>().ok());
    info.modified = line
        .get(NETWARE_DATE_COL..NETWARE_DATE_COL + NETWARE_DATE_LEN)
        .and_then(|d| parse_unix_date(d, Utc::now()));
    info.permissions = Some(0o777);
    Some(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unix(raw: &str) -> Vec<FileInfo> {
        parse_listing(raw, ServerDialect::Unix)
    }

    #[test]
    fn test_unix_file() {
        let entries = unix("-rw-r--r--   1 user group  1234 Jan  1 12:00 readme.txt");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "readme.txt");
        assert_eq!(entries[0].kind, FileKind::Regular);
        assert_eq!(entries[0].size, Some(1234));
        assert_eq!(entries[0].permissions, Some(0o644));
        assert_eq!(entries[0].owner.as_deref(), Some("user"));
    }

    #[test]
    fn test_unix_dir_and_total_line() {
        let raw = "total 8\r\ndrwxr-xr-x   2 root root  4096 Mar  1 09:30 subdir\r\n";
        let entries = unix(raw);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, FileKind::Directory);
        assert_eq!(entries[0].permissions, Some(0o755));
    }

    #[test]
    fn test_unix_symlink() {
        let entries = unix("lrwxrwxrwx   1 root root    22 Jan  5 08:00 link -> /var/target");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, FileKind::Symlink);
        assert_eq!(entries[0].name, "link");
        assert_eq!(entries[0].symlink_target.as_deref(), Some("/var/target"));
    }

    #[test]
    fn test_unix_name_with_spaces_and_year() {
        let entries = unix("-rw-r--r--   1 u g  10 Feb 29  2024 my file.txt");
        assert_eq!(entries[0].name, "my file.txt");
        let modified = entries[0].modified.unwrap();
        assert_eq!((modified.year(), modified.month(), modified.day()), (2024, 2, 29));
    }

    #[test]
    fn test_unix_acl_marker_and_setuid() {
        let entries = unix("-rwsr-xr-x+  1 root root  100 Jan  1  2020 su");
        assert_eq!(entries[0].permissions, Some(0o4755));
    }

    #[test]
    fn test_filters_dots() {
        let raw = "drwxr-xr-x 2 u g 4096 Jan  1 12:00 .\n\
                   drwxr-xr-x 2 u g 4096 Jan  1 12:00 ..\n\
                   -rw-r--r-- 1 u g 10 Jan  1 12:00 real.txt";
        let entries = unix(raw);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "real.txt");
    }

    #[test]
    fn test_garbage_is_skipped() {
        assert!(unix("this is not a listing").is_empty());
    }

    #[test]
    fn test_windows_dir() {
        let entries = unix("01-01-26  12:00AM      <DIR> My Documents");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, FileKind::Directory);
        assert_eq!(entries[0].name, "My Documents");
    }

    #[test]
    fn test_windows_file() {
        let entries = unix("03-15-2024  01:30PM       2048 report.pdf");
        assert_eq!(entries[0].kind, FileKind::Regular);
        assert_eq!(entries[0].size, Some(2048));
        assert_eq!(entries[0].modified.map(|m| m.year()), Some(2024));
    }

    #[test]
    fn test_future_date_rolls_back_a_year() {
        let now = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
        let dt = parse_unix_date("Dec 24 18:00", now).unwrap();
        assert_eq!(dt.year(), 2025);
        let dt = parse_unix_date("Jan  9 18:00", now).unwrap();
        assert_eq!(dt.year(), 2026);
    }

    #[test]
    fn test_leap_day_in_non_leap_year() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let dt = parse_unix_date("Feb 29 12:00", now).unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap());

        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let dt = parse_unix_date("Feb 29 12:00", now).unwrap();
        assert_eq!(dt.year(), 2024);

        let entries = unix("-rw-r--r--   1 owner group   7 Feb 29 12:00 leap.txt");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "leap.txt");
    }

    fn netware_line(kind: char, size: u64, date: &str, name: &str) -> String {
        format!("{:<35}{:>15} {:<13}{}", format!("{} [RWCEAFMS] supervisor", kind), size, date, name)
    }

    #[test]
    fn test_netware_columns() {
        let raw = format!(
            "total 0\n{}\n{}\n",
            netware_line('d', 512, "Jan 16 18:53", "login"),
            netware_line('-', 73_421, "Mar  3  2019", "system.cfg")
        );
        let entries = parse_listing(&raw, ServerDialect::NetWare);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "login");
        assert_eq!(entries[0].kind, FileKind::Directory);
        assert_eq!(entries[1].name, "system.cfg");
        assert_eq!(entries[1].size, Some(73_421));
        assert_eq!(entries[1].modified.map(|m| m.year()), Some(2019));
    }

    #[test]
    fn test_netware_short_line_skipped() {
        assert!(parse_listing("d [RWCEAFMS] x", ServerDialect::NetWare).is_empty());
    }
}
