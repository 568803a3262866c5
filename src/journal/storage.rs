//! File-level journal storage.
//!
//! Each UTC day has a log file `YYYY-MM-DD.json` holding one JSON line per
//! completed job, and a sidecar `YYYY-MM-DD.json.sha256` holding the hex
//! SHA-256 of each log line (newline included) at the same line number.
//! A line whose hash could not be written gets a `-` placeholder in the
//! sidecar once the sidecar is writable again, so later rows stay aligned.
//! Closed days are gzipped into the archive directory.
//!
//! Everything here is blocking IO; async callers go through
//! `spawn_blocking`.

use chrono::{DateTime, NaiveDate, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::entry::sha256_hex;
use super::JournalError;

const LOG_SUFFIX: &str = ".json";
/// Sidecar row for a line whose hash was never recorded.
pub const MISSING_HASH: &str = "-";
const SIDECAR_SUFFIX: &str = ".json.sha256";
const DAY_FORMAT: &str = "%Y-%m-%d";

/// Where a verified day's files were found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileLocation {
    Active,
    Archive,
}

/// Result of re-hashing one day's log against its sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub day: String,
    pub exists: bool,
    pub location: Option<FileLocation>,
    /// Log lines whose hash equals the sidecar entry at the same position.
    pub matched: usize,
    /// Log lines whose hash differs from the sidecar entry at the same position.
    pub mismatched: usize,
    /// Log lines whose sidecar row is the [`MISSING_HASH`] placeholder.
    pub unhashed: usize,
    /// Lines present on one side only.
    pub unpaired: usize,
}

impl VerifyReport {
    fn missing(day: NaiveDate) -> Self {
        Self {
            day: day.format(DAY_FORMAT).to_string(),
            exists: false,
            location: None,
            matched: 0,
            mismatched: 0,
            unhashed: 0,
            unpaired: 0,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.exists && self.mismatched == 0 && self.unhashed == 0 && self.unpaired == 0
    }
}

/// Days handled by one archive pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveReport {
    pub archived: Vec<String>,
    /// Days whose archive already existed.
    pub skipped: Vec<String>,
}

/// Paths of the journal directories. Cheap to clone.
#[derive(Debug, Clone)]
pub struct JournalLayout {
    raw_dir: PathBuf,
    archive_dir: PathBuf,
}

impl JournalLayout {
    pub fn new(raw_dir: impl Into<PathBuf>, archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            raw_dir: raw_dir.into(),
            archive_dir: archive_dir.into(),
        }
    }

    /// Creates both directories if needed.
    pub fn ensure_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(&self.raw_dir)?;
        fs::create_dir_all(&self.archive_dir)
    }

    pub fn raw_dir(&self) -> &Path {
        &self.raw_dir
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    pub fn log_path(&self, day: NaiveDate) -> PathBuf {
        self.raw_dir.join(log_name(day))
    }

    pub fn sidecar_path(&self, day: NaiveDate) -> PathBuf {
        self.raw_dir.join(sidecar_name(day))
    }

    pub fn archived_log_path(&self, day: NaiveDate) -> PathBuf {
        self.archive_dir.join(format!("{}.gz", log_name(day)))
    }

    pub fn archived_sidecar_path(&self, day: NaiveDate) -> PathBuf {
        self.archive_dir.join(format!("{}.gz", sidecar_name(day)))
    }

    /// Days with a log file in the active directory, oldest first.
    pub fn active_days(&self) -> io::Result<Vec<NaiveDate>> {
        let mut days = Vec::new();
        if !self.raw_dir.is_dir() {
            return Ok(days);
        }
        for entry in fs::read_dir(&self.raw_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(day) = parse_log_name(name) {
                days.push(day);
            }
        }
        days.sort();
        Ok(days)
    }

    /// Re-hashes every line of `day` and compares it with the sidecar.
    ///
    /// The active copy is preferred; the archived copy is read when the
    /// active one is gone.
    pub fn verify_day(&self, day: NaiveDate) -> Result<VerifyReport, JournalError> {
        let (log, hashes, location) = if self.log_path(day).is_file() {
            let log = fs::read(self.log_path(day))?;
            let hashes = read_optional(&self.sidecar_path(day))?;
            (log, hashes, FileLocation::Active)
        } else if self.archived_log_path(day).is_file() {
            let log = read_gz(&self.archived_log_path(day))?;
            let sidecar = self.archived_sidecar_path(day);
            let hashes = if sidecar.is_file() {
                read_gz(&sidecar)?
            } else {
                Vec::new()
            };
            (log, hashes, FileLocation::Archive)
        } else {
            return Ok(VerifyReport::missing(day));
        };

        let lines: Vec<&[u8]> = log.split_inclusive(|b| *b == b'\n').collect();
        let expected: Vec<String> = String::from_utf8_lossy(&hashes)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();

        let mut matched = 0;
        let mut mismatched = 0;
        let mut unhashed = 0;
        for (line, hash) in lines.iter().zip(expected.iter()) {
            if hash == MISSING_HASH {
                unhashed += 1;
            } else if sha256_hex(line) == *hash {
                matched += 1;
            } else {
                mismatched += 1;
            }
        }
        let unpaired = lines.len().abs_diff(expected.len());

        if mismatched > 0 || unhashed > 0 || unpaired > 0 {
            warn!(
                day = %day,
                matched = matched,
                mismatched = mismatched,
                unhashed = unhashed,
                unpaired = unpaired,
                "Journal verification found damaged lines"
            );
        }

        Ok(VerifyReport {
            day: day.format(DAY_FORMAT).to_string(),
            exists: true,
            location: Some(location),
            matched,
            mismatched,
            unhashed,
            unpaired,
        })
    }

    /// Gzips every active day other than `today` into the archive directory
    /// and removes the originals. Days already archived are skipped.
    pub fn archive_older_days(&self, today: NaiveDate) -> Result<ArchiveReport, JournalError> {
        fs::create_dir_all(&self.archive_dir)?;
        let mut report = ArchiveReport::default();

        for day in self.active_days()? {
            if day == today {
                continue;
            }
            let label = day.format(DAY_FORMAT).to_string();
            let dest = self.archived_log_path(day);
            if dest.exists() {
                debug!(day = %label, "Archive already present, skipping");
                report.skipped.push(label);
                continue;
            }

            let sidecar = self.sidecar_path(day);
            if sidecar.is_file() {
                gzip_file(&sidecar, &self.archived_sidecar_path(day))?;
            }
            // The log archive is written last: its presence marks the day done.
            gzip_file(&self.log_path(day), &dest)?;

            fs::remove_file(self.log_path(day))?;
            if sidecar.is_file() {
                fs::remove_file(&sidecar)?;
            }
            info!(day = %label, dest = %dest.display(), "Archived journal day");
            report.archived.push(label);
        }

        Ok(report)
    }
}

struct ActiveDay {
    day: NaiveDate,
    log: File,
    sidecar: File,
    /// Lines written whose hash is not yet in the sidecar.
    missing_hashes: usize,
}

/// Appends lines to the current day's file pair.
///
/// The active day only moves forward: a clock that steps backwards keeps
/// writing to the newest day already opened, so a rotated-past file is
/// never reopened for append.
pub struct JournalWriter {
    layout: JournalLayout,
    active: Option<ActiveDay>,
}

impl JournalWriter {
    pub fn open(layout: JournalLayout) -> Result<Self, JournalError> {
        layout.ensure_dirs()?;
        Ok(Self {
            layout,
            active: None,
        })
    }

    pub fn layout(&self) -> &JournalLayout {
        &self.layout
    }

    pub fn active_day(&self) -> Option<NaiveDate> {
        self.active.as_ref().map(|a| a.day)
    }

    fn rotate_for(&mut self, now: DateTime<Utc>) -> Result<&mut ActiveDay, JournalError> {
        let today = now.date_naive();
        let needs_open = match &self.active {
            Some(active) => today > active.day,
            None => true,
        };

        if needs_open {
            fs::create_dir_all(self.layout.raw_dir())?;
            let log = open_append(&self.layout.log_path(today))?;
            let sidecar = open_append(&self.layout.sidecar_path(today))?;
            if let Some(prev) = self.active.as_ref() {
                info!(from = %prev.day, to = %today, "Rotated journal day");
            }
            self.active = Some(ActiveDay {
                day: today,
                log,
                sidecar,
                missing_hashes: 0,
            });
        }

        self.active
            .as_mut()
            .ok_or_else(|| JournalError::Io(io::Error::other("journal day not open")))
    }

    /// Appends one line using the current time.
    pub fn append_line(&mut self, line: &str) -> Result<(), JournalError> {
        self.append_line_at(line, Utc::now())
    }

    /// Appends one line as if written at `now`.
    ///
    /// The log write is locked, flushed and synced before the hash is
    /// appended to the sidecar. A sidecar failure is reported as
    /// [`JournalError::Sidecar`]: the line itself is already durable and
    /// must not be written again. The next successful sidecar write puts a
    /// [`MISSING_HASH`] row in its place first.
    pub fn append_line_at(&mut self, line: &str, now: DateTime<Utc>) -> Result<(), JournalError> {
        let mut owned;
        let line = if line.ends_with('\n') {
            line
        } else {
            owned = String::with_capacity(line.len() + 1);
            owned.push_str(line);
            owned.push('\n');
            owned.as_str()
        };

        let active = self.rotate_for(now)?;

        active.log.lock()?;
        let written = write_synced(&mut active.log, line.as_bytes());
        let unlocked = active.log.unlock();
        written?;
        unlocked?;

        let mut rows = String::new();
        for _ in 0..active.missing_hashes {
            rows.push_str(MISSING_HASH);
            rows.push('\n');
        }
        rows.push_str(&sha256_hex(line.as_bytes()));
        rows.push('\n');

        match active
            .sidecar
            .write_all(rows.as_bytes())
            .and_then(|_| active.sidecar.flush())
        {
            Ok(()) => {
                active.missing_hashes = 0;
                Ok(())
            }
            Err(e) => {
                active.missing_hashes += 1;
                Err(JournalError::Sidecar(e))
            }
        }
    }
}

fn write_synced(file: &mut File, bytes: &[u8]) -> io::Result<()> {
    file.write_all(bytes)?;
    file.flush()?;
    file.sync_all()
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn log_name(day: NaiveDate) -> String {
    format!("{}{}", day.format(DAY_FORMAT), LOG_SUFFIX)
}

fn sidecar_name(day: NaiveDate) -> String {
    format!("{}{}", day.format(DAY_FORMAT), SIDECAR_SUFFIX)
}

fn parse_log_name(name: &str) -> Option<NaiveDate> {
    let stem = name.strip_suffix(LOG_SUFFIX)?;
    NaiveDate::parse_from_str(stem, DAY_FORMAT).ok()
}

/// Parses a `YYYY-MM-DD` day label.
pub fn parse_day(label: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(label.trim(), DAY_FORMAT).ok()
}

fn read_optional(path: &Path) -> io::Result<Vec<u8>> {
    match fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

fn read_gz(path: &Path) -> io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(File::open(path)?);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Compresses `src` to `dest` through a temporary file so a crash never
/// leaves a truncated archive under the final name.
fn gzip_file(src: &Path, dest: &Path) -> io::Result<()> {
    let tmp = dest.with_extension("gz.partial");
    {
        let mut input = File::open(src)?;
        let output = File::create(&tmp)?;
        let mut encoder = GzEncoder::new(output, Compression::default());
        io::copy(&mut input, &mut encoder)?;
        let output = encoder.finish()?;
        output.sync_all()?;
    }
    fs::rename(&tmp, dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn layout(dir: &TempDir) -> JournalLayout {
        JournalLayout::new(dir.path().join("raw"), dir.path().join("raw/archive"))
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, hour, 0, 0).unwrap()
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, day).unwrap()
    }

    #[test]
    fn test_append_writes_paired_hashes() {
        let dir = TempDir::new().unwrap();
        let mut writer = JournalWriter::open(layout(&dir)).unwrap();
        writer.append_line_at("{\"a\":1}\n", at(1, 10)).unwrap();
        writer.append_line_at("{\"a\":2}", at(1, 11)).unwrap();

        let log = fs::read_to_string(writer.layout().log_path(date(1))).unwrap();
        assert_eq!(log, "{\"a\":1}\n{\"a\":2}\n");

        let sidecar = fs::read_to_string(writer.layout().sidecar_path(date(1))).unwrap();
        let hashes: Vec<&str> = sidecar.lines().collect();
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes[0], sha256_hex(b"{\"a\":1}\n"));

        let report = writer.layout().verify_day(date(1)).unwrap();
        assert!(report.is_ok());
        assert_eq!(report.matched, 2);
        assert_eq!(report.location, Some(FileLocation::Active));
    }

    #[test]
    fn test_rotation_never_moves_backwards() {
        let dir = TempDir::new().unwrap();
        let mut writer = JournalWriter::open(layout(&dir)).unwrap();
        writer.append_line_at("one", at(1, 23)).unwrap();
        writer.append_line_at("two", at(2, 0)).unwrap();
        assert_eq!(writer.active_day(), Some(date(2)));

        // Clock steps back: line lands in the newer day.
        writer.append_line_at("three", at(1, 23)).unwrap();
        assert_eq!(writer.active_day(), Some(date(2)));

        let day1 = fs::read_to_string(writer.layout().log_path(date(1))).unwrap();
        let day2 = fs::read_to_string(writer.layout().log_path(date(2))).unwrap();
        assert_eq!(day1, "one\n");
        assert_eq!(day2, "two\nthree\n");
        assert_eq!(writer.layout().active_days().unwrap(), vec![date(1), date(2)]);
    }

    #[test]
    fn test_single_byte_corruption_is_one_mismatch() {
        let dir = TempDir::new().unwrap();
        let mut writer = JournalWriter::open(layout(&dir)).unwrap();
        for i in 0..5 {
            writer
                .append_line_at(&format!("{{\"n\":{}}}", i), at(4, 9))
                .unwrap();
        }
        let path = writer.layout().log_path(date(4));
        let mut bytes = fs::read(&path).unwrap();
        // Second line starts at byte 8; flip its digit.
        let pos = bytes.iter().position(|b| *b == b'1').unwrap();
        bytes[pos] = b'9';
        fs::write(&path, bytes).unwrap();

        let report = writer.layout().verify_day(date(4)).unwrap();
        assert_eq!(report.matched, 4);
        assert_eq!(report.mismatched, 1);
        assert_eq!(report.unpaired, 0);
        assert!(!report.is_ok());
    }

    #[test]
    fn test_missing_sidecar_lines_are_unpaired() {
        let dir = TempDir::new().unwrap();
        let layout = layout(&dir);
        layout.ensure_dirs().unwrap();
        fs::write(layout.log_path(date(5)), "x\ny\n").unwrap();
        fs::write(
            layout.sidecar_path(date(5)),
            format!("{}\n", sha256_hex(b"x\n")),
        )
        .unwrap();

        let report = layout.verify_day(date(5)).unwrap();
        assert_eq!(report.matched, 1);
        assert_eq!(report.unpaired, 1);
    }

    #[test]
    fn test_verify_missing_day() {
        let dir = TempDir::new().unwrap();
        let report = layout(&dir).verify_day(date(9)).unwrap();
        assert!(!report.exists);
        assert!(!report.is_ok());
    }

    #[test]
    fn test_archive_moves_closed_days_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut writer = JournalWriter::open(layout(&dir)).unwrap();
        writer.append_line_at("old", at(1, 12)).unwrap();
        writer.append_line_at("new", at(2, 12)).unwrap();
        let layout = writer.layout().clone();

        let report = layout.archive_older_days(date(2)).unwrap();
        assert_eq!(report.archived, vec!["2025-03-01".to_string()]);
        assert!(!layout.log_path(date(1)).exists());
        assert!(!layout.sidecar_path(date(1)).exists());
        assert!(layout.archived_log_path(date(1)).is_file());
        assert!(layout.log_path(date(2)).is_file());

        let archived = layout.verify_day(date(1)).unwrap();
        assert_eq!(archived.location, Some(FileLocation::Archive));
        assert!(archived.is_ok());

        // A stray re-created day-1 file is left alone once archived.
        fs::write(layout.log_path(date(1)), "again\n").unwrap();
        let second = layout.archive_older_days(date(2)).unwrap();
        assert!(second.archived.is_empty());
        assert_eq!(second.skipped, vec!["2025-03-01".to_string()]);
    }

    #[test]
    fn test_parse_day() {
        assert_eq!(parse_day("2025-03-01"), Some(date(1)));
        assert_eq!(parse_day("03/01/2025"), None);
        assert_eq!(parse_log_name("2025-03-01.json"), Some(date(1)));
        assert_eq!(parse_log_name("2025-03-01.json.sha256"), None);
    }

    #[test]
    fn test_failed_sidecar_write_keeps_rows_aligned() {
        let dir = TempDir::new().unwrap();
        let mut writer = JournalWriter::open(layout(&dir)).unwrap();
        writer.append_line_at("one", at(6, 9)).unwrap();

        // Swap in a read-only handle so the next sidecar write fails.
        let sidecar_path = writer.layout().sidecar_path(date(6));
        let active = writer.active.as_mut().unwrap();
        active.sidecar = File::open(&sidecar_path).unwrap();
        assert!(matches!(
            writer.append_line_at("two", at(6, 9)),
            Err(JournalError::Sidecar(_))
        ));

        writer.active.as_mut().unwrap().sidecar = open_append(&sidecar_path).unwrap();
        writer.append_line_at("three", at(6, 9)).unwrap();
        writer.append_line_at("four", at(6, 9)).unwrap();

        let sidecar = fs::read_to_string(&sidecar_path).unwrap();
        let rows: Vec<&str> = sidecar.lines().collect();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[1], MISSING_HASH);
        assert_eq!(rows[2], sha256_hex(b"three\n"));

        let report = writer.layout().verify_day(date(6)).unwrap();
        assert_eq!(report.matched, 3);
        assert_eq!(report.unhashed, 1);
        assert_eq!(report.mismatched, 0);
        assert_eq!(report.unpaired, 0);
        assert!(!report.is_ok());
    }
}
