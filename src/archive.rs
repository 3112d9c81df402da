//! Archive packing and unpacking on the local filesystem
//!
//! Supports: zip (deflate), tar, tar.gz. Extraction refuses any entry whose
//! name would land outside the destination directory.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tracing::{debug, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::errors::{VfsError, VfsResult};
use crate::fs::entry::DEFAULT_FILE_MODE;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";
const ZIP_EMPTY_MAGIC: [u8; 4] = *b"PK\x05\x06";

/// Archive formats that can be created and extracted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    Tar,
    TarGz,
}

impl ArchiveFormat {
    /// Detect archive format from file extension
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_lowercase();

        if name.ends_with(".zip") || name.ends_with(".jar") || name.ends_with(".war") || name.ends_with(".apk") {
            Some(ArchiveFormat::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else if name.ends_with(".tar") {
            Some(ArchiveFormat::Tar)
        } else {
            None
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => ".zip",
            ArchiveFormat::Tar => ".tar",
            ArchiveFormat::TarGz => ".tar.gz",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "ZIP",
            ArchiveFormat::Tar => "TAR",
            ArchiveFormat::TarGz => "TAR.GZ",
        }
    }
}

/// Normalize archive paths: replace backslashes, strip leading "./"
fn normalize_archive_path(p: &str) -> String {
    p.replace('\\', "/").trim_start_matches("./").to_string()
}

/// Resolve an entry name under `dest`.
///
/// Absolute names and names that climb out of `dest` are rejected. A name
/// that resolves to `dest` itself yields `None`.
fn safe_target(dest: &Path, name: &str) -> VfsResult<Option<PathBuf>> {
    let normalized = normalize_archive_path(name);
    let has_drive = normalized.as_bytes().get(1) == Some(&b':');
    if normalized.starts_with('/') || has_drive {
        return Err(VfsError::PathTraversal(name.to_string()));
    }

    let mut parts: Vec<&str> = Vec::new();
    for part in normalized.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(VfsError::PathTraversal(name.to_string()));
                }
            }
            _ => parts.push(part),
        }
    }

    if parts.is_empty() {
        return Ok(None);
    }
    Ok(Some(parts.iter().fold(dest.to_path_buf(), |acc, p| acc.join(p))))
}

enum Item {
    Dir { name: String, mode: u32 },
    File { path: PathBuf, name: String, mode: u32, modified: Option<SystemTime> },
}

#[cfg(unix)]
fn mode_of(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(metadata: &fs::Metadata) -> u32 {
    if metadata.is_dir() {
        crate::fs::entry::DEFAULT_DIR_MODE
    } else {
        DEFAULT_FILE_MODE
    }
}

/// Archive name of `path` relative to `base_dir`, always '/'-separated
fn archive_name(base_dir: &Path, path: &Path) -> VfsResult<String> {
    let rel = path
        .strip_prefix(base_dir)
        .map_err(|_| VfsError::Archive(format!("{} is outside {}", path.display(), base_dir.display())))?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

/// Expand the selected entries into the regular files and directories to pack.
/// Symlinks and special files are skipped.
fn collect_items(base_dir: &Path, entries: &[String]) -> VfsResult<Vec<Item>> {
    let mut items = Vec::new();
    for entry in entries {
        let root = base_dir.join(entry);
        for walked in WalkDir::new(&root).follow_links(false).sort_by_file_name() {
            let walked = walked.map_err(|e| VfsError::Io(e.into()))?;
            let file_type = walked.file_type();
            if file_type.is_symlink() {
                debug!("Skipping symlink {}", walked.path().display());
                continue;
            }

            let metadata = walked.metadata().map_err(|e| VfsError::Io(e.into()))?;
            let name = archive_name(base_dir, walked.path())?;
            if file_type.is_dir() {
                items.push(Item::Dir {
                    name,
                    mode: mode_of(&metadata),
                });
            } else if file_type.is_file() {
                items.push(Item::File {
                    path: walked.path().to_path_buf(),
                    name,
                    mode: mode_of(&metadata),
                    modified: metadata.modified().ok(),
                });
            }
        }
    }
    Ok(items)
}

/// Days since the Unix epoch to (year, month, day)
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

fn zip_datetime(time: SystemTime) -> Option<zip::DateTime> {
    let secs = time.duration_since(UNIX_EPOCH).ok()?.as_secs() as i64;
    let (year, month, day) = civil_from_days(secs.div_euclid(86_400));
    let rem = secs.rem_euclid(86_400);
    zip::DateTime::from_date_and_time(
        u16::try_from(year).ok()?,
        month as u8,
        day as u8,
        (rem / 3600) as u8,
        (rem % 3600 / 60) as u8,
        (rem % 60) as u8,
    )
    .ok()
}

fn write_zip(out: File, items: &[Item]) -> VfsResult<()> {
    let mut zip = ZipWriter::new(BufWriter::new(out));
    for item in items {
        match item {
            Item::Dir { name, mode } => {
                let options = SimpleFileOptions::default().unix_permissions(*mode);
                zip.add_directory(format!("{}/", name), options)?;
            }
            Item::File { path, name, mode, modified } => {
                let mut options = SimpleFileOptions::default()
                    .compression_method(CompressionMethod::Deflated)
                    .unix_permissions(*mode);
                if let Some(dt) = modified.and_then(zip_datetime) {
                    options = options.last_modified_time(dt);
                }
                zip.start_file(name.as_str(), options)?;
                io::copy(&mut File::open(path)?, &mut zip)?;
            }
        }
    }
    zip.finish()?.flush()?;
    Ok(())
}

fn append_tar<W: Write>(builder: &mut tar::Builder<W>, base_dir: &Path, items: &[Item]) -> VfsResult<()> {
    for item in items {
        match item {
            Item::Dir { name, .. } => {
                builder.append_dir(name, base_dir.join(name))?;
            }
            Item::File { path, name, .. } => {
                // Header mode and mtime come from the source metadata
                builder.append_path_with_name(path, name)?;
            }
        }
    }
    Ok(())
}

/// Pack `entries` (names relative to `base_dir`) into a new archive at `destination`.
///
/// Directories are added recursively. A partially written archive is removed on failure.
pub fn create_archive(
    format: ArchiveFormat,
    destination: &Path,
    base_dir: &Path,
    entries: &[String],
) -> VfsResult<()> {
    let items = collect_items(base_dir, entries)?;
    let out = File::create(destination)?;

    let result = match format {
        ArchiveFormat::Zip => write_zip(out, &items),
        ArchiveFormat::Tar => {
            let mut builder = tar::Builder::new(BufWriter::new(out));
            append_tar(&mut builder, base_dir, &items)
                .and_then(|()| Ok(builder.into_inner()?.flush()?))
        }
        ArchiveFormat::TarGz => {
            let encoder = GzEncoder::new(BufWriter::new(out), Compression::default());
            let mut builder = tar::Builder::new(encoder);
            append_tar(&mut builder, base_dir, &items)
                .and_then(|()| Ok(builder.into_inner()?.finish()?.flush()?))
        }
    };

    if result.is_err()
        && let Err(e) = fs::remove_file(destination)
    {
        warn!("Could not remove incomplete archive {}: {}", destination.display(), e);
    }
    result
}

fn read_magic(file: &mut File) -> io::Result<[u8; 4]> {
    let mut magic = [0u8; 4];
    let mut filled = 0;
    while filled < magic.len() {
        match file.read(&mut magic[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    file.seek(SeekFrom::Start(0))?;
    Ok(magic)
}

fn is_zip(magic: &[u8; 4]) -> bool {
    *magic == ZIP_MAGIC || *magic == ZIP_EMPTY_MAGIC
}

fn create_file(path: &Path, mode: u32) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        // No setuid/setgid from archives
        options.mode(mode & 0o777);
    }
    #[cfg(not(unix))]
    let _ = mode;
    options.open(path)
}

fn extract_zip(file: File, dest: &Path) -> VfsResult<()> {
    let mut archive = ZipArchive::new(BufReader::new(file))?;

    // Validate every name before touching the disk
    for name in archive.file_names() {
        safe_target(dest, name)?;
    }

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(target) = safe_target(dest, entry.name())? else {
            continue;
        };

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }

        let mode = entry.unix_mode().map(|m| m & 0o7777).filter(|m| *m != 0).unwrap_or(DEFAULT_FILE_MODE);
        let mut out = create_file(&target, mode)?;
        io::copy(&mut entry, &mut out)?;
    }
    Ok(())
}

fn tar_reader(mut file: File) -> VfsResult<tar::Archive<Box<dyn Read>>> {
    let magic = read_magic(&mut file)?;
    let reader: Box<dyn Read> = if magic[..2] == GZIP_MAGIC {
        Box::new(GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    Ok(tar::Archive::new(reader))
}

fn entry_name<R: Read>(entry: &tar::Entry<'_, R>) -> String {
    String::from_utf8_lossy(&entry.path_bytes()).into_owned()
}

fn extract_tar(source: &Path, dest: &Path) -> VfsResult<()> {
    // Validation pass over the headers; the data is skipped
    let mut archive = tar_reader(File::open(source)?)?;
    for entry in archive.entries()? {
        safe_target(dest, &entry_name(&entry?))?;
    }

    let mut archive = tar_reader(File::open(source)?)?;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry_name(&entry);
        let Some(target) = safe_target(dest, &name)? else {
            continue;
        };

        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry_type.is_file() || entry_type.is_contiguous() {
            let mode = entry.header().mode().ok().filter(|m| *m != 0).unwrap_or(DEFAULT_FILE_MODE);
            let mut out = create_file(&target, mode)?;
            io::copy(&mut entry, &mut out)?;
        } else {
            debug!("Skipping non-regular tar entry {}", name);
        }
    }
    Ok(())
}

/// Unpack a zip or tar archive into `destination_dir`.
///
/// The format is detected from the file's leading bytes; tar archives may be
/// gzip-compressed. If any entry would escape `destination_dir` the
/// extraction fails with [`VfsError::PathTraversal`] before anything is written.
pub fn extract_archive(source: &Path, destination_dir: &Path) -> VfsResult<()> {
    let mut file = File::open(source)?;
    let magic = read_magic(&mut file)?;
    fs::create_dir_all(destination_dir)?;

    let result = if is_zip(&magic) {
        extract_zip(file, destination_dir)
    } else {
        drop(file);
        extract_tar(source, destination_dir)
    };

    if let Err(VfsError::PathTraversal(name)) = &result {
        warn!("Refusing to extract {}: entry {} escapes the destination", source.display(), name);
    }
    result
}

/// Human-readable listing of a zip archive's entries
pub fn list_archive(source: &Path) -> VfsResult<String> {
    let mut file = File::open(source)?;
    if !is_zip(&read_magic(&mut file)?) {
        return Err(VfsError::NotSupported(format!(
            "listing {} (only zip archives can be viewed)",
            source.display()
        )));
    }

    let mut archive = ZipArchive::new(BufReader::new(file))?;
    let rule = "─".repeat(70);
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut out = String::new();
    out.push_str(&format!("Archive: {}\n", name));
    out.push_str(&format!("{:<12} {:<20} {}\n", "Size", "Modified", "Name"));
    out.push_str(&rule);
    out.push('\n');

    let mut total: u64 = 0;
    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        total += entry.size();
        let modified = entry
            .last_modified()
            .map(|dt| {
                format!(
                    "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                    dt.year(),
                    dt.month(),
                    dt.day(),
                    dt.hour(),
                    dt.minute(),
                    dt.second()
                )
            })
            .unwrap_or_default();
        out.push_str(&format!("{:<12} {:<20} {}\n", entry.size(), modified, entry.name()));
    }

    out.push_str(&rule);
    out.push('\n');
    out.push_str(&format!("{} file(s), {} bytes total\n", archive.len(), total));
    Ok(out)
}

/// First free directory name for extracting `archive_name` into `parent`:
/// the archive name without its extension, then with 2, 3, ... appended.
pub fn unique_extract_dir(parent: &Path, archive_name: &str) -> PathBuf {
    let lower = archive_name.to_lowercase();
    let stem = [".tar.gz", ".tgz", ".zip", ".tar"]
        .iter()
        .find(|ext| lower.ends_with(*ext))
        .map(|ext| &archive_name[..archive_name.len() - ext.len()])
        .unwrap_or(archive_name);

    let candidate = parent.join(stem);
    if !candidate.exists() {
        return candidate;
    }
    (2u32..)
        .map(|i| parent.join(format!("{}{}", stem, i)))
        .find(|c| !c.exists())
        .unwrap_or(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_tree(base: &Path) {
        fs::create_dir_all(base.join("dir/sub")).unwrap();
        fs::create_dir_all(base.join("dir/empty")).unwrap();
        fs::write(base.join("top.txt"), b"top level").unwrap();
        fs::write(base.join("dir/a.txt"), b"alpha").unwrap();
        fs::write(base.join("dir/sub/data.bin"), (0..5000u32).map(|i| i as u8).collect::<Vec<_>>()).unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(base.join("top.txt"), base.join("dir/link")).unwrap();
    }

    fn assert_tree(out: &Path) {
        assert_eq!(fs::read(out.join("top.txt")).unwrap(), b"top level");
        assert_eq!(fs::read(out.join("dir/a.txt")).unwrap(), b"alpha");
        assert_eq!(
            fs::read(out.join("dir/sub/data.bin")).unwrap(),
            (0..5000u32).map(|i| i as u8).collect::<Vec<_>>()
        );
        assert!(out.join("dir/empty").is_dir());
        assert!(fs::symlink_metadata(out.join("dir/link")).is_err());
    }

    #[test]
    fn test_round_trip_every_format() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("base");
        build_tree(&base);
        let entries = vec!["top.txt".to_string(), "dir".to_string()];

        for format in [ArchiveFormat::Zip, ArchiveFormat::Tar, ArchiveFormat::TarGz] {
            let archive = tmp.path().join(format!("packed{}", format.extension()));
            create_archive(format, &archive, &base, &entries).unwrap();
            assert_eq!(ArchiveFormat::from_path(&archive), Some(format));

            let out = tmp.path().join(format!("out-{}", format.display_name()));
            extract_archive(&archive, &out).unwrap();
            assert_tree(&out);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_tar_preserves_mode() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("base");
        fs::create_dir(&base).unwrap();
        fs::write(base.join("run.sh"), b"#!/bin/sh\n").unwrap();
        fs::set_permissions(base.join("run.sh"), fs::Permissions::from_mode(0o750)).unwrap();

        let archive = tmp.path().join("x.tar");
        create_archive(ArchiveFormat::Tar, &archive, &base, &["run.sh".to_string()]).unwrap();
        let out = tmp.path().join("out");
        extract_archive(&archive, &out).unwrap();
        let mode = fs::metadata(out.join("run.sh")).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o750);
    }

    #[test]
    fn test_gzip_detected_by_magic_not_name() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("base");
        build_tree(&base);

        let archive = tmp.path().join("backup.bin");
        create_archive(ArchiveFormat::TarGz, &archive, &base, &["dir".to_string()]).unwrap();
        assert_eq!(&fs::read(&archive).unwrap()[..2], &GZIP_MAGIC);

        let out = tmp.path().join("out");
        extract_archive(&archive, &out).unwrap();
        assert_eq!(fs::read(out.join("dir/a.txt")).unwrap(), b"alpha");
    }

    fn zip_with(path: &Path, names: &[&str]) {
        let mut zip = ZipWriter::new(File::create(path).unwrap());
        for name in names {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(b"payload").unwrap();
        }
        zip.finish().unwrap();
    }

    fn tar_with(path: &Path, names: &[&str]) {
        let mut builder = tar::Builder::new(File::create(path).unwrap());
        for name in names {
            // Header::set_path refuses "..", so write the raw name field
            let mut header = tar::Header::new_gnu();
            header.as_mut_bytes()[..name.len()].copy_from_slice(name.as_bytes());
            header.set_size(7);
            header.set_mode(0o644);
            header.set_entry_type(tar::EntryType::Regular);
            header.set_cksum();
            builder.append(&header, &b"payload"[..]).unwrap();
        }
        builder.finish().unwrap();
    }

    #[test]
    fn test_zip_slip_rejected_before_writing() {
        let tmp = tempfile::tempdir().unwrap();
        for bad in ["../evil.txt", "/abs.txt", "a/../../evil.txt"] {
            let archive = tmp.path().join("bad.zip");
            zip_with(&archive, &["good.txt", bad]);

            let dest = tmp.path().join("dest");
            let err = extract_archive(&archive, &dest).unwrap_err();
            assert!(matches!(err, VfsError::PathTraversal(_)), "{bad}: {err}");
            assert!(!dest.join("good.txt").exists());
            assert!(!tmp.path().join("evil.txt").exists());
        }
    }

    #[test]
    fn test_tar_slip_rejected_before_writing() {
        let tmp = tempfile::tempdir().unwrap();
        for bad in ["../evil.txt", "/abs.txt"] {
            let archive = tmp.path().join("bad.tar");
            tar_with(&archive, &["good.txt", bad]);

            let dest = tmp.path().join("dest");
            let err = extract_archive(&archive, &dest).unwrap_err();
            assert!(matches!(err, VfsError::PathTraversal(_)), "{bad}: {err}");
            assert!(!dest.join("good.txt").exists());
            assert!(!tmp.path().join("evil.txt").exists());
        }
    }

    #[test]
    fn test_safe_target() {
        let dest = Path::new("/dest");
        assert_eq!(safe_target(dest, "a/./b").unwrap(), Some(dest.join("a").join("b")));
        assert_eq!(safe_target(dest, "a/../b").unwrap(), Some(dest.join("b")));
        assert_eq!(safe_target(dest, "dir\\file").unwrap(), Some(dest.join("dir").join("file")));
        assert_eq!(safe_target(dest, "./").unwrap(), None);
        assert!(safe_target(dest, "..").is_err());
        assert!(safe_target(dest, "C:\\windows").is_err());
    }

    #[test]
    fn test_list_archive() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("docs.zip");
        zip_with(&archive, &["one.txt", "two.txt"]);

        let listing = list_archive(&archive).unwrap();
        let lines: Vec<&str> = listing.lines().collect();
        assert_eq!(lines[0], "Archive: docs.zip");
        assert!(lines[1].starts_with("Size         Modified             Name"));
        assert_eq!(lines[2].chars().count(), 70);
        assert!(lines[3].starts_with("7 ") && lines[3].ends_with(" one.txt"));
        assert_eq!(lines.last().unwrap(), &"2 file(s), 14 bytes total");

        let tar = tmp.path().join("x.tar");
        tar_with(&tar, &["a"]);
        assert!(matches!(list_archive(&tar), Err(VfsError::NotSupported(_))));
    }

    #[test]
    fn test_unique_extract_dir() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(unique_extract_dir(tmp.path(), "photos.tar.gz"), tmp.path().join("photos"));

        fs::create_dir(tmp.path().join("photos")).unwrap();
        fs::create_dir(tmp.path().join("photos2")).unwrap();
        assert_eq!(unique_extract_dir(tmp.path(), "photos.ZIP"), tmp.path().join("photos3"));
        assert_eq!(unique_extract_dir(tmp.path(), "notes"), tmp.path().join("notes"));
    }

    #[test]
    fn test_civil_from_days() {
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(civil_from_days(19_723), (2024, 1, 1));
        assert_eq!(civil_from_days(19_782), (2024, 2, 29));
    }
}
