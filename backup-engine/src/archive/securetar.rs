//! Component sub-archives.
//!
//! Each component is a tar stream, optionally gzipped, optionally
//! encrypted: tar → gzip → AES on write, AES → gunzip → tar on read.
//! These are blocking calls; run them on the blocking pool.

use crate::crypto::{CipherKey, DecryptReader, EncryptWriter};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const TAR_BLOCK: usize = 512;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// File name of a component archive
pub fn archive_name(base: &str, compressed: bool) -> String {
    if compressed {
        format!("{}.tar.gz", base)
    } else {
        format!("{}.tar", base)
    }
}

/// Write a component archive whose entries are produced by `fill`.
/// Returns the archive size in bytes. On error nothing is left at `target`.
pub fn write_archive<F>(target: &Path, key: Option<&CipherKey>, gzip: bool, fill: F) -> io::Result<u64>
where
    F: FnOnce(&mut tar::Builder<&mut dyn Write>) -> io::Result<()>,
{
    let result = write_archive_inner(target, key, gzip, fill);
    if result.is_err() {
        let _ = fs::remove_file(target);
    }
    result
}

fn write_archive_inner<F>(target: &Path, key: Option<&CipherKey>, gzip: bool, fill: F) -> io::Result<u64>
where
    F: FnOnce(&mut tar::Builder<&mut dyn Write>) -> io::Result<()>,
{
    let file = File::create(target)?;
    let mut sink = EncryptWriter::new(BufWriter::new(file), key)?;

    if gzip {
        let mut encoder = GzEncoder::new(&mut sink, Compression::default());
        let mut builder = tar::Builder::new(&mut encoder as &mut dyn Write);
        builder.follow_symlinks(false);
        fill(&mut builder)?;
        builder.into_inner()?;
        encoder.finish()?;
    } else {
        let mut builder = tar::Builder::new(&mut sink as &mut dyn Write);
        builder.follow_symlinks(false);
        fill(&mut builder)?;
        builder.into_inner()?;
    }

    let file = sink.finish()?.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(file.metadata()?.len())
}

/// Append the tree below `source` to `builder` under `prefix`, skipping
/// `excluded` paths and everything below them.
pub fn append_tree<W: Write>(
    builder: &mut tar::Builder<W>,
    source: &Path,
    prefix: &Path,
    excluded: &[PathBuf],
) -> io::Result<()> {
    let walker = WalkDir::new(source)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !excluded.iter().any(|path| entry.path() == path));

    for entry in walker {
        let entry = entry?;
        if entry.depth() == 0 {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        builder.append_path_with_name(entry.path(), prefix.join(relative))?;
    }

    Ok(())
}

/// Archive a whole directory
pub fn create_from_dir(
    source: &Path,
    target: &Path,
    key: Option<&CipherKey>,
    gzip: bool,
    excluded: &[PathBuf],
) -> io::Result<u64> {
    write_archive(target, key, gzip, |builder| {
        append_tree(builder, source, Path::new(""), excluded)
    })
}

fn open_reader(source: &Path, key: Option<&CipherKey>) -> io::Result<DecryptReader<BufReader<File>>> {
    DecryptReader::new(BufReader::new(File::open(source)?), key)
}

/// Unpack a component archive into `target`
pub fn extract_to_dir(source: &Path, target: &Path, key: Option<&CipherKey>, gzip: bool) -> io::Result<()> {
    fs::create_dir_all(target)?;
    let reader = open_reader(source, key)?;

    if gzip {
        unpack(tar::Archive::new(GzDecoder::new(reader)), target)
    } else {
        unpack(tar::Archive::new(reader), target)
    }
}

fn unpack<R: Read>(mut archive: tar::Archive<R>, target: &Path) -> io::Result<()> {
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);
    archive.unpack(target)
}

/// Check that `source` decrypts to something that looks like a tar or gzip
/// stream. A wrong key gives random bytes or a padding error.
pub fn verify_key(source: &Path, key: Option<&CipherKey>, gzip: bool) -> io::Result<bool> {
    let reader = match open_reader(source, key) {
        Ok(reader) => reader,
        Err(e) if e.kind() == io::ErrorKind::InvalidData => return Ok(false),
        Err(e) => return Err(e),
    };

    let mut head = Vec::with_capacity(TAR_BLOCK);
    match reader.take(TAR_BLOCK as u64).read_to_end(&mut head) {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::InvalidData => return Ok(false),
        Err(e) => return Err(e),
    }

    if gzip {
        return Ok(head.starts_with(&GZIP_MAGIC));
    }
    if head.len() < TAR_BLOCK {
        return Ok(false);
    }
    // Either a header with the ustar magic or the end-of-archive marker
    Ok(&head[257..262] == b"ustar" || head.iter().all(|b| *b == 0))
}
