//! tar archives compressed with gzip or zstd.
//!
//! Packing is blocking I/O; callers run it on the blocking pool.

use crate::config::Compression;
use crate::utils::errors::{BackupError, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tar::{Archive, Builder};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Archive the contents of `src` into `dest`.
///
/// Entries are stored under `root` (e.g. `backup_20240101_120000/...`), or
/// directly at the top level when `root` is `"."`. An empty directory still
/// yields a valid archive.
pub fn pack_dir(src: &Path, dest: &Path, root: &str, compression: Compression, level: u32) -> Result<u64> {
    let file = BufWriter::new(File::create(dest)?);

    match compression {
        Compression::Gzip => {
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::new(level.min(9)));
            let encoder = append_tree(encoder, src, root)?;
            encoder.finish()?.flush()?;
        }
        Compression::Zstd => {
            let encoder = zstd::stream::write::Encoder::new(file, level.clamp(1, 22) as i32)?;
            let encoder = append_tree(encoder, src, root)?;
            encoder.finish()?.flush()?;
        }
    }

    Ok(std::fs::metadata(dest)?.len())
}

fn append_tree<W: Write>(writer: W, src: &Path, root: &str) -> Result<W> {
    let mut builder = Builder::new(writer);
    builder.follow_symlinks(false);
    builder.append_dir_all(root, src)?;
    Ok(builder.into_inner()?)
}

/// Detect the compression of an archive from its magic bytes.
pub fn detect_compression(path: &Path) -> Result<Compression> {
    let mut magic = [0u8; 4];
    let mut file = File::open(path)?;
    let read = file.read(&mut magic)?;

    if read >= 4 && magic == ZSTD_MAGIC {
        Ok(Compression::Zstd)
    } else if read >= 2 && magic[..2] == GZIP_MAGIC {
        Ok(Compression::Gzip)
    } else {
        Err(BackupError::Integrity(vec![format!(
            "{} is neither gzip nor zstd compressed",
            path.display()
        )]))
    }
}

fn open_archive(path: &Path) -> Result<Archive<Box<dyn Read>>> {
    let file = BufReader::new(File::open(path)?);
    let reader: Box<dyn Read> = match detect_compression(path)? {
        Compression::Gzip => Box::new(flate2::read::GzDecoder::new(file)),
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(file)?),
    };
    Ok(Archive::new(reader))
}

/// Extract an archive into `dest`. Entries escaping `dest` are rejected by
/// the tar reader.
pub fn unpack(archive_path: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    let mut archive = open_archive(archive_path)?;
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_preserve_ownerships(nix::unistd::geteuid().is_root());
    archive.set_overwrite(true);
    archive.unpack(dest)?;
    Ok(())
}

/// Read every entry header and body without writing anything.
/// Returns the number of regular files.
pub fn count_entries(archive_path: &Path) -> Result<u64> {
    let mut archive = open_archive(archive_path)?;
    let mut files = 0;

    for entry in archive.entries()? {
        let mut entry = entry?;
        entry.path()?;
        if entry.header().entry_type().is_file() {
            files += 1;
        }
        std::io::copy(&mut entry, &mut std::io::sink())?;
    }

    Ok(files)
}
