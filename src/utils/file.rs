// src/utils/file.rs: file and folder helpers
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use lazy_static::lazy_static;
use log::{debug, info};
use regex::Regex;

use crate::config::defs::PipelineError;

lazy_static! {
    static ref READ_TAG_RE: Regex = Regex::new(r"^(?P<base>.*)_R(?P<read>\d)(?P<rest>.*)$").unwrap();
}

pub fn is_gzipped(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut buffer = [0u8; 2];
    match file.read_exact(&mut buffer) {
        Ok(()) => Ok(buffer == [0x1F, 0x8B]), // Gzip magic bytes
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Either a plain or a gzipped file.
pub enum FileReader {
    Uncompressed(BufReader<File>),
    Gzipped(MultiGzDecoder<BufReader<File>>),
}

impl FileReader {
    pub fn open(path: &Path) -> io::Result<FileReader> {
        let gz = is_gzipped(path)?;
        let file = BufReader::new(File::open(path)?);
        Ok(if gz { FileReader::Gzipped(MultiGzDecoder::new(file)) } else { FileReader::Uncompressed(file) })
    }
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            FileReader::Uncompressed(r) => r.read(buf),
            FileReader::Gzipped(r) => r.read(buf),
        }
    }
}

/// Enum to hold either an uncompressed or gzipped file writer
pub enum FileWriter {
    Uncompressed(BufWriter<File>),
    Gzipped(GzEncoder<BufWriter<File>>),
}

impl FileWriter {
    /// Gzip is chosen by a `.gz` extension.
    pub fn create(path: &Path) -> io::Result<FileWriter> {
        let file = BufWriter::new(File::create(path)?);
        Ok(if path.extension().is_some_and(|e| e == "gz") {
            FileWriter::Gzipped(GzEncoder::new(file, Compression::default()))
        } else {
            FileWriter::Uncompressed(file)
        })
    }

    /// Flushes and, for gzip, writes the trailer.
    pub fn finish(self) -> io::Result<()> {
        match self {
            FileWriter::Uncompressed(mut w) => w.flush(),
            FileWriter::Gzipped(w) => w.finish()?.flush(),
        }
    }
}

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            FileWriter::Uncompressed(w) => w.write(buf),
            FileWriter::Gzipped(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            FileWriter::Uncompressed(w) => w.flush(),
            FileWriter::Gzipped(w) => w.flush(),
        }
    }
}

pub fn create_dir(path: &Path) -> Result<(), PipelineError> {
    if !path.exists() {
        fs::create_dir_all(path)
            .map_err(|e| PipelineError::IOError(format!("cannot create {}: {}", path.display(), e)))?;
        debug!("created folder {}", path.display());
    }
    Ok(())
}

/// Picks the run folder inside `parent`: `debug` for debug runs, else one past the highest numeric sibling.
pub fn next_run_dir(parent: &Path, debug: bool) -> io::Result<PathBuf> {
    if debug {
        return Ok(parent.join("debug"));
    }
    let mut highest = 0u32;
    if parent.is_dir() {
        for entry in fs::read_dir(parent)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(n) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) {
                highest = highest.max(n);
            }
        }
    }
    Ok(parent.join((highest + 1).to_string()))
}

/// One R1/R2 input pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FastqPair {
    pub r1: PathBuf,
    pub r2: PathBuf,
}

/// Finds the `*.fastq.gz` files in `folder` starting with `prefix` and pairs them on `_R<digit>`.
///
/// # Arguments
///
/// * `folder` - input folder.
/// * `prefix` - file name prefix, may be empty.
///
/// # Returns
/// Pairs sorted by R1 path. Files without a mate are skipped; no pair at all is an error.
pub fn collect_input_fastqs(folder: &Path, prefix: &str) -> Result<Vec<FastqPair>, PipelineError> {
    let entries = fs::read_dir(folder)
        .map_err(|e| PipelineError::InvalidConfig(format!("cannot list input folder {}: {}", folder.display(), e)))?;

    let mut by_base: std::collections::BTreeMap<String, [Option<PathBuf>; 2]> = Default::default();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(prefix) || !name.ends_with(".fastq.gz") {
            continue;
        }
        let Some(caps) = READ_TAG_RE.captures(&name) else {
            debug!("{} has no _R<n> tag, skipped", name);
            continue;
        };
        let key = format!("{}{}", &caps["base"], &caps["rest"]);
        let slot = match &caps["read"] {
            "1" => 0,
            "2" => 1,
            _ => continue,
        };
        by_base.entry(key).or_default()[slot] = Some(entry.path());
    }

    let mut pairs = Vec::new();
    for (base, [r1, r2]) in by_base {
        match (r1, r2) {
            (Some(r1), Some(r2)) => pairs.push(FastqPair { r1, r2 }),
            _ => info!("{} has no mate, skipped", base),
        }
    }
    if pairs.is_empty() {
        return Err(PipelineError::InvalidConfig(format!(
            "no R1/R2 fastq.gz pairs starting with '{}' in {}",
            prefix,
            folder.display()
        )));
    }
    info!("found {} input file pairs", pairs.len());
    Ok(pairs)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_input_fastqs() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        for name in [
            "lib_S1_L001_R1_001.fastq.gz",
            "lib_S1_L001_R2_001.fastq.gz",
            "lib_S1_L002_R1_001.fastq.gz",
            "lib_S1_L002_R2_001.fastq.gz",
            "lib_S2_L001_R1_001.fastq.gz",
            "other_R1.fastq.gz",
            "other_R2.fastq.gz",
        ] {
            File::create(dir.path().join(name))?;
        }
        let pairs = collect_input_fastqs(dir.path(), "lib_")?;
        assert_eq!(pairs.len(), 2);
        assert!(pairs[0].r1.ends_with("lib_S1_L001_R1_001.fastq.gz"));
        assert!(pairs[0].r2.ends_with("lib_S1_L001_R2_001.fastq.gz"));
        assert!(collect_input_fastqs(dir.path(), "nothing").is_err());
        Ok(())
    }

    #[test]
    fn test_next_run_dir() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        assert_eq!(next_run_dir(dir.path(), false)?, dir.path().join("1"));
        fs::create_dir(dir.path().join("1"))?;
        fs::create_dir(dir.path().join("7"))?;
        fs::create_dir(dir.path().join("debug"))?;
        assert_eq!(next_run_dir(dir.path(), false)?, dir.path().join("8"));
        assert_eq!(next_run_dir(dir.path(), true)?, dir.path().join("debug"));
        Ok(())
    }

    #[test]
    fn test_gzip_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("x.txt.gz");
        let mut w = FileWriter::create(&path)?;
        w.write_all(b"hello\n")?;
        w.finish()?;
        assert!(is_gzipped(&path)?);
        let mut s = String::new();
        FileReader::open(&path)?.read_to_string(&mut s)?;
        assert_eq!(s, "hello\n");
        Ok(())
    }
}
