use std::io::{self, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use seq_io::fastq::{Reader as FastqReader, Record};

use crate::utils::file::{FileReader, FileWriter};

/// Opens a plain or gzipped FASTQ file.
///
/// # Arguments
///
/// * `path`: &Path - Valid path to a fastq file.
///
/// # Returns
/// io::Result<FastqReader<FileReader>>
pub fn fastq_reader(path: &Path) -> io::Result<FastqReader<FileReader>> {
    Ok(FastqReader::new(FileReader::open(path)?))
}

pub fn write_fastq_record<W: Write>(
    writer: &mut W,
    id: &str,
    desc: Option<&str>,
    seq: &[u8],
    qual: &[u8],
) -> io::Result<()> {
    writer.write_all(b"@")?;
    writer.write_all(id.as_bytes())?;
    if let Some(desc) = desc {
        writer.write_all(b" ")?;
        writer.write_all(desc.as_bytes())?;
    }
    writer.write_all(b"\n")?;
    writer.write_all(seq)?;
    writer.write_all(b"\n+\n")?;
    writer.write_all(qual)?;
    writer.write_all(b"\n")?;
    Ok(())
}

/// Writes a seq_io record unchanged.
pub fn write_record<W: Write, R: Record>(writer: &mut W, rec: &R) -> io::Result<()> {
    writer.write_all(b"@")?;
    writer.write_all(rec.head())?;
    writer.write_all(b"\n")?;
    writer.write_all(rec.seq())?;
    writer.write_all(b"\n+\n")?;
    writer.write_all(rec.qual())?;
    writer.write_all(b"\n")?;
    Ok(())
}

/// Turns a sample's interleaved R1/R2 file into single-end reads named after their UMI.
///
/// # Arguments
///
/// * `interleaved` - R1, R2, R1, R2... as written by the demultiplexer. A missing file yields empty output.
/// * `out` - gzipped FASTQ of `@umi:<UMI>` + R1 sequence + R1 quality.
/// * `barcode_len` - R2 bases before the UMI.
/// * `umi_len` - UMI bases following the barcode.
///
/// # Returns
/// Number of reads written.
pub fn umi_tag_reads(interleaved: &Path, out: &Path, barcode_len: usize, umi_len: usize) -> Result<u64> {
    let mut writer = FileWriter::create(out).with_context(|| format!("cannot create {}", out.display()))?;
    let mut n = 0u64;
    if interleaved.exists() {
        let mut reader = fastq_reader(interleaved).with_context(|| format!("cannot open {}", interleaved.display()))?;
        loop {
            let r1 = match reader.next() {
                None => break,
                Some(r) => r?.to_owned_record(),
            };
            let r2 = reader
                .next()
                .ok_or_else(|| anyhow!("{}: R1 '{}' has no mate", interleaved.display(), String::from_utf8_lossy(&r1.head)))??;
            let r2_seq = r2.seq();
            let end = (barcode_len + umi_len).min(r2_seq.len());
            let umi = String::from_utf8_lossy(&r2_seq[barcode_len.min(end)..end]).into_owned();
            write_fastq_record(&mut writer, &format!("umi:{}", umi), None, &r1.seq, &r1.qual)?;
            n += 1;
        }
    }
    writer.finish()?;
    Ok(n)
}
