use std::path::Path;

use seq_io::fastq::Record;

use transeq_pipelines::pipelines::demux::Demultiplexer;
use transeq_pipelines::utils::fastx::{fastq_reader, umi_tag_reads, write_fastq_record};
use transeq_pipelines::utils::file::{collect_input_fastqs, FileWriter};

/// (R1 sequence, R2 sequence) pairs written as gzipped lib_R1/lib_R2 files.
fn write_input(dir: &Path, reads: &[(&str, &str)]) -> anyhow::Result<()> {
    let mut r1 = FileWriter::create(&dir.join("lib_S1_R1_001.fastq.gz"))?;
    let mut r2 = FileWriter::create(&dir.join("lib_S1_R2_001.fastq.gz"))?;
    for (i, (s1, s2)) in reads.iter().enumerate() {
        let id = format!("pair{}", i);
        write_fastq_record(&mut r1, &id, Some("1:N:0"), s1.as_bytes(), &vec![b'F'; s1.len()])?;
        write_fastq_record(&mut r2, &id, Some("2:N:0"), s2.as_bytes(), &vec![b'F'; s2.len()])?;
    }
    r1.finish()?;
    r2.finish()?;
    Ok(())
}

fn read_seqs(path: &Path) -> anyhow::Result<Vec<String>> {
    let mut reader = fastq_reader(path)?;
    let mut seqs = Vec::new();
    while let Some(rec) = reader.next() {
        seqs.push(String::from_utf8(rec?.seq().to_vec())?);
    }
    Ok(seqs)
}

#[test]
fn test_three_sample_split() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    write_input(
        dir.path(),
        &[
            ("TTTTAAAA", "AAAACCCCGGGG"), // exact, sample 1
            ("TTTTCCCC", "AAAGCCCCGGGG"), // one off both AAAA and AAAT, first registered wins
            ("TTTTGGGG", "CCCCAAAAAAAA"), // no barcode
            ("TTTTTTTT", "AAATACGTACGT"), // exact, sample 2
            ("GGGGTTTT", "GGGCTTTTTTTT"), // one off GGGG
        ],
    )?;
    let pairs = collect_input_fastqs(dir.path(), "lib_")?;
    assert_eq!(pairs.len(), 1);

    let outputs: Vec<_> = ["s1", "s2", "s3"].iter().map(|s| dir.path().join(format!("{}.fastq", s))).collect();
    let nobc = dir.path().join("no-barcode.fastq.gz");
    let demux = Demultiplexer::new(&["AAAA", "AAAT", "GGGG"], 1, outputs.clone(), Some(nobc.clone()), None)?;
    let counts = demux.run(&pairs)?;

    assert_eq!(counts.exact, vec![1, 1, 0]);
    assert_eq!(counts.ball, vec![1, 0, 1]);
    assert_eq!(counts.no_barcode, 1);
    assert_eq!(counts.n_reads(0), 2);

    // interleaved R1/R2 in arrival order
    assert_eq!(
        read_seqs(&outputs[0])?,
        vec!["TTTTAAAA", "AAAACCCCGGGG", "TTTTCCCC", "AAAGCCCCGGGG"]
    );
    assert_eq!(read_seqs(&outputs[2])?, vec!["GGGGTTTT", "GGGCTTTTTTTT"]);
    assert_eq!(read_seqs(&nobc)?, vec!["TTTTGGGG", "CCCCAAAAAAAA"]);
    Ok(())
}

#[test]
fn test_no_barcode_reads_dropped_unless_kept() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    write_input(dir.path(), &[("ACGT", "CCCCAAAA"), ("ACGT", "GGGGAAAA")])?;
    let pairs = collect_input_fastqs(dir.path(), "")?;
    let out = dir.path().join("g.fastq");
    let counts = Demultiplexer::new(&["GGGG"], 1, vec![out.clone()], None, None)?.run(&pairs)?;
    assert_eq!(counts.no_barcode, 1);
    assert_eq!(read_seqs(&out)?.len(), 2);
    Ok(())
}

#[test]
fn test_split_then_umi_tagging() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    write_input(dir.path(), &[("CATCATCAT", "AAAAGATTACAX"), ("GGGCCC", "AAAATTTTCCCCX")])?;
    let pairs = collect_input_fastqs(dir.path(), "lib_")?;
    let inter = dir.path().join("s1.fastq");
    Demultiplexer::new(&["AAAA"], 0, vec![inter.clone()], None, None)?.run(&pairs)?;

    let tagged = dir.path().join("s1.fastq.gz");
    assert_eq!(umi_tag_reads(&inter, &tagged, 4, 8)?, 2);
    let mut reader = fastq_reader(&tagged)?;
    let first = reader.next().unwrap()?;
    assert_eq!(first.head(), b"umi:GATTACAX");
    assert_eq!(first.seq(), b"CATCATCAT");
    let second = reader.next().unwrap()?;
    assert_eq!(second.head(), b"umi:TTTTCCCC");
    Ok(())
}
