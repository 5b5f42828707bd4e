use std::{fs::File, io::BufWriter, sync::Arc, vec::Vec};

use anyhow::{bail, ensure, Context, Result};
use gzp::BUFSIZE;
use itertools::Itertools;
use log::{error, info};
use parking_lot::Mutex;
use path_absolutize::Absolutize;
use pooled_writer::{bgzf::BgzfCompressor, Pool};

use crate::{
    demux::{build_demultiplexer, Demultiplex},
    enzyme::EnzymeTable,
    matcher::MAX_START_OFFSET,
    metrics::{
        CorrectionLog, DemultiplexStats, CORRECTION_LOG_FILE, DEMULTIPLEX_STATS_FILE,
        UNDETERMINED_METRICS_FILE,
    },
    opts::{Opts, TOOL_NAME},
    pooled_sample_writer::PooledSampleWriter,
    progress::ProgressTracker,
    sample_metadata::SampleCatalog,
    sample_sheet::SampleSheet,
    thread_reader::FastqSource,
    utils::{built_info, output_fastqs},
};

/// State shared by the demultiplexing workers.
struct Workers<'a> {
    source: Mutex<FastqSource>,
    demuxer: Box<dyn Demultiplex + 'a>,
    writers: Vec<Arc<Mutex<PooledSampleWriter>>>,
    stats: Mutex<DemultiplexStats>,
    corrections: Mutex<CorrectionLog>,
    failures: Mutex<Vec<anyhow::Error>>,
    progress: ProgressTracker,
}

impl<'a> Workers<'a> {
    /// Runs one worker until the input is exhausted, recording any error that stopped it.
    fn run_worker(&self, worker: usize) {
        if let Err(e) = self.drain() {
            error!("Demultiplexing worker {} stopped: {:#}", worker, e);
            self.failures.lock().push(e);
        }
    }

    /// Demultiplexes chunks until the source is empty.
    ///
    /// A failure to read or classify a chunk ends that input only.  A failure to write ends the
    /// worker.
    fn drain(&self) -> Result<()> {
        loop {
            let next = self.source.lock().next_chunk();
            let chunk = match next {
                None => return Ok(()),
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    error!("{:#}", e);
                    self.failures.lock().push(e);
                    continue;
                }
            };

            let group = match self.demuxer.demultiplex(&chunk.records) {
                Ok(group) => group,
                Err(e) => {
                    self.source.lock().abandon(chunk.unit);
                    let e = e.context(format!("Stopped reading input {}", chunk.unit + 1));
                    error!("{:#}", e);
                    self.failures.lock().push(e);
                    continue;
                }
            };

            for (writer, reads) in self.writers.iter().zip(group.per_sample_reads) {
                if !reads.is_empty() {
                    writer.lock().write_records(reads)?;
                }
            }
            self.stats.lock().update_with(group.stats);
            self.corrections.lock().update_with(group.corrections);
            self.progress.record(chunk.records.len() as u64);
        }
    }
}

/// Checks the options that can be checked before anything is read.
fn preflight(opts: &Opts) -> Result<()> {
    ensure!(
        opts.output_dir.exists(),
        "Output directory does not exist: {}",
        &opts.output_dir.to_string_lossy()
    );
    ensure!(!opts.r1_fastqs.is_empty(), "At least one read 1 FASTQ must be given");
    ensure!(
        opts.r2_fastqs.is_empty() || opts.r2_fastqs.len() == opts.r1_fastqs.len(),
        "The same number of read 2 FASTQs ({}) as read 1 FASTQs ({}) must be given",
        opts.r2_fastqs.len(),
        opts.r1_fastqs.len()
    );
    ensure!(
        opts.start_offset <= MAX_START_OFFSET,
        "The start offset must be at most {}, found {}",
        MAX_START_OFFSET,
        opts.start_offset
    );
    ensure!(
        !opts.double_barcodes || opts.is_paired(),
        "Double barcodes require paired input (--r2-fastqs)"
    );
    ensure!(opts.threads > 0, "At least one demultiplexing thread is required");
    for fastq in opts.r1_fastqs.iter().chain(opts.r2_fastqs.iter()) {
        ensure!(fastq.exists(), "Input FASTQ does not exist: {}", fastq.to_string_lossy());
    }
    Ok(())
}

/// Loads the enzymes and samples, and checks the samples against the options.
fn load_catalog(opts: &Opts) -> Result<SampleCatalog> {
    let enzymes = match &opts.enzymes {
        Some(path) => EnzymeTable::from_path(path, opts.replace_enzymes)
            .with_context(|| format!("Failed to read enzymes from {}", path.to_string_lossy()))?,
        None => EnzymeTable::builtin(),
    };
    info!("Using {} enzymes", enzymes.len());

    let catalog = SampleSheet::from_path(&opts.sample_info, &enzymes).with_context(|| {
        format!("Failed to read sample info from {}", opts.sample_info.to_string_lossy())
    })?;
    if opts.double_barcodes {
        ensure!(
            catalog.is_double_barcoded(),
            "Double barcodes were requested but the samples have no second barcode"
        );
    } else {
        ensure!(
            !catalog.is_double_barcoded(),
            "The samples have a second barcode, use --double-barcodes"
        );
    }
    if opts.self_correcting_barcodes {
        catalog.validate_self_correcting()?;
    }
    ensure!(
        catalog.samples().iter().all(|s| s.sample_id != opts.undetermined_name),
        "No sample may be named {}",
        opts.undetermined_name
    );
    info!("Read {} samples", catalog.len());
    Ok(catalog)
}

/// The number of mismatch histogram columns always written to the statistics file.
fn max_mismatches(opts: &Opts, catalog: &SampleCatalog) -> usize {
    let per_read = catalog
        .samples()
        .iter()
        .map(|s| s.barcode_mismatches(opts.barcode_mismatches))
        .max()
        .unwrap_or(opts.barcode_mismatches)
        + opts.enzyme_mismatches;
    if opts.double_barcodes {
        2 * per_read
    } else {
        per_read
    }
}

/// Run demultiplexing.
#[allow(clippy::too_many_lines)]
pub fn run(opts: Opts) -> Result<(), anyhow::Error> {
    info!("{} {}", TOOL_NAME, built_info::VERSION.as_str());
    preflight(&opts)?;
    let catalog = load_catalog(&opts)?;
    let paired = opts.is_paired();

    info!("Creating writer threads");
    let output_dir = opts.output_dir.absolutize()?.to_path_buf();
    info!("Writing to {}", output_dir.to_string_lossy());
    let names = catalog
        .samples()
        .iter()
        .map(|s| s.sample_id.as_str())
        .chain(std::iter::once(opts.undetermined_name.as_str()))
        .collect_vec();
    let files: Result<Vec<_>> = names
        .iter()
        .flat_map(|name| output_fastqs(&output_dir, name, paired))
        .map(|path| {
            File::create(&path)
                .with_context(|| format!("Unable to create file: {}", path.to_string_lossy()))
                .map(|f| BufWriter::with_capacity(BUFSIZE, f))
        })
        .collect();
    let group_size = if paired { 2 } else { 1 };
    let (mut pool, pooled_writers) = Pool::new::<_, BgzfCompressor>(
        opts.writer_threads,
        opts.compressor_threads,
        2,
        files?,
    )?;
    let mut writers = vec![];
    for (name, grouped_writers) in names.iter().zip(&pooled_writers.into_iter().chunks(group_size))
    {
        writers.push(Arc::new(Mutex::new(PooledSampleWriter::new(
            *name,
            grouped_writers.collect::<Vec<_>>(),
        )?)));
    }

    info!("Creating reader threads");
    let workers = Workers {
        source: Mutex::new(FastqSource::new(
            opts.input_units(),
            opts.chunksize,
            opts.decompression_threads_per_reader,
        )),
        demuxer: build_demultiplexer(
            opts.distance_algorithm,
            &catalog,
            opts.locator_config(),
            opts.trim_config(),
            opts.quality_encoding,
            paired,
        ),
        writers,
        stats: Mutex::new(DemultiplexStats::new(catalog.len(), opts.quality_encoding)),
        corrections: Mutex::new(CorrectionLog::new(catalog.len())),
        failures: Mutex::new(vec![]),
        progress: ProgressTracker::new("Processed"),
    };

    info!("Processing data with {} threads", opts.threads);
    let rpool = rayon::ThreadPoolBuilder::new()
        .num_threads(opts.threads)
        .build()
        .context("Failed to build the demultiplexing thread pool")?;
    rpool.scope(|scope| {
        for worker in 0..opts.threads {
            let workers = &workers;
            scope.spawn(move |_| workers.run_worker(worker));
        }
    });
    workers.progress.log_final();

    let Workers { writers, stats, corrections, failures, .. } = workers;
    let mut failures = failures.into_inner();

    info!("Joining writer threads");
    for w in writers {
        let result = match Arc::try_unwrap(w) {
            Ok(w) => w.into_inner().finish(),
            Err(_) => Err(anyhow::anyhow!("Writer lock is still held")),
        };
        if let Err(e) = result {
            error!("{:#}", e);
            failures.push(e);
        }
    }

    // the reports are written even when the pool fails to stop
    info!("Stopping pool");
    if let Err(e) = pool.stop_pool() {
        let e = anyhow::Error::from(e).context("Failed to stop the writer pool");
        error!("{:#}", e);
        failures.push(e);
    }

    info!("Writing reports");
    let stats = stats.into_inner();
    stats.write(
        output_dir.join(DEMULTIPLEX_STATS_FILE),
        catalog.samples(),
        &opts.undetermined_name,
        max_mismatches(&opts, &catalog),
    )?;
    stats.write_undetermined_metrics(output_dir.join(UNDETERMINED_METRICS_FILE))?;
    corrections.into_inner().write(output_dir.join(CORRECTION_LOG_FILE), catalog.samples())?;

    let assigned: usize = stats.per_sample.iter().map(|s| s.total - s.rejected).sum();
    info!(
        "Assigned {} of {} fragments to samples, {} undetermined",
        assigned,
        stats.grand_total(),
        stats.grand_total() - assigned
    );

    if !failures.is_empty() {
        bail!(
            "{} failure(s) while demultiplexing:\n{}",
            failures.len(),
            failures.iter().map(|e| format!("{:#}", e)).join("\n")
        );
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use std::{
        collections::HashMap,
        fs::create_dir,
        path::{Path, PathBuf},
    };

    use csv::ReaderBuilder;
    use fgoxide::io::Io;
    use rstest::rstest;
    use seq_io::fastq::OwnedRecord;

    use super::run;
    use crate::{
        distance::DistanceKind,
        metrics::{CORRECTION_LOG_FILE, DEMULTIPLEX_STATS_FILE, UNDETERMINED_METRICS_FILE},
        opts::Opts,
        sequence::reverse_complement,
        utils::test_commons::{
            slurp_fastq, write_reads_to_file, write_sample_info, write_test_enzymes, Fq,
        },
    };

    const ADAPTOR: &[u8] = b"AGATCGGAAGAGCG";

    fn body(units: usize) -> Vec<u8> {
        b"GATTACAGGT".repeat(units)
    }

    fn fq(name: &str, bases: &[u8]) -> OwnedRecord {
        Fq { name, bases, ..Fq::default() }.to_owned_record()
    }

    /// Sets up the output directory, the enzyme file and a two sample info file.
    fn setup(dir: &Path, sample_lines: &[&str]) -> Opts {
        let output = dir.join("output");
        create_dir(&output).unwrap();
        Opts {
            sample_info: write_sample_info(dir, sample_lines),
            enzymes: Some(write_test_enzymes(dir)),
            output_dir: output,
            barcode_mismatches: 0,
            enzyme_mismatches: 0,
            ..Opts::default()
        }
    }

    fn read_tsv(path: impl AsRef<Path>) -> Vec<HashMap<String, String>> {
        let mut reader =
            ReaderBuilder::new().delimiter(b'\t').from_path(path).expect("Unable to open TSV");
        reader.deserialize().map(Result::unwrap).collect()
    }

    fn stats_by_sample(output: &Path) -> HashMap<String, HashMap<String, String>> {
        read_tsv(output.join("demultiplex_stats.tsv"))
            .into_iter()
            .map(|row| (row["sample"].clone(), row))
            .collect()
    }

    fn single_end_reads() -> Vec<OwnedRecord> {
        vec![
            fq("q1", &[&b"ACGTCAGC"[..], &body(3), ADAPTOR].concat()),
            fq("q2", &[&b"TTGACAGC"[..], &body(3)].concat()),
            fq("q3", &[&b"GGGGCAGC"[..], &body(3)].concat()),
        ]
    }

    #[rstest]
    fn test_single_end_end_to_end(
        #[values(1, 3)] threads: usize,
        #[values(
            DistanceKind::Hamming,
            DistanceKind::Kmp,
            DistanceKind::Indel,
            DistanceKind::IndelMismatch
        )]
        distance: DistanceKind,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("reads.fq.gz");
        let reads = single_end_reads();
        write_reads_to_file(reads.clone().into_iter(), &input);

        let opts = Opts {
            r1_fastqs: vec![input],
            threads,
            distance_algorithm: distance,
            ..setup(dir.path(), &["S1\tACGT\tTestI", "S2\tTTGA\tTestI"])
        };
        let output = opts.output_dir.clone();
        run(opts).unwrap();

        let s1 = slurp_fastq(output.join("S1.R1.fastq.gz"));
        assert_eq!(s1.len(), 1);
        assert_eq!(s1[0].seq, body(3));
        assert_eq!(s1[0].head, b"q1".to_vec());
        assert_eq!(slurp_fastq(output.join("S2.R1.fastq.gz"))[0].seq, body(3));
        assert_eq!(slurp_fastq(output.join("undetermined.R1.fastq.gz")), vec![reads[2].clone()]);
        assert!(!output.join("S1.R2.fastq.gz").exists());

        let stats = stats_by_sample(&output);
        assert_eq!(stats["S1"]["total_reads"], "1");
        assert_eq!(stats["S1"]["barcode"], "ACGT");
        assert_eq!(stats["S1"]["mismatches_0"], "1");
        assert_eq!(stats["S1"]["bases"], "30");
        assert_eq!(stats["S1"]["percent_q30_bases"], "100.0000");
        assert_eq!(stats["undetermined"]["total_reads"], "1");
        assert_eq!(stats["undetermined"]["percent_of_total"], "33.3333");

        let reasons = read_tsv(output.join("undetermined_metrics.tsv"));
        assert_eq!(reasons.len(), 1);
        assert_eq!(reasons[0]["reason"], "no_match");
        assert_eq!(reasons[0]["count"], "1");

        let log = Io::default().read_lines(&output.join("correction_log.tsv")).unwrap();
        assert!(log[0].starts_with("sample\texact"));
        assert!(log.iter().any(String::is_empty));
        assert!(log.iter().any(|line| line.starts_with("sample\ttrim_ok")));
    }

    #[test]
    fn test_paired_end_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let (r1_path, r2_path) = (dir.path().join("r1.fq.gz"), dir.path().join("r2.fq"));
        let body = body(9);
        let r1 = vec![
            fq("q1 1:N:0", &[&b"ACGTCAGC"[..], &body, b"GCTG", ADAPTOR].concat()),
            fq("q2 1:N:0", &b"T".repeat(40)),
        ];
        let r2 = vec![
            fq(
                "q1 2:N:0",
                &[&b"CAGC"[..], &reverse_complement(&body), b"GCTGACGT", ADAPTOR].concat(),
            ),
            fq("q2 2:N:0", &b"C".repeat(40)),
        ];
        write_reads_to_file(r1.clone().into_iter(), &r1_path);
        write_reads_to_file(r2.clone().into_iter(), &r2_path);

        let opts = Opts {
            r1_fastqs: vec![r1_path],
            r2_fastqs: vec![r2_path],
            ..setup(dir.path(), &["S1\tACGT\tTestI"])
        };
        let output = opts.output_dir.clone();
        run(opts).unwrap();

        let s1_r1 = slurp_fastq(output.join("S1.R1.fastq.gz"));
        let s1_r2 = slurp_fastq(output.join("S1.R2.fastq.gz"));
        assert_eq!(s1_r1[0].seq, body);
        assert_eq!(s1_r2[0].seq, reverse_complement(&body));
        assert_eq!(slurp_fastq(output.join("undetermined.R1.fastq.gz")), vec![r1[1].clone()]);
        assert_eq!(slurp_fastq(output.join("undetermined.R2.fastq.gz")), vec![r2[1].clone()]);

        let stats = stats_by_sample(&output);
        assert_eq!(stats["S1"]["bases"], "180");

        let log = Io::default().read_lines(&output.join("correction_log.tsv")).unwrap();
        let header_index = log.iter().position(|l| l.starts_with("sample\ttrim_ok")).unwrap();
        let header: Vec<&str> = log[header_index].split('\t').collect();
        let row: Vec<&str> = log[header_index + 1].split('\t').collect();
        let column = header.iter().position(|c| *c == "trim_r1_trim_r2_ok").unwrap();
        assert_eq!(row[0], "S1");
        assert_eq!(row[column], "1");
    }

    #[test]
    fn test_scenario_d_short_fragment_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("reads.fq.gz");
        let read = fq("q1", &[&b"ACGTCAGC"[..], &body(2), ADAPTOR].concat());
        write_reads_to_file(std::iter::once(read.clone()), &input);

        let opts = Opts {
            r1_fastqs: vec![input],
            min_length: 30,
            ..setup(dir.path(), &["S1\tACGT\tTestI"])
        };
        let output = opts.output_dir.clone();
        run(opts).unwrap();

        assert!(slurp_fastq(output.join("S1.R1.fastq.gz")).is_empty());
        assert_eq!(slurp_fastq(output.join("undetermined.R1.fastq.gz")), vec![read]);
        let stats = stats_by_sample(&output);
        assert_eq!(stats["S1"]["total_reads"], "1");
        assert_eq!(stats["S1"]["rejected_reads"], "1");
        assert_eq!(stats["S1"]["percent_rejected"], "100.0000");
        assert_eq!(stats["undetermined"]["total_reads"], "0");
        let reasons = read_tsv(output.join("undetermined_metrics.tsv"));
        assert_eq!(reasons[0]["reason"], "too_short");
    }

    #[test]
    fn test_every_fragment_is_counted_once() {
        let dir = tempfile::tempdir().unwrap();
        let inputs: Vec<PathBuf> =
            (0..2).map(|i| dir.path().join(format!("reads{}.fq.gz", i))).collect();
        for input in &inputs {
            let reads = (0..150).map(|i| {
                let prefix: &[u8] = match i % 4 {
                    0 => b"ACGTCAGC",
                    1 => b"TTGACAGC",
                    2 => b"ACGTCAGCAANAA",
                    _ => b"CCCCCCCC",
                };
                let name = format!("q{}", i);
                fq(&name, &[prefix, &body(2)].concat())
            });
            write_reads_to_file(reads, input);
        }

        let opts = Opts {
            r1_fastqs: inputs,
            threads: 4,
            chunksize: std::num::NonZeroUsize::new(7).unwrap(),
            ..setup(dir.path(), &["S1\tACGT\tTestI", "S2\tTTGA\tTestI"])
        };
        let output = opts.output_dir.clone();
        run(opts).unwrap();

        let stats = stats_by_sample(&output);
        let total: usize = stats.values().map(|row| row["total_reads"].parse::<usize>().unwrap()).sum();
        assert_eq!(total, 300);
        // 38 of every 150 reads go to S1 and S2, 37 have an N and 37 match nothing
        assert_eq!(stats["S1"]["total_reads"], "150");
        assert_eq!(stats["S1"]["rejected_reads"], "74");
        assert_eq!(stats["S2"]["total_reads"], "76");
        assert_eq!(stats["undetermined"]["total_reads"], "74");
        assert_eq!(slurp_fastq(output.join("S1.R1.fastq.gz")).len(), 76);
        assert_eq!(slurp_fastq(output.join("undetermined.R1.fastq.gz")).len(), 148);
    }

    #[test]
    fn test_mismatched_read_names_fail_the_run_but_write_reports() {
        let dir = tempfile::tempdir().unwrap();
        let (r1_path, r2_path) = (dir.path().join("r1.fq.gz"), dir.path().join("r2.fq.gz"));
        write_reads_to_file(std::iter::once(fq("q1", b"ACGTCAGCGATTACA")), &r1_path);
        write_reads_to_file(std::iter::once(fq("q2", b"CAGCGATTACA")), &r2_path);

        let opts = Opts {
            r1_fastqs: vec![r1_path],
            r2_fastqs: vec![r2_path],
            ..setup(dir.path(), &["S1\tACGT\tTestI"])
        };
        let output = opts.output_dir.clone();
        let error = run(opts).unwrap_err();
        assert!(format!("{:#}", error).contains("Read names did not match"));
        for report in [DEMULTIPLEX_STATS_FILE, UNDETERMINED_METRICS_FILE, CORRECTION_LOG_FILE] {
            assert!(output.join(report).exists(), "{} was not written", report);
        }
    }

    #[rstest]
    #[should_panic(expected = "The start offset must be at most 20")]
    #[case(Opts { start_offset: 21, ..Opts::default() }, false)]
    #[should_panic(expected = "The same number of read 2 FASTQs")]
    #[case(Opts { r2_fastqs: vec![PathBuf::from("a"), PathBuf::from("b")], ..Opts::default() }, false)]
    #[should_panic(expected = "Double barcodes require paired input")]
    #[case(Opts { double_barcodes: true, ..Opts::default() }, false)]
    #[should_panic(expected = "Output directory does not exist")]
    #[case(Opts::default(), true)]
    #[should_panic(expected = "The samples have a second barcode, use --double-barcodes")]
    #[case(Opts::default(), false)]
    fn test_preflight_failures(#[case] opts: Opts, #[case] missing_output: bool) {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("reads.fq.gz");
        write_reads_to_file(single_end_reads().into_iter(), &input);
        let base = setup(dir.path(), &["S1\tACGT\tTestI\t\tGGCC"]);
        let output_dir =
            if missing_output { dir.path().join("missing") } else { base.output_dir.clone() };
        let opts = Opts {
            r1_fastqs: vec![input],
            sample_info: base.sample_info,
            enzymes: base.enzymes,
            output_dir,
            ..opts
        };
        run(opts).unwrap();
    }
}
