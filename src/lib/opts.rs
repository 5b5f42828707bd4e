#![forbid(unsafe_code)]

use std::{num::NonZeroUsize, path::PathBuf, vec::Vec};

use bstr::BString;
use clap::Parser;
use env_logger::Env;

use crate::{
    distance::DistanceKind,
    matcher::{LocatorConfig, DEFAULT_ADAPTOR},
    metrics::QualityEncoding,
    thread_reader::InputUnit,
    trim::TrimConfig,
    utils::built_info,
};

pub static TOOL_NAME: &str = "gbsdemux";

/// The sample name used for reads that match no sample.
pub static UNDETERMINED_NAME: &str = "undetermined";

pub static DOC_LINK_AND_SUPPORT_EMAIL: &str =
    "Run `gbsdemux --help` for a description of the input files and options.";

static SHORT_USAGE: &str =
    "Demultiplexes and trims Genotyping-by-Sequencing (GBS) and RAD FASTQs by in-line barcode.";

static LONG_USAGE: &str = "
Demultiplexes and trims Genotyping-by-Sequencing (GBS) and RAD FASTQs by in-line barcode.

Each read 1 starts with a sample barcode followed by the remnant of the restriction enzyme
cut site.  Reads are assigned to the sample whose barcode and remnant match, the barcode and
remnant are removed, and any read-through into the far end of the fragment (the far cut site
or the sequencing adaptor) is trimmed.  Paired reads are trimmed to agree with each other.

Input FASTQs may be BGZF, gzip or uncompressed.  Give one --r1-fastqs entry per input and,
for paired data, the matching --r2-fastqs in the same order.

The sample info file is tab-delimited with no header:

  sample_id  barcode  enzyme  [enzyme2]  [barcode2]  [barcode_mismatches]

Empty optional columns are ignored.  Lines starting with `#` are skipped.  A second barcode
requires --double-barcodes.  Additional enzymes may be given with --enzymes as tab-delimited
`name  remnant[,remnant...]` lines.

Per-sample files named <sample>.R1.fastq.gz (and .R2 for paired input) are written to the
output directory, along with demultiplex_stats.tsv, correction_log.tsv and
undetermined_metrics.tsv.

Example invocation:

gbsdemux \\
  --r1-fastqs lane1_R1.fq.gz \\
  --r2-fastqs lane1_R2.fq.gz \\
  --sample-info samples.tsv \\
  --output-dir demuxed-fastqs/
";

#[derive(Parser, Debug, Clone)]
#[clap(name = TOOL_NAME, version = built_info::VERSION.as_str(), about=SHORT_USAGE, long_about=LONG_USAGE, term_width=0)]
pub struct Opts {
    /// Path to the read 1 FASTQs, one per input.
    #[clap(long, short = '1', display_order = 1, required = true, multiple_values = true)]
    pub r1_fastqs: Vec<PathBuf>,

    /// Path to the read 2 FASTQs, in the same order as the read 1 FASTQs.
    ///
    /// Leave out for single-end data.
    #[clap(long, short = '2', display_order = 1, multiple_values = true)]
    pub r2_fastqs: Vec<PathBuf>,

    /// Path to the tab-delimited sample info file.
    #[clap(long, short = 'i', display_order = 2)]
    pub sample_info: PathBuf,

    /// The directory to write outputs, the directory must exist.
    ///
    /// This tool will overwrite existing files.
    #[clap(long, short, display_order = 3)]
    pub output_dir: PathBuf,

    /// Path to a tab-delimited file of additional enzymes.
    #[clap(long, short = 'e', display_order = 4)]
    pub enzymes: Option<PathBuf>,

    /// Use only the enzymes in --enzymes, ignoring the built-in enzymes.
    #[clap(long, display_order = 4, requires = "enzymes")]
    pub replace_enzymes: bool,

    /// Number of allowed mismatches in the sample barcode.
    ///
    /// A value in the sample info file overrides this for that sample.
    #[clap(long, short = 'b', default_value = "1", display_order = 11)]
    pub barcode_mismatches: usize,

    /// Number of allowed mismatches in the enzyme cut site remnant.
    #[clap(long, short = 'z', default_value = "1", display_order = 11)]
    pub enzyme_mismatches: usize,

    /// Number of allowed mismatches in the adaptor when looking for read-through.
    #[clap(long, short = 'a', default_value = "3", display_order = 11)]
    pub adaptor_mismatches: usize,

    /// Number of allowed mismatches when checking for adaptor ligated directly to the cut site.
    ///
    /// Reads with such an artifact are undetermined.
    ///
    /// [default: None]
    #[clap(long, display_order = 11)]
    pub adaptor_ligation_mismatches: Option<usize>,

    /// The common adaptor that follows the far end of each fragment.
    #[clap(long, default_value = DEFAULT_ADAPTOR, display_order = 12)]
    pub adaptor: String,

    /// The number of adaptor bases to compare.
    #[clap(long, default_value = "10", display_order = 12)]
    pub adaptor_compare_length: usize,

    /// The largest number of bases before the barcode, at most 20.
    #[clap(long, short = 's', default_value = "0", display_order = 12)]
    pub start_offset: usize,

    /// Keep the cut site remnant bases in the output reads.
    #[clap(long, display_order = 21)]
    pub keep_cut_sites: bool,

    /// The library is RAD: read 2 does not start at a cut site and read 1 never reads into one.
    #[clap(long, display_order = 21)]
    pub rad: bool,

    /// Samples carry a second barcode at the start of read 2.
    #[clap(long, display_order = 21)]
    pub double_barcodes: bool,

    /// Barcodes are self-correcting codewords, and are decoded before matching.
    #[clap(long, display_order = 21)]
    pub self_correcting_barcodes: bool,

    /// Read-through is only trimmed at a cut site followed by the adaptor (or second barcode).
    #[clap(long, display_order = 21)]
    pub complete_check: bool,

    /// The minimum read 1 length after trimming; shorter fragments are undetermined.
    #[clap(long, short = 'm', default_value = "0", display_order = 22)]
    pub min_length: usize,

    /// Keep fragments whose trimmed reads contain an N.
    #[clap(long, display_order = 22)]
    pub keep_n: bool,

    /// The algorithm used to compare barcodes, cut sites and adaptors.
    #[clap(long, short = 'd', default_value = "hamming", possible_values = DistanceKind::possible_values(), display_order = 23)]
    pub distance_algorithm: DistanceKind,

    /// The quality encoding of the input FASTQs.
    #[clap(long, short = 'q', default_value = "phred33", possible_values = QualityEncoding::possible_values(), display_order = 23)]
    pub quality_encoding: QualityEncoding,

    /// The sample name for undetermined reads (reads that do not match a sample).
    #[clap(long, short = 'u', default_value = UNDETERMINED_NAME, display_order = 24)]
    pub undetermined_name: String,

    /// Number of threads for demultiplexing.
    #[clap(long, short = 't', default_value = "4", display_order = 31)]
    pub threads: usize,

    /// Number of threads for compressing the output reads.
    #[clap(long, default_value = "4", display_order = 31)]
    pub compressor_threads: usize,

    /// Number of threads for writing compressed reads to output.
    #[clap(long, default_value = "2", display_order = 31)]
    pub writer_threads: usize,

    /// The number of threads to use for decompression for each BGZF reader.
    #[clap(long, default_value = "4", display_order = 31, hide = true)]
    pub decompression_threads_per_reader: usize,

    /// The number of reads to extract from a FASTQ at one time.
    ///
    /// A "chunk" is the unit of parallelization for all of demultiplexing.
    #[clap(long, short = 'c', default_value = "1000", display_order = 31, hide = true)]
    pub chunksize: NonZeroUsize,
}

impl Opts {
    pub fn is_paired(&self) -> bool {
        !self.r2_fastqs.is_empty()
    }

    /// The input units, pairing read 1 and read 2 FASTQs by position.
    pub fn input_units(&self) -> Vec<InputUnit> {
        let mut r2 = self.r2_fastqs.iter().cloned();
        self.r1_fastqs.iter().map(|r1| InputUnit { r1: r1.clone(), r2: r2.next() }).collect()
    }

    /// The leading adaptor bases that are compared.
    pub fn compare_adaptor(&self) -> BString {
        let adaptor = self.adaptor.trim().to_ascii_uppercase().into_bytes();
        let len = self.adaptor_compare_length.min(adaptor.len());
        BString::from(&adaptor[..len])
    }

    pub fn locator_config(&self) -> LocatorConfig {
        LocatorConfig {
            barcode_mismatches: self.barcode_mismatches,
            enzyme_mismatches: self.enzyme_mismatches,
            max_start_offset: self.start_offset,
            self_correcting: self.self_correcting_barcodes,
            double_barcodes: self.double_barcodes,
            adaptor: self.compare_adaptor(),
            adaptor_ligation_mismatches: self.adaptor_ligation_mismatches,
        }
    }

    pub fn trim_config(&self) -> TrimConfig {
        TrimConfig {
            barcode_mismatches: self.barcode_mismatches,
            enzyme_mismatches: self.enzyme_mismatches,
            adaptor_mismatches: self.adaptor_mismatches,
            adaptor: self.compare_adaptor(),
            keep_cut_sites: self.keep_cut_sites,
            rad: self.rad,
            complete_check: self.complete_check,
            min_length: self.min_length,
            keep_n: self.keep_n,
        }
    }
}

/// Implement defaults that match the CLI options to allow for easier testing.
///
/// Note that these defaults exist only within test code.
#[cfg(test)]
impl Default for Opts {
    fn default() -> Self {
        Self {
            r1_fastqs: vec![],
            r2_fastqs: vec![],
            sample_info: PathBuf::default(),
            output_dir: PathBuf::default(),
            enzymes: None,
            replace_enzymes: false,
            barcode_mismatches: 1,
            enzyme_mismatches: 1,
            adaptor_mismatches: 3,
            adaptor_ligation_mismatches: None,
            adaptor: DEFAULT_ADAPTOR.to_string(),
            adaptor_compare_length: 10,
            start_offset: 0,
            keep_cut_sites: false,
            rad: false,
            double_barcodes: false,
            self_correcting_barcodes: false,
            complete_check: false,
            min_length: 0,
            keep_n: false,
            distance_algorithm: DistanceKind::Hamming,
            quality_encoding: QualityEncoding::Phred33,
            undetermined_name: UNDETERMINED_NAME.to_string(),
            threads: 2,
            compressor_threads: 2,
            writer_threads: 2,
            decompression_threads_per_reader: 2,
            chunksize: NonZeroUsize::new(500).unwrap(),
        }
    }
}

/// Parse args and set up logging / tracing
pub fn setup() -> Opts {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    Opts::parse()
}
