//! Utility functions.
use std::{
    fs::File,
    io::{BufReader, Read},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use gzp::{deflate::Bgzf, BlockFormatSpec, BUFSIZE};

use crate::matcher::Mate;

pub mod built_info {
    use lazy_static::lazy_static;
    include!(concat!(env!("OUT_DIR"), "/built.rs"));

    /// Get a software version string including
    ///   - Git commit hash
    ///   - Git dirty info (whether the repo had uncommitted changes)
    ///   - Cargo package version if no git info found
    fn get_software_version() -> String {
        let prefix = if let Some(s) = GIT_COMMIT_HASH {
            format!("{}-{}", PKG_VERSION, s[0..8].to_owned())
        } else {
            // This shouldn't happen
            PKG_VERSION.to_string()
        };
        let suffix = match GIT_DIRTY {
            Some(true) => "-dirty",
            _ => "",
        };
        format!("{}{}", prefix, suffix)
    }

    lazy_static! {
        /// Version of the software with git hash
        pub static ref VERSION: String = get_software_version();
    }
}

/// The FASTQ file name for one mate of an output, e.g. `Sample1.R1.fastq.gz`.
pub fn fastq_filename(name: &str, mate: Mate) -> String {
    format!("{}.{}.fastq.gz", name, mate)
}

/// The output FASTQ paths for one sample (or the undetermined sink), read 1 first.
pub fn output_fastqs<P: AsRef<Path>>(output_dir: P, name: &str, paired: bool) -> Vec<PathBuf> {
    let mates: &[Mate] = if paired { &[Mate::R1, Mate::R2] } else { &[Mate::R1] };
    mates.iter().map(|mate| output_dir.as_ref().join(fastq_filename(name, *mate))).collect()
}

/// A `MultiZip` object allows for zipping over N items.
///
/// For example, if you have a `Vec` of length 10 of `Vec`s this will pull one item from
/// each of the 10 inner vecs and return a `Vec` of length 10 with those items.
///
/// This will stop iteration as soon as the first of the inner vecs runs out of items.
pub struct MultiZip<T>(Vec<T>);

impl<T> MultiZip<T> {
    /// Create a new [`MultiZip`] iterator over a `Vec` of items.
    #[must_use]
    pub fn new(items: Vec<T>) -> Self {
        Self(items)
    }
}

impl<T> Iterator for MultiZip<T>
where
    T: Iterator,
{
    type Item = Vec<T::Item>;
    fn next(&mut self) -> Option<Self::Item> {
        self.0.iter_mut().map(Iterator::next).collect()
    }
}

/// The compression of an input FASTQ, as told by its leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    /// Block gzip, decompressed in parallel.
    Bgzf,
    /// Any other gzip, including multi-member files.
    Gzip,
    Plain,
}

impl InputFormat {
    /// Sniffs the format of the file at `path` from its magic bytes.
    pub fn sniff<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open {}", path.to_string_lossy()))?;
        let mut header = Vec::with_capacity(Bgzf::HEADER_SIZE);
        BufReader::with_capacity(BUFSIZE, file)
            .take(Bgzf::HEADER_SIZE as u64)
            .read_to_end(&mut header)
            .with_context(|| format!("Failed to read from {}", path.to_string_lossy()))?;
        Ok(Self::from_header(&header))
    }

    fn from_header(bytes: &[u8]) -> Self {
        if bytes.len() < 3 || bytes[0] != 31 || bytes[1] != 139 || bytes[2] != 8 {
            Self::Plain
        } else if bytes.len() == Bgzf::HEADER_SIZE
            && bytes[3] & 4 == 4
            && bytes[12] == b'B'
            && bytes[13] == b'C'
        {
            Self::Bgzf
        } else {
            Self::Gzip
        }
    }
}

#[cfg(test)]
pub mod test_commons {
    //! Common utility methods for testing demultiplexing.

    use std::{
        fs::File,
        io::{BufReader, BufWriter, Write},
        path::{Path, PathBuf},
    };

    use bgzf::CompressionLevel;
    use seq_io::fastq::{OwnedRecord, Reader, RecordSet};
    use tempfile::NamedTempFile;

    /// Configuration struct for creating a FASTQ read
    #[derive(Debug, Default, Clone, Copy)]
    pub struct Fq<'a> {
        pub name: &'a str,
        pub bases: &'a [u8],
        pub quals: Option<&'a [u8]>,
        pub comment: Option<&'a str>,
    }

    impl<'a> Fq<'a> {
        /// Convert the configuration into an [`OwnedRecord`].
        pub fn to_owned_record(&self) -> OwnedRecord {
            let head = match self.comment {
                Some(comment) => format!("{} {}", self.name, comment),
                None => self.name.to_string(),
            };

            let qual = if let Some(qual) = self.quals {
                assert_eq!(qual.len(), self.bases.len());
                qual.to_vec()
            } else {
                vec![b'I'; self.bases.len()]
            };

            OwnedRecord { head: head.into_bytes(), seq: self.bases.to_vec(), qual }
        }
    }

    /// Write a set of fastq reads to a file, returning the number of reads written.
    ///
    /// If the file extension is `gz` the reads will be BGZF compressed
    pub fn write_reads_to_file(
        reads: impl Iterator<Item = OwnedRecord>,
        file: impl AsRef<Path>,
    ) -> usize {
        let mut num_written = 0;
        let mut writer: Box<dyn Write> =
            if file.as_ref().extension().map_or(false, |ext| ext == "gz") {
                Box::new(bgzf::Writer::new(
                    BufWriter::new(File::create(file).unwrap()),
                    CompressionLevel::new(3).unwrap(),
                ))
            } else {
                Box::new(BufWriter::new(File::create(file).unwrap()))
            };
        for read in reads {
            read.write(&mut writer).unwrap();
            num_written += 1;
        }
        writer.flush().unwrap();
        num_written
    }

    /// Convert a collection of [`OwnedRecord`]s into a [`RecordSet`].
    pub fn reads_to_record_set(reads: impl Iterator<Item = OwnedRecord>) -> RecordSet {
        let file = NamedTempFile::new().unwrap();
        let num_written = write_reads_to_file(reads, file.path());
        let mut reader = Reader::from_path(file.path()).unwrap();
        let mut record_set = RecordSet::default();
        if num_written > 0 {
            reader.read_record_set_exact(&mut record_set, num_written).unwrap();
        }
        record_set
    }

    /// Slurp all records out of a BGZF FASTQ file
    pub fn slurp_fastq(file: impl AsRef<Path>) -> Vec<OwnedRecord> {
        let reader = bgzf::Reader::new(BufReader::new(
            File::open(&file).unwrap_or_else(|_| panic!("Unable to open {:?}", &file.as_ref())),
        ));
        let mut reader = Reader::new(reader);
        reader.records().map(Result::unwrap).collect()
    }

    /// A more generic way to create reads that allows for unique name for each read
    pub fn generate_reads(
        sample_num: usize,
        read_name: &str,
        num_reads: usize,
    ) -> Vec<OwnedRecord> {
        let mut reads = vec![];
        for i in 1..=num_reads {
            let name = format!("s{}_read_{}_of_{}_{}", sample_num, i, num_reads, read_name);
            reads.push(OwnedRecord {
                head: name.as_bytes().to_vec(),
                seq: vec![b'A'; 150],
                qual: vec![b'!'; 150],
            });
        }
        reads
    }

    /// Writes a tab-delimited sample info file, one line per sample.
    pub fn write_sample_info(dir: impl AsRef<Path>, lines: &[&str]) -> PathBuf {
        let output = dir.as_ref().join("samples.tsv");
        std::fs::write(&output, lines.join("\n")).expect("Failed to write sample info to file.");
        output
    }

    /// Writes an enzyme file holding `TestI`, which leaves `CAGC`, and `TestII`, which leaves `TTAA`.
    pub fn write_test_enzymes(dir: impl AsRef<Path>) -> PathBuf {
        let output = dir.as_ref().join("enzymes.tsv");
        std::fs::write(&output, "# name\tremnants\nTestI\tCAGC\nTestII\tTTAA\n")
            .expect("Failed to write enzymes to file.");
        output
    }
}
