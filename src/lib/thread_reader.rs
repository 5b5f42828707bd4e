//! A [`ThreadReader`] allows for pushing the reading of a FASTQ file onto a separate thread.
//!
//! BGZF input is decompressed by a pooled decompressor with a default of 4 threads, other gzip
//! input by a single-threaded multi-member decoder.  The reader thread also does the initial
//! parsing of the FASTQ file into N sized chunks of FASTQ records.
//!
//! A [`FastqSource`] hands the chunks of all input units out to the demultiplexing workers.

use std::{
    collections::VecDeque,
    fs::File,
    io::{BufReader, Read},
    num::NonZeroUsize,
    path::PathBuf,
    thread::JoinHandle,
};

use anyhow::{anyhow, Context, Result};
use flate2::read::MultiGzDecoder;
use flume::{bounded, Receiver};
use gzp::{deflate::Bgzf, par::decompress::ParDecompressBuilder, BUFSIZE};
use itertools::Itertools;
use log::{debug, info};
use seq_io::fastq::{self, RecordSet};

use crate::{demux::PerFastqRecordSet, utils::InputFormat};

/// The number of chunks to allow in the reader channel at one time.
const READER_CHANNEL_SIZE: usize = 100;

/// A struct to hold onto the handle for a thread that is reading chunks of FASTQ from a file.
pub struct ThreadReader {
    /// The [`JoinHandle`] for the thread that is reading.
    pub handle: JoinHandle<Result<()>>,
    /// The channel that will be receiving [`RecordSet`]s.
    pub rx: Receiver<RecordSet>,
}

impl ThreadReader {
    /// Create a new [`ThreadReader`] for a given file that will read `chunksize` records at a time.
    // Chunksize can't be zero or `seq_io` would try to read the whole file into one record set.
    pub fn new(
        file: PathBuf,
        chunksize: NonZeroUsize,
        decompression_threads_per_reader: usize,
    ) -> Self {
        let (tx, rx) = bounded(READER_CHANNEL_SIZE);
        let handle = std::thread::spawn(move || {
            let format = InputFormat::sniff(&file)?;
            debug!("Reading {} as {:?}", file.to_string_lossy(), format);
            let reader = BufReader::with_capacity(
                BUFSIZE,
                File::open(&file)
                    .with_context(|| format!("Failed to open {}", file.to_string_lossy()))?,
            );

            let decoded: Box<dyn Read> = match format {
                InputFormat::Bgzf => Box::new(
                    ParDecompressBuilder::<Bgzf>::new()
                        .num_threads(decompression_threads_per_reader)
                        .with_context(|| {
                            format!(
                                "Error in setting threads when creating decompressor for {}",
                                file.to_string_lossy()
                            )
                        })?
                        .from_reader(reader),
                ),
                InputFormat::Gzip => Box::new(MultiGzDecoder::new(reader)),
                InputFormat::Plain => Box::new(reader),
            };
            let mut reader = fastq::Reader::with_capacity(decoded, BUFSIZE);

            loop {
                let mut record_set = RecordSet::default();
                let filled_set = reader
                    .read_record_set_exact(&mut record_set, usize::from(chunksize))
                    .with_context(|| {
                        format!("Failed reading record set from {}", file.to_string_lossy())
                    })?;
                if !filled_set {
                    break;
                }
                tx.send(record_set).context("Failed to send record set from reader")?;
            }
            Ok(())
        });

        Self { handle, rx }
    }

    /// Stops receiving and waits for the reader thread, returning its result.
    pub fn join(self) -> Result<()> {
        let Self { handle, rx } = self;
        drop(rx);
        match handle.join() {
            Ok(result) => result,
            Err(e) => std::panic::resume_unwind(e),
        }
    }
}

/// The FASTQs of one independent input: read 1 and, for paired data, read 2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputUnit {
    pub r1: PathBuf,
    pub r2: Option<PathBuf>,
}

impl InputUnit {
    pub fn files(&self) -> impl Iterator<Item = &PathBuf> {
        std::iter::once(&self.r1).chain(self.r2.as_ref())
    }

    fn describe(&self) -> String {
        self.files().map(|f| f.to_string_lossy()).join(" + ")
    }
}

/// A chunk of whole fragments from one input unit.
#[derive(Debug)]
pub struct Chunk {
    /// Index of the [`InputUnit`] the records came from.
    pub unit: usize,
    pub records: PerFastqRecordSet,
}

struct OpenUnit {
    index: usize,
    unit: InputUnit,
    readers: Vec<ThreadReader>,
}

/// The work queue shared by all demultiplexing workers.
///
/// Input units are opened one at a time, in order.  Callers serialize access through a mutex so
/// each [`Chunk`] leaves the source whole, with the read 1 and read 2 record sets zipped together.
pub struct FastqSource {
    pending: VecDeque<(usize, InputUnit)>,
    current: Option<OpenUnit>,
    chunksize: NonZeroUsize,
    decompression_threads_per_reader: usize,
}

impl FastqSource {
    pub fn new(
        units: Vec<InputUnit>,
        chunksize: NonZeroUsize,
        decompression_threads_per_reader: usize,
    ) -> Self {
        Self {
            pending: units.into_iter().enumerate().collect(),
            current: None,
            chunksize,
            decompression_threads_per_reader,
        }
    }

    /// Returns the next chunk, or `None` once every unit has been read.
    ///
    /// An error ends the unit that produced it; the next call moves on to the following unit.
    pub fn next_chunk(&mut self) -> Option<Result<Chunk>> {
        loop {
            if self.current.is_none() {
                let (index, unit) = self.pending.pop_front()?;
                info!("Reading input {}", unit.describe());
                let readers = unit
                    .files()
                    .map(|f| {
                        ThreadReader::new(
                            f.clone(),
                            self.chunksize,
                            self.decompression_threads_per_reader,
                        )
                    })
                    .collect();
                self.current = Some(OpenUnit { index, unit, readers });
            }
            let open = self.current.as_mut()?;

            let received: Vec<Option<RecordSet>> =
                open.readers.iter().map(|r| r.rx.recv().ok()).collect();
            let index = open.index;

            if received.iter().all(Option::is_some) {
                let sets = received.into_iter().flatten().collect();
                return Some(match PerFastqRecordSet::new(sets) {
                    Ok(records) => Ok(Chunk { unit: index, records }),
                    Err(e) => {
                        let description = open.unit.describe();
                        self.abandon(index);
                        Err(e.context(format!("Failed reading {}", description)))
                    }
                });
            }

            // At least one reader is done: either the unit ended or a reader failed.
            let open = self.current.take()?;
            let description = open.unit.describe();
            let uneven = received.iter().any(Option::is_some);
            let (ended, running): (Vec<_>, Vec<_>) = open
                .readers
                .into_iter()
                .zip(received.iter())
                .partition(|(_, set)| set.is_none());
            let mut result: Result<()> = Ok(());
            for (reader, _) in ended {
                if let Err(e) = reader.join() {
                    result = result.and(Err(e));
                }
            }
            for (reader, _) in running {
                let _ = reader.join();
            }
            match result {
                Err(e) => return Some(Err(e.context(format!("Failed reading {}", description)))),
                Ok(()) if uneven => {
                    return Some(Err(anyhow!(
                        "Uneven input, read 1 and read 2 have a different number of records: {}",
                        description
                    )))
                }
                Ok(()) => info!("Finished reading {}", description),
            }
        }
    }

    /// Stops reading the unit with the given index if it is still open.
    pub fn abandon(&mut self, unit: usize) {
        if self.current.as_ref().map_or(false, |open| open.index == unit) {
            if let Some(open) = self.current.take() {
                for reader in open.readers {
                    let _ = reader.join();
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::num;

    use rstest::rstest;
    use seq_io::fastq::OwnedRecord;
    use tempfile::tempdir;

    use super::*;
    use crate::utils::test_commons::{generate_reads, write_reads_to_file};

    #[rstest]
    #[case(1, 10)]
    #[case(10, 1)]
    #[case(0, 100)]
    #[should_panic]
    #[case(100, 0)] // 0 is an illegal chunksize
    #[case(100, 1)]
    #[case(100_000, 500)]
    fn test_thread_reader(#[case] reads_in_file: usize, #[case] chunksize: usize) {
        let dir = tempdir().unwrap();
        let file = dir.path().join("reads.fastq.gz");
        let reads = generate_reads(1, "frag", reads_in_file);
        write_reads_to_file(reads.clone().into_iter(), &file);

        let reader = super::ThreadReader::new(file, num::NonZeroUsize::new(chunksize).unwrap(), 4);
        let seen_reads: Vec<OwnedRecord> = reader
            .rx
            .iter()
            .flat_map(|chunk| {
                chunk.into_iter().map(|record| record.to_owned_record()).collect::<Vec<_>>()
            })
            .collect();
        assert_eq!(seen_reads, reads);
    }

    #[test]
    fn test_thread_reader_plain_text() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("reads.fastq");
        let reads = generate_reads(1, "frag", 25);
        write_reads_to_file(reads.clone().into_iter(), &file);

        let reader = ThreadReader::new(file, NonZeroUsize::new(10).unwrap(), 1);
        let sizes: Vec<usize> = reader.rx.iter().map(|set| set.len()).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
        assert!(reader.join().is_ok());
    }

    #[test]
    fn test_thread_reader_missing_file() {
        let dir = tempdir().unwrap();
        let reader = ThreadReader::new(dir.path().join("missing.fq"), NonZeroUsize::new(10).unwrap(), 1);
        assert!(reader.rx.iter().next().is_none());
        assert!(reader.join().is_err());
    }

    fn source(units: Vec<InputUnit>) -> FastqSource {
        FastqSource::new(units, NonZeroUsize::new(10).unwrap(), 1)
    }

    #[test]
    fn test_source_reads_units_in_order() {
        let dir = tempdir().unwrap();
        let mut units = vec![];
        for (i, count) in [25, 5].iter().enumerate() {
            let r1 = dir.path().join(format!("u{}.R1.fq.gz", i));
            let r2 = dir.path().join(format!("u{}.R2.fq.gz", i));
            write_reads_to_file(generate_reads(i, "R1", *count).into_iter(), &r1);
            write_reads_to_file(generate_reads(i, "R2", *count).into_iter(), &r2);
            units.push(InputUnit { r1, r2: Some(r2) });
        }

        let mut source = source(units);
        let mut seen = vec![];
        while let Some(chunk) = source.next_chunk() {
            let chunk = chunk.unwrap();
            seen.push((chunk.unit, chunk.records.len()));
        }
        assert_eq!(seen, vec![(0, 10), (0, 10), (0, 5), (1, 5)]);
        assert!(source.next_chunk().is_none());
    }

    #[test]
    fn test_source_reports_uneven_input_and_continues() {
        let dir = tempdir().unwrap();
        let r1 = dir.path().join("bad.R1.fq.gz");
        let r2 = dir.path().join("bad.R2.fq.gz");
        write_reads_to_file(generate_reads(1, "R1", 20).into_iter(), &r1);
        write_reads_to_file(generate_reads(1, "R2", 10).into_iter(), &r2);
        let good = dir.path().join("good.fq.gz");
        write_reads_to_file(generate_reads(2, "R1", 3).into_iter(), &good);

        let mut source =
            source(vec![InputUnit { r1, r2: Some(r2) }, InputUnit { r1: good, r2: None }]);
        assert_eq!(source.next_chunk().unwrap().unwrap().records.len(), 10);
        let error = source.next_chunk().unwrap().unwrap_err();
        assert!(format!("{:#}", error).contains("Uneven input"));
        let chunk = source.next_chunk().unwrap().unwrap();
        assert_eq!((chunk.unit, chunk.records.len()), (1, 3));
        assert!(source.next_chunk().is_none());
    }

    #[test]
    fn test_source_reports_missing_file() {
        let dir = tempdir().unwrap();
        let mut source = source(vec![InputUnit { r1: dir.path().join("missing.fq"), r2: None }]);
        assert!(source.next_chunk().unwrap().is_err());
        assert!(source.next_chunk().is_none());
    }

    #[test]
    fn test_abandon_moves_to_next_unit() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("first.fq.gz");
        let second = dir.path().join("second.fq.gz");
        write_reads_to_file(generate_reads(1, "R1", 30).into_iter(), &first);
        write_reads_to_file(generate_reads(2, "R1", 4).into_iter(), &second);

        let mut source =
            source(vec![InputUnit { r1: first, r2: None }, InputUnit { r1: second, r2: None }]);
        let chunk = source.next_chunk().unwrap().unwrap();
        source.abandon(chunk.unit);
        let chunk = source.next_chunk().unwrap().unwrap();
        assert_eq!((chunk.unit, chunk.records.len()), (1, 4));
    }
}
