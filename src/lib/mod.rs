//! A library for demultiplexing and trimming Genotyping-by-Sequencing (GBS) and RAD FASTQs.
//!
//! # Overview
//!
//! The flow of data is as follows:
//!
//! - The [`thread_reader::FastqSource`] hands out chunks of FASTQ records read by one
//!   [`thread_reader::ThreadReader`] per input file, zipping read 1 and read 2 together.
//! - The [`demux::Demultiplexer`] locates each fragment's sample with the [`matcher::Locator`],
//!   trims it with the [`trim::Trimmer`], and groups the chunk into a [`demux::DemuxedGroup`].
//! - The [`pooled_sample_writer::PooledSampleWriter`] takes each of the
//!   [`demux::OutputPerSampleReads`] in the [`demux::DemuxedGroup`] and writes them to their
//!   respective writers.
//! - [`metrics`] are collected per chunk and merged once all workers have finished.
#![deny(unsafe_code)]
#![allow(
    clippy::must_use_candidate,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions
)]
pub mod demux;
pub mod distance;
pub mod enzyme;
pub mod matcher;
pub mod metrics;
pub mod opts;
pub mod pooled_sample_writer;
pub mod progress;
pub mod run;
pub mod sample_metadata;
pub mod sample_sheet;
pub mod sequence;
pub mod thread_reader;
pub mod trim;
pub mod utils;
