//! Chunked compression of a table's row stream into size-bounded segments.
//!
//! A single logical export is split into multiple physical segments so that
//! unbounded-size tables move through bounded local disk and a bounded per-part
//! upload. Each segment is a complete gzip stream spooled to a temporary file;
//! concatenating the segments in part order yields one valid gzip object.

use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use flate2::Compression;
use flate2::write::GzEncoder;
use tempfile::NamedTempFile;

use crate::error::{ErrorKind, EtlResult};
use crate::{bail, etl_error};

/// One bounded-size compressed slice of a table's exported rows.
///
/// Part numbers are 1-based and assigned in generation order. The backing spool is a
/// temporary file that is removed when the segment is dropped, which makes spool
/// cleanup automatic on both the success and the failure path.
#[derive(Debug)]
pub struct ExportSegment {
    part_number: u32,
    spool: NamedTempFile,
    uncompressed_bytes: u64,
    compressed_bytes: u64,
}

impl ExportSegment {
    /// Returns the 1-based part number of this segment.
    pub fn part_number(&self) -> u32 {
        self.part_number
    }

    /// Returns the filesystem path of the backing spool.
    pub fn spool_path(&self) -> &Path {
        self.spool.path()
    }

    /// Returns the number of uncompressed bytes written into this segment.
    pub fn uncompressed_bytes(&self) -> u64 {
        self.uncompressed_bytes
    }

    /// Returns the size of the compressed payload.
    pub fn compressed_bytes(&self) -> u64 {
        self.compressed_bytes
    }
}

/// Compression sink state of the [`SegmentWriter`].
///
/// Modeled as an explicit state value so the "always emit a final segment" edge case
/// is structurally visible instead of being inferred from byte counters.
enum WriterState {
    /// Rows are being written into the current spool.
    Accumulating {
        encoder: GzEncoder<NamedTempFile>,
        uncompressed_bytes: u64,
    },
    /// The writer has been finished and accepts no further rows.
    Closed,
}

/// Splits a row stream into compressed segments bounded by an uncompressed-size
/// threshold.
///
/// Rows are written through a gzip encoder into a fresh spool; when the uncompressed
/// bytes written strictly exceed the threshold, the current stream is finalized and
/// emitted, and a new spool/encoder pair is opened for subsequent rows. Finishing the
/// writer always emits the trailing segment when it holds data, or when nothing was
/// emitted at all, so a zero-row table still yields exactly one empty-payload segment.
pub struct SegmentWriter {
    max_segment_bytes: u64,
    next_part_number: u32,
    state: WriterState,
}

impl SegmentWriter {
    /// Creates a new writer with the given uncompressed-size threshold and opens the
    /// first spool.
    pub fn new(max_segment_bytes: u64) -> EtlResult<SegmentWriter> {
        Ok(Self {
            max_segment_bytes,
            next_part_number: 1,
            state: WriterState::Accumulating {
                encoder: Self::open_sink()?,
                uncompressed_bytes: 0,
            },
        })
    }

    /// Opens a gzip encoder over a fresh temporary spool.
    fn open_sink() -> EtlResult<GzEncoder<NamedTempFile>> {
        let spool = NamedTempFile::new().map_err(|err| {
            etl_error!(
                ErrorKind::SpoolIoError,
                "Failed to create segment spool",
                err,
                source: err
            )
        })?;

        Ok(GzEncoder::new(spool, Compression::default()))
    }

    /// Writes one row record into the current segment.
    ///
    /// Returns a finished [`ExportSegment`] when this write pushed the segment over
    /// the threshold, otherwise [`None`].
    pub fn write(&mut self, row: &[u8]) -> EtlResult<Option<ExportSegment>> {
        let WriterState::Accumulating {
            encoder,
            uncompressed_bytes,
        } = &mut self.state
        else {
            bail!(
                ErrorKind::InvalidState,
                "Segment writer already finished",
                "write was called after finish"
            );
        };

        encoder.write_all(row).map_err(|err| {
            etl_error!(
                ErrorKind::SpoolIoError,
                "Failed to write row to segment spool",
                err,
                source: err
            )
        })?;
        *uncompressed_bytes += row.len() as u64;

        if *uncompressed_bytes > self.max_segment_bytes {
            return Ok(Some(self.rotate()?));
        }

        Ok(None)
    }

    /// Finalizes the current segment and opens a new spool/encoder pair.
    fn rotate(&mut self) -> EtlResult<ExportSegment> {
        let next_state = WriterState::Accumulating {
            encoder: Self::open_sink()?,
            uncompressed_bytes: 0,
        };
        let previous = std::mem::replace(&mut self.state, next_state);

        let WriterState::Accumulating {
            encoder,
            uncompressed_bytes,
        } = previous
        else {
            bail!(ErrorKind::InvalidState, "Segment writer already finished");
        };

        self.seal(encoder, uncompressed_bytes)
    }

    /// Flushes the gzip trailer, rewinds the spool, and wraps it as a segment.
    fn seal(
        &mut self,
        encoder: GzEncoder<NamedTempFile>,
        uncompressed_bytes: u64,
    ) -> EtlResult<ExportSegment> {
        let mut spool = encoder.finish().map_err(|err| {
            etl_error!(
                ErrorKind::CompressionError,
                "Failed to finalize compression stream",
                err,
                source: err
            )
        })?;

        let compressed_bytes = spool.as_file().metadata().map(|meta| meta.len())?;
        spool.seek(SeekFrom::Start(0)).map_err(|err| {
            etl_error!(
                ErrorKind::SpoolIoError,
                "Failed to rewind segment spool",
                err,
                source: err
            )
        })?;

        let part_number = self.next_part_number;
        self.next_part_number += 1;

        Ok(ExportSegment {
            part_number,
            spool,
            uncompressed_bytes,
            compressed_bytes,
        })
    }

    /// Finishes the writer, emitting the trailing segment.
    ///
    /// The trailing segment is emitted when it holds data or when no segment was
    /// emitted before, so every export yields at least one segment. Returns [`None`]
    /// only for an empty trailing spool that follows earlier segments.
    pub fn finish(mut self) -> EtlResult<Option<ExportSegment>> {
        let previous = std::mem::replace(&mut self.state, WriterState::Closed);

        let WriterState::Accumulating {
            encoder,
            uncompressed_bytes,
        } = previous
        else {
            bail!(ErrorKind::InvalidState, "Segment writer already finished");
        };

        if uncompressed_bytes == 0 && self.next_part_number > 1 {
            return Ok(None);
        }

        Ok(Some(self.seal(encoder, uncompressed_bytes)?))
    }
}

/// Reads the full compressed payload of a segment spool.
///
/// Used by object stores that cannot stream directly from the spool path.
pub fn read_spool(path: &Path) -> EtlResult<Vec<u8>> {
    let bytes = std::fs::read(path).map_err(|err| {
        etl_error!(
            ErrorKind::SpoolIoError,
            "Failed to read segment spool",
            err,
            source: err
        )
    })?;

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::MultiGzDecoder;

    use super::*;

    /// Decompresses the concatenated payloads of the given segments.
    fn decompress_concatenated(segments: &[ExportSegment]) -> Vec<u8> {
        let mut compressed = Vec::new();
        for segment in segments {
            compressed.extend_from_slice(&std::fs::read(segment.spool_path()).unwrap());
        }

        let mut decompressed = Vec::new();
        MultiGzDecoder::new(compressed.as_slice())
            .read_to_end(&mut decompressed)
            .unwrap();

        decompressed
    }

    #[test]
    fn zero_rows_yield_exactly_one_empty_segment() {
        let writer = SegmentWriter::new(1024).unwrap();

        let segment = writer.finish().unwrap().expect("one segment expected");

        assert_eq!(segment.part_number(), 1);
        assert_eq!(segment.uncompressed_bytes(), 0);
        assert!(decompress_concatenated(std::slice::from_ref(&segment)).is_empty());
    }

    #[test]
    fn small_export_fits_in_a_single_segment() {
        let mut writer = SegmentWriter::new(1024).unwrap();

        assert!(writer.write(b"1|alice\n").unwrap().is_none());
        assert!(writer.write(b"2|bob\n").unwrap().is_none());

        let segment = writer.finish().unwrap().expect("one segment expected");

        assert_eq!(segment.part_number(), 1);
        assert_eq!(
            decompress_concatenated(std::slice::from_ref(&segment)),
            b"1|alice\n2|bob\n"
        );
    }

    #[test]
    fn threshold_crossing_rotates_segments_in_order() {
        // 10-byte rows against a 25-byte threshold: rotation happens after every
        // third row (30 > 25).
        let mut writer = SegmentWriter::new(25).unwrap();
        let mut segments = Vec::new();
        let mut expected = Vec::new();

        for i in 0..10u32 {
            let row = format!("{i:08}|\n");
            expected.extend_from_slice(row.as_bytes());
            if let Some(segment) = writer.write(row.as_bytes()).unwrap() {
                segments.push(segment);
            }
        }
        if let Some(segment) = writer.finish().unwrap() {
            segments.push(segment);
        }

        // Rotation is row-granular: three 10-byte rows cross the threshold, so the
        // 100 bytes split as 30 + 30 + 30 + 10.
        assert_eq!(segments.len(), 4);
        for (index, segment) in segments.iter().enumerate() {
            assert_eq!(segment.part_number(), index as u32 + 1);
        }
        assert_eq!(decompress_concatenated(&segments), expected);
    }

    #[test]
    fn trailing_empty_spool_is_skipped_after_rotation() {
        let mut writer = SegmentWriter::new(4).unwrap();

        let rotated = writer.write(b"12345").unwrap();
        assert!(rotated.is_some());

        // Nothing written after the rotation, so there is no trailing segment.
        assert!(writer.finish().unwrap().is_none());
    }

    #[test]
    fn spool_is_removed_when_segment_drops() {
        let mut writer = SegmentWriter::new(4).unwrap();
        let segment = writer.write(b"12345").unwrap().unwrap();
        let path = segment.spool_path().to_path_buf();

        assert!(path.exists());
        drop(segment);
        assert!(!path.exists());
    }
}
