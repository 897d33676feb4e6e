//! Binary descriptor stream: packed little-endian records of an `i64`
//! pointer followed by `D` `f32` coordinates.
//!
//! Tree construction only reads the coordinates. The cluster tool uses a
//! negative pointer to mark the first descriptor of a new cluster.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DescriptorFileError {
    #[error("failed to open descriptor file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read descriptor record {record}: {source}")]
    Read {
        record: usize,
        #[source]
        source: io::Error,
    },
    #[error("descriptor record {record} is truncated ({bytes} of {expected} bytes)")]
    Truncated {
        record: usize,
        bytes: usize,
        expected: usize,
    },
    #[error("failed to write descriptor records: {0}")]
    Write(#[source] io::Error),
    #[error("descriptor has {found} coordinates, expected {expected}")]
    Dimension { found: usize, expected: usize },
}

#[derive(Clone, Debug, PartialEq)]
pub struct DescriptorRecord {
    pub ptr: i64,
    pub descriptor: Vec<f32>,
}

impl DescriptorRecord {
    pub fn new(ptr: i64, descriptor: Vec<f32>) -> Self {
        Self { ptr, descriptor }
    }

    /// A negative pointer opens a new cluster in the cluster tool.
    pub fn starts_cluster(&self) -> bool {
        self.ptr < 0
    }
}

/// Size in bytes of one packed record.
pub fn record_size(descriptor_size: usize) -> usize {
    8 + 4 * descriptor_size
}

/// Streams records one at a time.
pub struct DescriptorReader<R: Read> {
    reader: R,
    descriptor_size: usize,
    record: usize,
    buf: Vec<u8>,
    done: bool,
}

impl DescriptorReader<BufReader<File>> {
    pub fn open(path: &Path, descriptor_size: usize) -> Result<Self, DescriptorFileError> {
        let file = File::open(path).map_err(|source| DescriptorFileError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::new(BufReader::new(file), descriptor_size))
    }
}

impl<R: Read> DescriptorReader<R> {
    pub fn new(reader: R, descriptor_size: usize) -> Self {
        Self {
            reader,
            descriptor_size,
            record: 0,
            buf: vec![0; record_size(descriptor_size)],
            done: false,
        }
    }

    pub fn descriptor_size(&self) -> usize {
        self.descriptor_size
    }

    fn fill(&mut self) -> Result<usize, io::Error> {
        let mut filled = 0;
        while filled < self.buf.len() {
            match self.reader.read(&mut self.buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    fn decode(&self) -> DescriptorRecord {
        let mut ptr = [0u8; 8];
        ptr.copy_from_slice(&self.buf[..8]);
        let descriptor = self.buf[8..]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        DescriptorRecord {
            ptr: i64::from_le_bytes(ptr),
            descriptor,
        }
    }
}

impl<R: Read> Iterator for DescriptorReader<R> {
    type Item = Result<DescriptorRecord, DescriptorFileError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let record = self.record;
        match self.fill() {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(n) if n < self.buf.len() => {
                self.done = true;
                Some(Err(DescriptorFileError::Truncated {
                    record,
                    bytes: n,
                    expected: self.buf.len(),
                }))
            }
            Ok(_) => {
                self.record += 1;
                Some(Ok(self.decode()))
            }
            Err(source) => {
                self.done = true;
                Some(Err(DescriptorFileError::Read { record, source }))
            }
        }
    }
}

/// Reads a whole descriptor file, stopping after `limit` records if given.
pub fn read_descriptor_file(
    path: &Path,
    descriptor_size: usize,
    limit: Option<usize>,
) -> Result<Vec<DescriptorRecord>, DescriptorFileError> {
    let reader = DescriptorReader::open(path, descriptor_size)?;
    let limit = limit.unwrap_or(usize::MAX);
    reader.take(limit).collect()
}

pub fn write_descriptor_records<W: Write>(
    writer: W,
    descriptor_size: usize,
    records: &[DescriptorRecord],
) -> Result<(), DescriptorFileError> {
    let mut writer = BufWriter::new(writer);
    for record in records {
        if record.descriptor.len() != descriptor_size {
            return Err(DescriptorFileError::Dimension {
                found: record.descriptor.len(),
                expected: descriptor_size,
            });
        }
        writer
            .write_all(&record.ptr.to_le_bytes())
            .map_err(DescriptorFileError::Write)?;
        for value in &record.descriptor {
            writer
                .write_all(&value.to_le_bytes())
                .map_err(DescriptorFileError::Write)?;
        }
    }
    writer.flush().map_err(DescriptorFileError::Write)
}

pub fn save_descriptor_file(
    path: &Path,
    descriptor_size: usize,
    records: &[DescriptorRecord],
) -> Result<(), DescriptorFileError> {
    let file = File::create(path).map_err(|source| DescriptorFileError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    write_descriptor_records(file, descriptor_size, records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn rec(ptr: i64, d: &[f32]) -> DescriptorRecord {
        DescriptorRecord::new(ptr, d.to_vec())
    }

    #[test]
    fn test_record_size_is_packed() {
        assert_eq!(record_size(2), 16);
        assert_eq!(record_size(256), 1032);
    }

    #[test]
    fn test_written_layout_is_little_endian() {
        let mut buf = Vec::new();
        write_descriptor_records(&mut buf, 1, &[rec(-1, &[1.0])]).unwrap();
        assert_eq!(&buf[..8], &(-1i64).to_le_bytes());
        assert_eq!(&buf[8..], &1.0f32.to_le_bytes());
    }

    #[test]
    fn test_reader_streams_records_in_order() {
        let mut buf = Vec::new();
        let records = vec![rec(-1, &[0.0, 1.0]), rec(7, &[2.5, -3.0])];
        write_descriptor_records(&mut buf, 2, &records).unwrap();

        let read: Vec<_> = DescriptorReader::new(Cursor::new(buf), 2)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(read, records);
        assert!(read[0].starts_cluster());
        assert!(!read[1].starts_cluster());
    }

    #[test]
    fn test_trailing_partial_record_is_an_error() {
        let mut buf = Vec::new();
        write_descriptor_records(&mut buf, 2, &[rec(1, &[0.0, 0.0])]).unwrap();
        buf.extend_from_slice(&[1, 2, 3]);

        let mut reader = DescriptorReader::new(Cursor::new(buf), 2);
        assert!(reader.next().unwrap().is_ok());
        match reader.next() {
            Some(Err(DescriptorFileError::Truncated { record, bytes, .. })) => {
                assert_eq!(record, 1);
                assert_eq!(bytes, 3);
            }
            other => panic!("expected truncation error, got {other:?}"),
        }
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_dimension_mismatch_is_rejected_on_write() {
        let mut buf = Vec::new();
        let err = write_descriptor_records(&mut buf, 3, &[rec(0, &[1.0])]).unwrap_err();
        assert!(matches!(
            err,
            DescriptorFileError::Dimension {
                found: 1,
                expected: 3
            }
        ));
    }

    #[test]
    fn test_file_round_trip_with_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("descriptors.dat");
        let records: Vec<_> = (0..5).map(|i| rec(i, &[i as f32, 0.5])).collect();
        save_descriptor_file(&path, 2, &records).unwrap();

        let all = read_descriptor_file(&path, 2, None).unwrap();
        assert_eq!(all.len(), 5);
        let some = read_descriptor_file(&path, 2, Some(3)).unwrap();
        assert_eq!(some, records[..3].to_vec());
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = read_descriptor_file(Path::new("/nonexistent/d.dat"), 2, None).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/d.dat"));
    }
}
