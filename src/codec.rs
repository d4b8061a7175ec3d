//! Fixed-layout binary records shared by live capture, worker pipes and replay.
//!
//! All integers are little-endian, strings are UTF-8 NUL-padded to a fixed
//! width. A log file is a flat concatenation of [`SensorFrame`] records;
//! end of file is the only terminator.
//!
//! Layout (181 bytes per frame):
//! - Header (14 bytes): timestamp f64, scenario u16, experiment counter u16, started u8, measured u8
//! - 4 x SensorReading (31 bytes each): timestamp f64, port [u8; 16], location u8, distance u16, intensity u16, temperature u16
//! - ExperimentLabel (18 bytes): weights [u16; 9]
//! - EstimationResult (25 bytes): algorithm u8, weight u16, error code u16, zone u16, reference [u16; 9]

use std::io::{ErrorKind, Read, Write};

use crate::error::CodecError;
use crate::types::{
    AlgorithmId, ErrorCode, EstimationResult, ExperimentLabel, Scenario, SensorFrame,
    SensorLocation, SensorReading, NO_ALGORITHM, SENSOR_COUNT, ZONE_COUNT,
};

pub const PORT_WIDTH: usize = 16;

// ===== Record Trait =====

/// A record with a fixed encoded size.
pub trait Record: Sized {
    const SIZE: usize;

    fn encode_into(&self, out: &mut Vec<u8>);

    fn decode_from(cursor: &mut ByteCursor<'_>) -> Result<Self, CodecError>;

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        self.encode_into(&mut out);
        debug_assert_eq!(out.len(), Self::SIZE);
        out
    }

    /// Decode exactly one record; any other length is an error.
    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() != Self::SIZE {
            return Err(CodecError::Truncated {
                expected: Self::SIZE,
                actual: bytes.len(),
            });
        }
        Self::decode_from(&mut ByteCursor::new(bytes))
    }
}

/// Either a record or the end of the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<T> {
    Record(T),
    EndOfStream,
}

/// Like [`Record::decode`], but an empty buffer means end of stream.
pub fn decode_record<T: Record>(bytes: &[u8]) -> Result<Decoded<T>, CodecError> {
    if bytes.is_empty() {
        return Ok(Decoded::EndOfStream);
    }
    T::decode(bytes).map(Decoded::Record)
}

/// Read one record. Zero bytes before EOF is end of stream, a partial record is an error.
pub fn read_record<T: Record, R: Read>(reader: &mut R) -> Result<Decoded<T>, CodecError> {
    let mut buf = vec![0u8; T::SIZE];
    let mut filled = 0;
    while filled < T::SIZE {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(CodecError::Io(e)),
        }
    }
    decode_record(&buf[..filled])
}

// ===== Byte Cursor =====

pub struct ByteCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos + n;
        if end > self.bytes.len() {
            return Err(CodecError::Truncated {
                expected: end,
                actual: self.bytes.len(),
            });
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.u8()? != 0)
    }

    pub fn u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn f64(&mut self) -> Result<f64, CodecError> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    pub fn u16_array<const N: usize>(&mut self) -> Result<[u16; N], CodecError> {
        let mut out = [0u16; N];
        for slot in out.iter_mut() {
            *slot = self.u16()?;
        }
        Ok(out)
    }

    /// Fixed-width UTF-8 field with trailing NULs stripped.
    pub fn fixed_str(&mut self, width: usize) -> Result<String, CodecError> {
        let raw = self.take(width)?;
        let len = raw.iter().rposition(|b| *b != 0).map_or(0, |p| p + 1);
        std::str::from_utf8(&raw[..len])
            .map(str::to_string)
            .map_err(|_| CodecError::InvalidUtf8)
    }
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_f64(out: &mut Vec<u8>, v: f64) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Write `s` NUL-padded to `width`, cut at the last char boundary that fits.
fn put_fixed_str(out: &mut Vec<u8>, s: &str, width: usize) {
    let mut end = s.len().min(width);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    out.extend_from_slice(&s.as_bytes()[..end]);
    out.resize(out.len() + (width - end), 0);
}

// ===== Records =====

impl Record for SensorReading {
    const SIZE: usize = 8 + PORT_WIDTH + 1 + 2 + 2 + 2;

    fn encode_into(&self, out: &mut Vec<u8>) {
        put_f64(out, self.timestamp);
        put_fixed_str(out, &self.port, PORT_WIDTH);
        out.push(self.location.code());
        put_u16(out, self.distance);
        put_u16(out, self.intensity);
        put_u16(out, self.temperature);
    }

    fn decode_from(c: &mut ByteCursor<'_>) -> Result<Self, CodecError> {
        Ok(SensorReading {
            timestamp: c.f64()?,
            port: c.fixed_str(PORT_WIDTH)?,
            location: SensorLocation::from_code(c.u8()?)?,
            distance: c.u16()?,
            intensity: c.u16()?,
            temperature: c.u16()?,
        })
    }
}

impl Record for ExperimentLabel {
    const SIZE: usize = 2 * ZONE_COUNT;

    fn encode_into(&self, out: &mut Vec<u8>) {
        for w in self.weights {
            put_u16(out, w);
        }
    }

    fn decode_from(c: &mut ByteCursor<'_>) -> Result<Self, CodecError> {
        Ok(ExperimentLabel {
            weights: c.u16_array()?,
        })
    }
}

impl Record for EstimationResult {
    const SIZE: usize = 1 + 2 + 2 + 2 + 2 * ZONE_COUNT;

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.algorithm.map_or(NO_ALGORITHM, AlgorithmId::code));
        // Signed fields travel as their two's complement bit pattern.
        put_u16(out, self.predicted_weight as u16);
        put_u16(out, self.error_code.0);
        put_u16(out, self.zone as u16);
        for r in self.reference {
            put_u16(out, r);
        }
    }

    fn decode_from(c: &mut ByteCursor<'_>) -> Result<Self, CodecError> {
        Ok(EstimationResult {
            algorithm: AlgorithmId::from_code(c.u8()?)?,
            predicted_weight: c.u16()? as i16,
            error_code: ErrorCode(c.u16()?),
            zone: c.u16()? as i16,
            reference: c.u16_array()?,
        })
    }
}

pub const FRAME_HEADER_SIZE: usize = 8 + 2 + 2 + 1 + 1;

impl Record for SensorFrame {
    const SIZE: usize = FRAME_HEADER_SIZE
        + SENSOR_COUNT * SensorReading::SIZE
        + ExperimentLabel::SIZE
        + EstimationResult::SIZE;

    fn encode_into(&self, out: &mut Vec<u8>) {
        put_f64(out, self.timestamp);
        put_u16(out, self.scenario.tag());
        put_u16(out, self.experiment_counter);
        out.push(u8::from(self.started));
        out.push(u8::from(self.measured));
        for reading in &self.readings {
            reading.encode_into(out);
        }
        self.label.encode_into(out);
        self.result.encode_into(out);
    }

    fn decode_from(c: &mut ByteCursor<'_>) -> Result<Self, CodecError> {
        let timestamp = c.f64()?;
        let scenario = Scenario::from_tag(c.u16()?)?;
        let experiment_counter = c.u16()?;
        let started = c.bool()?;
        let measured = c.bool()?;
        let mut readings = [
            SensorReading::decode_from(c)?,
            SensorReading::decode_from(c)?,
            SensorReading::decode_from(c)?,
            SensorReading::decode_from(c)?,
        ];
        // stored in arrival order by some recorders; scoring expects TL, BL, TR, BR
        let arrived = readings.clone().map(|r| r.location);
        readings.sort_by_key(|r| r.location);
        if readings.iter().map(|r| r.location).ne(SensorLocation::CANONICAL) {
            return Err(CodecError::InvalidReadingSet(arrived));
        }
        Ok(SensorFrame {
            timestamp,
            readings,
            scenario,
            experiment_counter,
            started,
            measured,
            label: ExperimentLabel::decode_from(c)?,
            result: EstimationResult::decode_from(c)?,
            end_of_stream: false,
        })
    }
}

pub const FRAME_SIZE: usize = <SensorFrame as Record>::SIZE;

// ===== Streaming =====

/// Sequential frame reader over any byte source (file, pipe, serial bridge).
pub struct FrameReader<R: Read> {
    inner: R,
    frames_read: u64,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            frames_read: 0,
        }
    }

    /// Next frame, or `None` at a clean end of stream.
    pub fn read_frame(&mut self) -> Result<Option<SensorFrame>, CodecError> {
        match read_record::<SensorFrame, _>(&mut self.inner)? {
            Decoded::Record(frame) => {
                self.frames_read += 1;
                Ok(Some(frame))
            }
            Decoded::EndOfStream => Ok(None),
        }
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }
}

impl<R: Read> Iterator for FrameReader<R> {
    type Item = Result<SensorFrame, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_frame().transpose()
    }
}

/// Append-only frame writer.
pub struct FrameWriter<W: Write> {
    inner: W,
    buf: Vec<u8>,
    frames_written: u64,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(FRAME_SIZE),
            frames_written: 0,
        }
    }

    pub fn write_frame(&mut self, frame: &SensorFrame) -> Result<(), CodecError> {
        self.buf.clear();
        frame.encode_into(&mut self.buf);
        self.inner.write_all(&self.buf)?;
        self.frames_written += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), CodecError> {
        self.inner.flush()?;
        Ok(())
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Decode every frame of a byte source; fails on the first malformed record.
pub fn read_all<R: Read>(reader: R) -> Result<Vec<SensorFrame>, CodecError> {
    FrameReader::new(reader).collect()
}
