//! Binary sample stream.
//!
//! ```text
//! Preamble: MAGIC (8 bytes) + VERSION (u32 LE)
//!
//! Wire codes:
//!   0: Header        -> code(u8) + mode(u8) + interval_us(u64) + pid(u32) + start_time_ns(u64)
//!   1: StringDef     -> code(u8) + string_id(u32) + len(u32) + bytes(N)
//!   2: FrameDef      -> code(u8) + frame_id(u32) + name_id(u32) + file_id(u32) + line(u32) + kind(u8)
//!   3: ThreadNameDef -> code(u8) + thread_id(u64) + name_id(u32)
//!   4: Sample        -> code(u8) + thread_id(u64) + has_task(u8) [+ task_id(u64)] + metric + num_frames(u32) + frame_ids(N * u32)
//!   5: ErrorMarker   -> code(u8) + thread_id(u64) + reason(u8)
//!
//! Metric:
//!   0: wall  -> tag(u8) + micros(u64)
//!   1: cpu   -> tag(u8) + micros(u64)
//!   2: alloc -> tag(u8) + address(u64) + bytes(u64)
//!   3: free  -> tag(u8) + address(u64) + bytes(u64)
//! ```
//!
//! Strings and frames are interned: a Def record is written the first time a
//! value is seen and later records refer to it by id. Frames are innermost first.

use std::collections::HashMap;
use std::fmt;
use std::io::{Result, Write};

use crate::runtime::ThreadId;
use crate::sample::{ErrorMarker, Frame, Metric, Sample};

pub const MAGIC: &[u8; 8] = b"STRATA\0\0";
pub const VERSION: u32 = 1;

pub(crate) const WIRE_HEADER: u8 = 0;
pub(crate) const WIRE_STRING_DEF: u8 = 1;
pub(crate) const WIRE_FRAME_DEF: u8 = 2;
pub(crate) const WIRE_THREAD_NAME_DEF: u8 = 3;
pub(crate) const WIRE_SAMPLE: u8 = 4;
pub(crate) const WIRE_ERROR_MARKER: u8 = 5;

pub(crate) const METRIC_WALL: u8 = 0;
pub(crate) const METRIC_CPU: u8 = 1;
pub(crate) const METRIC_ALLOC: u8 = 2;
pub(crate) const METRIC_FREE: u8 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Wall,
    Cpu,
    Memory,
}

impl Mode {
    pub(crate) fn code(self) -> u8 {
        match self {
            Mode::Wall => 0,
            Mode::Cpu => 1,
            Mode::Memory => 2,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Mode::Wall),
            1 => Some(Mode::Cpu),
            2 => Some(Mode::Memory),
            _ => None,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Wall => "wall",
            Mode::Cpu => "cpu",
            Mode::Memory => "memory",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub mode: Mode,
    pub interval_us: u64,
    pub pid: u32,
    pub start_time_ns: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
    Header(Header),
    ThreadName { thread_id: ThreadId, name: String },
    Sample(Sample),
    Error(ErrorMarker),
}

pub fn write_preamble(w: &mut impl Write) -> Result<()> {
    w.write_all(MAGIC)?;
    w.write_all(&VERSION.to_le_bytes())
}

/// Writes records, interning strings and frames along the way.
#[derive(Debug, Default)]
pub struct Encoder {
    strings: HashMap<String, u32>,
    frames: HashMap<Frame, u32>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encode(&mut self, w: &mut impl Write, record: &Record) -> Result<()> {
        match record {
            Record::Header(header) => {
                w.write_all(&[WIRE_HEADER, header.mode.code()])?;
                w.write_all(&header.interval_us.to_le_bytes())?;
                w.write_all(&header.pid.to_le_bytes())?;
                w.write_all(&header.start_time_ns.to_le_bytes())?;
            }
            Record::ThreadName { thread_id, name } => {
                let name_id = self.intern_string(w, name)?;
                w.write_all(&[WIRE_THREAD_NAME_DEF])?;
                w.write_all(&thread_id.to_le_bytes())?;
                w.write_all(&name_id.to_le_bytes())?;
            }
            Record::Sample(sample) => self.encode_sample(w, sample)?,
            Record::Error(marker) => {
                w.write_all(&[WIRE_ERROR_MARKER])?;
                w.write_all(&marker.thread_id.to_le_bytes())?;
                w.write_all(&[marker.reason.code()])?;
            }
        }
        Ok(())
    }

    fn encode_sample(&mut self, w: &mut impl Write, sample: &Sample) -> Result<()> {
        let mut frame_ids = Vec::with_capacity(sample.frames.len());
        for frame in &sample.frames {
            frame_ids.push(self.intern_frame(w, frame)?);
        }

        w.write_all(&[WIRE_SAMPLE])?;
        w.write_all(&sample.thread_id.to_le_bytes())?;
        match sample.task_id {
            Some(task_id) => {
                w.write_all(&[1])?;
                w.write_all(&task_id.to_le_bytes())?;
            }
            None => w.write_all(&[0])?,
        }
        match sample.metric {
            Metric::WallTime(micros) => {
                w.write_all(&[METRIC_WALL])?;
                w.write_all(&micros.to_le_bytes())?;
            }
            Metric::CpuTime(micros) => {
                w.write_all(&[METRIC_CPU])?;
                w.write_all(&micros.to_le_bytes())?;
            }
            Metric::Allocation { address, size } => {
                w.write_all(&[METRIC_ALLOC])?;
                w.write_all(&address.to_le_bytes())?;
                w.write_all(&size.to_le_bytes())?;
            }
            Metric::Free { address, size } => {
                w.write_all(&[METRIC_FREE])?;
                w.write_all(&address.to_le_bytes())?;
                w.write_all(&size.to_le_bytes())?;
            }
        }
        w.write_all(&(frame_ids.len() as u32).to_le_bytes())?;
        for id in frame_ids {
            w.write_all(&id.to_le_bytes())?;
        }
        Ok(())
    }

    fn intern_string(&mut self, w: &mut impl Write, s: &str) -> Result<u32> {
        if let Some(&id) = self.strings.get(s) {
            return Ok(id);
        }
        let id = self.strings.len() as u32;
        w.write_all(&[WIRE_STRING_DEF])?;
        w.write_all(&id.to_le_bytes())?;
        w.write_all(&(s.len() as u32).to_le_bytes())?;
        w.write_all(s.as_bytes())?;
        self.strings.insert(s.to_string(), id);
        Ok(id)
    }

    fn intern_frame(&mut self, w: &mut impl Write, frame: &Frame) -> Result<u32> {
        if let Some(&id) = self.frames.get(frame) {
            return Ok(id);
        }
        let name_id = self.intern_string(w, &frame.name)?;
        let file_id = self.intern_string(w, &frame.file)?;
        let id = self.frames.len() as u32;
        w.write_all(&[WIRE_FRAME_DEF])?;
        w.write_all(&id.to_le_bytes())?;
        w.write_all(&name_id.to_le_bytes())?;
        w.write_all(&file_id.to_le_bytes())?;
        w.write_all(&frame.line.to_le_bytes())?;
        w.write_all(&[frame.kind.code()])?;
        self.frames.insert(frame.clone(), id);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preamble_is_magic_then_version() {
        let mut out = Vec::new();
        write_preamble(&mut out).unwrap();
        assert_eq!(&out[..8], b"STRATA\0\0");
        assert_eq!(&out[8..], &VERSION.to_le_bytes());
    }

    #[test]
    fn repeated_frames_are_defined_once() {
        let mut encoder = Encoder::new();
        let sample = Sample {
            thread_id: 1,
            task_id: None,
            metric: Metric::WallTime(1000),
            frames: vec![Frame::interpreted("work", "app.py", 3), Frame::interpreted("main", "app.py", 9)],
        };

        let mut first = Vec::new();
        encoder.encode(&mut first, &Record::Sample(sample.clone())).unwrap();
        let mut second = Vec::new();
        encoder.encode(&mut second, &Record::Sample(sample)).unwrap();

        assert!(first.len() > second.len());
        // code + thread + no task + metric(tag + u64) + count + 2 ids
        assert_eq!(second.len(), 1 + 8 + 1 + 9 + 4 + 8);
        assert_eq!(second[0], WIRE_SAMPLE);
    }

    #[test]
    fn mode_names_match_metadata() {
        assert_eq!(Mode::Wall.to_string(), "wall");
        assert_eq!(Mode::from_code(Mode::Memory.code()), Some(Mode::Memory));
        assert_eq!(Mode::from_code(9), None);
    }
}
