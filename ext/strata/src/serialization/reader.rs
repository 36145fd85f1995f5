use std::collections::HashMap;
use std::io::{self, ErrorKind, Read};

use super::format::*;
use crate::sample::{ErrorMarker, FailureReason, Frame, FrameKind, Metric, Sample};

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, message.into())
}

/// Decodes a sample stream back into [`Record`]s, resolving interned
/// strings and frames as it goes.
pub struct StreamReader<R> {
    input: R,
    strings: HashMap<u32, String>,
    frames: HashMap<u32, Frame>,
}

impl<R: Read> StreamReader<R> {
    pub fn new(mut input: R) -> io::Result<Self> {
        let mut magic = [0u8; 8];
        input.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(invalid("not a sample stream"));
        }
        let version = read_u32(&mut input)?;
        if version != VERSION {
            return Err(invalid(format!("unsupported stream version {}", version)));
        }
        Ok(Self {
            input,
            strings: HashMap::new(),
            frames: HashMap::new(),
        })
    }

    /// Returns `Ok(None)` at a clean end of stream.
    pub fn next_record(&mut self) -> io::Result<Option<Record>> {
        loop {
            let mut code = [0u8; 1];
            match self.input.read(&mut code) {
                Ok(0) => return Ok(None),
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
            match code[0] {
                WIRE_HEADER => return self.read_header().map(Some),
                WIRE_STRING_DEF => self.read_string_def()?,
                WIRE_FRAME_DEF => self.read_frame_def()?,
                WIRE_THREAD_NAME_DEF => {
                    let thread_id = read_u64(&mut self.input)?;
                    let name_id = read_u32(&mut self.input)?;
                    let name = self.string(name_id)?;
                    return Ok(Some(Record::ThreadName { thread_id, name }));
                }
                WIRE_SAMPLE => return self.read_sample().map(Some),
                WIRE_ERROR_MARKER => {
                    let thread_id = read_u64(&mut self.input)?;
                    let reason = FailureReason::from_code(read_u8(&mut self.input)?);
                    return Ok(Some(Record::Error(ErrorMarker { thread_id, reason })));
                }
                other => return Err(invalid(format!("unknown wire code {}", other))),
            }
        }
    }

    pub fn read_all(mut self) -> io::Result<Vec<Record>> {
        let mut records = Vec::new();
        while let Some(record) = self.next_record()? {
            records.push(record);
        }
        Ok(records)
    }

    fn string(&self, id: u32) -> io::Result<String> {
        self.strings
            .get(&id)
            .cloned()
            .ok_or_else(|| invalid(format!("undefined string {}", id)))
    }

    fn read_header(&mut self) -> io::Result<Record> {
        let mode = Mode::from_code(read_u8(&mut self.input)?).ok_or_else(|| invalid("unknown mode"))?;
        Ok(Record::Header(Header {
            mode,
            interval_us: read_u64(&mut self.input)?,
            pid: read_u32(&mut self.input)?,
            start_time_ns: read_u64(&mut self.input)?,
        }))
    }

    fn read_string_def(&mut self) -> io::Result<()> {
        let id = read_u32(&mut self.input)?;
        let len = read_u32(&mut self.input)? as usize;
        let mut bytes = vec![0u8; len];
        self.input.read_exact(&mut bytes)?;
        let value = String::from_utf8(bytes).map_err(|_| invalid("string is not utf-8"))?;
        self.strings.insert(id, value);
        Ok(())
    }

    fn read_frame_def(&mut self) -> io::Result<()> {
        let id = read_u32(&mut self.input)?;
        let name_id = read_u32(&mut self.input)?;
        let file_id = read_u32(&mut self.input)?;
        let name = self.string(name_id)?;
        let file = self.string(file_id)?;
        let line = read_u32(&mut self.input)?;
        let kind = FrameKind::from_code(read_u8(&mut self.input)?).ok_or_else(|| invalid("unknown frame kind"))?;
        self.frames.insert(id, Frame { name, file, line, kind });
        Ok(())
    }

    fn read_sample(&mut self) -> io::Result<Record> {
        let thread_id = read_u64(&mut self.input)?;
        let task_id = match read_u8(&mut self.input)? {
            0 => None,
            _ => Some(read_u64(&mut self.input)?),
        };
        let metric = match read_u8(&mut self.input)? {
            METRIC_WALL => Metric::WallTime(read_u64(&mut self.input)?),
            METRIC_CPU => Metric::CpuTime(read_u64(&mut self.input)?),
            METRIC_ALLOC => Metric::Allocation {
                address: read_u64(&mut self.input)?,
                size: read_u64(&mut self.input)?,
            },
            METRIC_FREE => Metric::Free {
                address: read_u64(&mut self.input)?,
                size: read_u64(&mut self.input)?,
            },
            other => return Err(invalid(format!("unknown metric tag {}", other))),
        };
        let count = read_u32(&mut self.input)?;
        let mut frames = Vec::with_capacity(count.min(4096) as usize);
        for _ in 0..count {
            let id = read_u32(&mut self.input)?;
            let frame = self
                .frames
                .get(&id)
                .cloned()
                .ok_or_else(|| invalid(format!("undefined frame {}", id)))?;
            frames.push(frame);
        }
        Ok(Record::Sample(Sample {
            thread_id,
            task_id,
            metric,
            frames,
        }))
    }
}

impl<R: Read> Iterator for StreamReader<R> {
    type Item = io::Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

fn read_u8(r: &mut impl Read) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32(r: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}
