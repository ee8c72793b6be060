//! Parser for labcams `.camlog` files.
//!
//! ```text
//! # Log header:frame_id,timestamp
//! #LED:1,1,1000.0
//! #SYNC:0,1200.5
//! 1,1000.0
//! ```
//!
//! Lines starting with `#` are comments, except for the `# Log header:`
//! column list and the `#LED:`/`#SYNC:` records written by the teensy board.
//! Every timestamp is in milliseconds.

use std::fs;

use camino::Utf8Path;

use crate::error::ExtractError;

const HEADER: &str = "# Log header:";
const LED: &str = "#LED:";
const SYNC: &str = "#SYNC:";

/// A camera frame as reported by the acquisition software.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameRecord {
    pub frame_id: i64,
    pub timestamp: f64,
}

/// Illumination event: which LED was on for a frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LedEvent {
    pub led: i64,
    pub frame: i64,
    pub timestamp: f64,
}

/// Sync pulse received by the camera board.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncEvent {
    pub frame: i64,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CamLog {
    pub columns: Vec<String>,
    pub frames: Vec<FrameRecord>,
    pub leds: Vec<LedEvent>,
    pub syncs: Vec<SyncEvent>,
    /// Free-form comment lines, without the leading `#`.
    pub comments: Vec<String>,
}

impl CamLog {
    pub fn read(path: impl AsRef<Utf8Path>) -> Result<Self, ExtractError> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ExtractError> {
        let mut log = CamLog {
            columns: vec!["frame_id".into(), "timestamp".into()],
            ..Default::default()
        };

        for (i, line) in text.lines().enumerate() {
            let line = line.trim();
            let number = i + 1;
            if line.is_empty() {
                continue;
            }

            if let Some(rest) = line.strip_prefix(HEADER) {
                log.columns = rest.split(',').map(|c| c.trim().to_string()).collect();
            } else if let Some(rest) = line.strip_prefix(LED) {
                let fields = numbers(rest, number)?;
                let [led, frame, timestamp] = fields[..] else {
                    return Err(bad_line(number, "expected led,frame,timestamp"));
                };
                log.leds.push(LedEvent {
                    led: led as i64,
                    frame: frame as i64,
                    timestamp,
                });
            } else if let Some(rest) = line.strip_prefix(SYNC) {
                // some firmware versions prepend a pulse counter
                let fields = numbers(rest, number)?;
                let [.., frame, timestamp] = fields[..] else {
                    return Err(bad_line(number, "expected frame,timestamp"));
                };
                log.syncs.push(SyncEvent {
                    frame: frame as i64,
                    timestamp,
                });
            } else if let Some(comment) = line.strip_prefix('#') {
                log.comments.push(comment.trim().to_string());
            } else {
                let frame = log.frame_record(line, number)?;
                log.frames.push(frame);
            }
        }

        Ok(log)
    }

    fn column(&self, name: &str, fallback: usize) -> usize {
        self.columns
            .iter()
            .position(|c| c == name)
            .unwrap_or(fallback)
    }

    fn frame_record(&self, line: &str, number: usize) -> Result<FrameRecord, ExtractError> {
        let fields = numbers(line, number)?;
        let id = self.column("frame_id", 0);
        let ts = self.column("timestamp", 1);

        match (fields.get(id), fields.get(ts)) {
            (Some(&frame_id), Some(&timestamp)) => Ok(FrameRecord {
                frame_id: frame_id as i64,
                timestamp,
            }),
            _ => Err(bad_line(
                number,
                &format!("expected {} columns", self.columns.len()),
            )),
        }
    }

    /// Sync pulse times in seconds.
    pub fn sync_seconds(&self) -> Vec<f64> {
        self.syncs.iter().map(|s| s.timestamp / 1e3).collect()
    }
}

fn numbers(text: &str, line: usize) -> Result<Vec<f64>, ExtractError> {
    text.split(',')
        .map(|field| {
            let field = field.trim();
            field
                .parse::<f64>()
                .map_err(|_| bad_line(line, &format!("'{field}' is not a number")))
        })
        .collect()
}

fn bad_line(line: usize, reason: &str) -> ExtractError {
    ExtractError::CamLog {
        line,
        reason: reason.to_string(),
    }
}
