//! Block assembly from the sensor terminal's line stream.
//!
//! The terminal frames each reading as:
//!
//! ```text
//! START_DATA
//! TIMESTAMP:123456
//! TEMP:21.5 C
//! HUMIDITY:48 %
//! END_DATA
//! ```
//!
//! The terminal's own `TIMESTAMP` is dropped and replaced by a bridge-side
//! `RPI_TIMESTAMP` taken when `START_DATA` arrives.

use chrono::{DateTime, Local};
use fieldlink_common::{DataBlock, END_MARKER, Entry, START_MARKER};

/// What a single line did to the assembler.
#[derive(Debug, Clone, PartialEq)]
pub enum AssemblerEvent {
    /// Empty line, ignored.
    Blank,
    /// A new block was opened.
    Started,
    /// A new block was opened while another was in progress; the old one
    /// with `discarded` entries was dropped.
    Restarted { discarded: usize },
    /// An entry was appended to the open block.
    Appended,
    /// The terminal's own timestamp was dropped.
    DeviceTimestampDropped,
    /// A line inside a block that is not `KEY:value`.
    Malformed { line: String },
    /// A block was closed.
    Completed(DataBlock),
    /// `END_DATA` with no open block.
    StrayEnd,
    /// A non-marker line outside any block.
    Ignored,
}

#[derive(Debug, Default)]
enum State {
    #[default]
    Idle,
    Collecting {
        entries: Vec<Entry>,
        started_at: DateTime<Local>,
    },
}

/// Line-by-line block state machine. Never blocks and never fails.
#[derive(Debug, Default)]
pub struct BlockAssembler {
    state: State,
}

impl BlockAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a block is currently open.
    pub fn is_collecting(&self) -> bool {
        matches!(self.state, State::Collecting { .. })
    }

    /// Feed one line, stamping new blocks with the current local time.
    pub fn feed(&mut self, line: &str) -> AssemblerEvent {
        self.feed_at(line, Local::now())
    }

    /// Feed one line with an explicit clock reading.
    pub fn feed_at(&mut self, line: &str, now: DateTime<Local>) -> AssemblerEvent {
        let line = line.trim();
        if line.is_empty() {
            return AssemblerEvent::Blank;
        }

        if line == START_MARKER {
            let discarded = self.reset();
            self.state = State::Collecting {
                entries: vec![Entry::bridge_timestamp(now)],
                started_at: now,
            };
            return match discarded {
                Some(discarded) => {
                    tracing::debug!(discarded, "START_DATA inside a block, previous block dropped");
                    AssemblerEvent::Restarted { discarded }
                }
                None => AssemblerEvent::Started,
            };
        }

        if line == END_MARKER {
            return match std::mem::take(&mut self.state) {
                State::Collecting {
                    entries,
                    started_at,
                } => AssemblerEvent::Completed(DataBlock::new(entries, started_at)),
                State::Idle => {
                    tracing::warn!("END_DATA received without START_DATA");
                    AssemblerEvent::StrayEnd
                }
            };
        }

        match &mut self.state {
            State::Idle => {
                tracing::trace!(line = %line, "Line outside block ignored");
                AssemblerEvent::Ignored
            }
            State::Collecting { entries, .. } => match Entry::parse(line) {
                Some(entry) if entry.is_device_timestamp() => {
                    tracing::debug!(line = %line, "Terminal timestamp dropped");
                    AssemblerEvent::DeviceTimestampDropped
                }
                Some(entry) => {
                    entries.push(entry);
                    AssemblerEvent::Appended
                }
                None => {
                    tracing::warn!(line = %line, "Malformed line inside block dropped");
                    AssemblerEvent::Malformed {
                        line: line.to_string(),
                    }
                }
            },
        }
    }

    /// Drop any open block. Returns the number of entries discarded, if a
    /// block was open.
    pub fn reset(&mut self) -> Option<usize> {
        match std::mem::take(&mut self.state) {
            State::Collecting { entries, .. } => Some(entries.len()),
            State::Idle => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use fieldlink_common::BRIDGE_TIMESTAMP_KEY;

    fn at(secs: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 3, 14, 9, 0, secs).unwrap()
    }

    fn feed_all(assembler: &mut BlockAssembler, lines: &[&str]) -> Vec<DataBlock> {
        lines
            .iter()
            .filter_map(|l| match assembler.feed_at(l, at(0)) {
                AssemblerEvent::Completed(block) => Some(block),
                _ => None,
            })
            .collect()
    }

    fn keys(block: &DataBlock) -> Vec<&str> {
        block.entries().iter().map(|e| e.key.as_str()).collect()
    }

    #[test]
    fn test_simple_block() {
        let mut assembler = BlockAssembler::new();
        let blocks = feed_all(
            &mut assembler,
            &["START_DATA", "TEMP:21.5 C", "HUMIDITY:48 %", "END_DATA"],
        );

        assert_eq!(blocks.len(), 1);
        assert_eq!(keys(&blocks[0]), vec![BRIDGE_TIMESTAMP_KEY, "TEMP", "HUMIDITY"]);
        assert_eq!(blocks[0].started_at(), at(0));
        assert!(!assembler.is_collecting());
    }

    #[test]
    fn test_device_timestamp_replaced() {
        let mut assembler = BlockAssembler::new();
        assembler.feed_at("START_DATA", at(5));
        assert_eq!(
            assembler.feed_at("TIMESTAMP:987654", at(5)),
            AssemblerEvent::DeviceTimestampDropped
        );
        assembler.feed_at("CO:0.4 ppm", at(5));
        let AssemblerEvent::Completed(block) = assembler.feed_at("END_DATA", at(6)) else {
            panic!("expected a block");
        };

        assert_eq!(keys(&block), vec![BRIDGE_TIMESTAMP_KEY, "CO"]);
        assert!(block.get("TIMESTAMP").is_none());
        assert_eq!(block.entries()[0], Entry::bridge_timestamp(at(5)));
    }

    #[test]
    fn test_restart_discards_partial() {
        let mut assembler = BlockAssembler::new();
        assembler.feed_at("START_DATA", at(0));
        assembler.feed_at("TEMP:1", at(0));
        assert_eq!(
            assembler.feed_at("START_DATA", at(1)),
            AssemblerEvent::Restarted { discarded: 2 }
        );
        assembler.feed_at("TEMP:2", at(1));
        let AssemblerEvent::Completed(block) = assembler.feed_at("END_DATA", at(1)) else {
            panic!("expected a block");
        };
        assert_eq!(block.get("TEMP").unwrap().value, "2");
        assert_eq!(block.len(), 2);
    }

    #[test]
    fn test_stray_end_and_idle_lines() {
        let mut assembler = BlockAssembler::new();
        assert_eq!(assembler.feed("END_DATA"), AssemblerEvent::StrayEnd);
        assert_eq!(assembler.feed("TEMP:20"), AssemblerEvent::Ignored);
        assert_eq!(assembler.feed("   "), AssemblerEvent::Blank);
        assert!(!assembler.is_collecting());

        let blocks = feed_all(&mut assembler, &["START_DATA", "UV:3", "END_DATA"]);
        assert_eq!(blocks.len(), 1);
    }

    #[test]
    fn test_malformed_and_blank_inside_block() {
        let mut assembler = BlockAssembler::new();
        assembler.feed("START_DATA");
        assert_eq!(
            assembler.feed("garbage line"),
            AssemblerEvent::Malformed {
                line: "garbage line".to_string()
            }
        );
        assert_eq!(assembler.feed(""), AssemblerEvent::Blank);
        assert_eq!(assembler.feed("NO2: 12 ppb "), AssemblerEvent::Appended);
        let AssemblerEvent::Completed(block) = assembler.feed("END_DATA\r") else {
            panic!("expected a block");
        };
        assert_eq!(keys(&block), vec![BRIDGE_TIMESTAMP_KEY, "NO2"]);
        assert_eq!(block.get("NO2").unwrap().value, "12 ppb");
    }

    #[test]
    fn test_reset() {
        let mut assembler = BlockAssembler::new();
        assert_eq!(assembler.reset(), None);
        assembler.feed("START_DATA");
        assembler.feed("TEMP:20");
        assert_eq!(assembler.reset(), Some(2));
        assert_eq!(assembler.feed("END_DATA"), AssemblerEvent::StrayEnd);
    }

    #[test]
    fn test_empty_block() {
        let mut assembler = BlockAssembler::new();
        let blocks = feed_all(&mut assembler, &["START_DATA", "END_DATA"]);
        assert_eq!(blocks.len(), 1);
        assert_eq!(keys(&blocks[0]), vec![BRIDGE_TIMESTAMP_KEY]);
    }

    /// Block sizes a line sequence should produce: the data lines between
    /// each `START_DATA` and the next `END_DATA`.
    fn expected_blocks(lines: &[&str]) -> (Vec<usize>, bool) {
        let mut open = None;
        let mut blocks = Vec::new();
        for line in lines {
            match *line {
                START_MARKER => open = Some(0),
                END_MARKER => blocks.extend(open.take()),
                _ => {
                    if let Some(n) = open.as_mut() {
                        *n += 1;
                    }
                }
            }
        }
        (blocks, open.is_some())
    }

    #[test]
    fn test_every_marker_ordering() {
        let alphabet = [START_MARKER, "TEMP:1", END_MARKER];

        let mut sequences: Vec<Vec<&str>> = vec![Vec::new()];
        let mut checked = 0;
        for _ in 0..=6 {
            for lines in &sequences {
                let mut assembler = BlockAssembler::new();
                let blocks = feed_all(&mut assembler, lines);
                let (expected, open) = expected_blocks(lines);

                let sizes: Vec<usize> = blocks.iter().map(|b| b.len() - 1).collect();
                assert_eq!(sizes, expected, "lines: {lines:?}");
                assert_eq!(assembler.is_collecting(), open, "lines: {lines:?}");
                checked += 1;
            }
            sequences = sequences
                .iter()
                .flat_map(|prefix| {
                    alphabet.iter().map(move |line| {
                        let mut next = prefix.clone();
                        next.push(*line);
                        next
                    })
                })
                .collect();
        }
        // 3^0 + 3^1 + ... + 3^6
        assert_eq!(checked, 1093);
    }
}
