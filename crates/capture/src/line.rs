//! Line reassembly stage
//!
//! Drains the ingestion buffer in bounded slices, splits it on line feeds,
//! stamps each completed line and forwards it to the console sink and the
//! write batch. Three things keep memory bounded:
//!
//! - a line longer than the ceiling is cut at the last character boundary
//!   within it and marked,
//! - each cycle handles at most `lines_per_cycle` records,
//! - after a cycle, an ingestion buffer above the high-water mark is cleared
//!   and a marker line records how much was discarded.

use crate::batch::BatchWriter;
use crate::clock::{SharedClock, Stamp};
use crate::ingest::IngestReader;
use bytes::BytesMut;
use std::fmt;
use tracing::{trace, warn};

/// Byte that ends a record
pub const LINE_TERMINATOR: u8 = b'\n';

/// Suffix appended to lines cut at the length ceiling
pub const TRUNCATION_MARKER: &str = " [TRUNCATED]";

/// A completed line and its capture timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub stamp: Stamp,
    pub text: String,
}

impl LogLine {
    pub fn new(stamp: Stamp, text: impl Into<String>) -> Self {
        Self {
            stamp,
            text: text.into(),
        }
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.stamp, self.text)
    }
}

/// Human-readable mirror of captured lines
pub trait ConsoleSink: Send {
    fn emit(&mut self, line: &str);
}

/// Reassembly limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyConfig {
    /// Longest line forwarded intact, in bytes
    pub line_ceiling: usize,
    /// Records handled per scheduling slice
    pub lines_per_cycle: usize,
    /// Occupancy above which the ingestion buffer is cleared
    pub high_water: usize,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            line_ceiling: 1014,
            lines_per_cycle: 10,
            high_water: 12 * 1024,
        }
    }
}

/// Counters kept across cycles
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblyStats {
    pub lines_forwarded: u64,
    pub truncated_lines: u64,
    pub overflow_clears: u64,
    pub bytes_discarded: u64,
}

/// What one cycle did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Records taken from the buffer, empty lines included
    pub records: usize,
    /// Lines sent downstream, marker lines included
    pub forwarded: usize,
    /// Bytes cleared by the high-water guard
    pub discarded: usize,
    /// The ingestion producer is gone and nothing is queued
    pub producer_closed: bool,
}

enum Record {
    Line(BytesMut),
    Truncated(BytesMut),
}

/// Consumer side of the ingestion buffer, turning bytes into lines
pub struct LineAssembler {
    reader: IngestReader,
    config: ReassemblyConfig,
    /// Leading bytes already known to hold no terminator
    scanned: usize,
    /// Ingestion drops not yet reported in the log
    drop_pending: u64,
    /// Buffered bytes to consume before the drop marker is due
    drop_boundary: usize,
    stats: ReassemblyStats,
}

/// Length of `bytes` without a multibyte character cut off at its end
fn char_boundary(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(4) {
        let b = bytes[len - back];
        if b & 0xC0 == 0x80 {
            continue;
        }
        let width = match b {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if width > back { len - back } else { len };
    }
    len
}

impl LineAssembler {
    pub fn new(reader: IngestReader, config: ReassemblyConfig) -> Self {
        Self {
            reader,
            config,
            scanned: 0,
            drop_pending: 0,
            drop_boundary: 0,
            stats: ReassemblyStats::default(),
        }
    }

    pub fn config(&self) -> &ReassemblyConfig {
        &self.config
    }

    pub fn stats(&self) -> ReassemblyStats {
        self.stats
    }

    /// Bytes waiting in the ingestion buffer
    pub fn pending(&self) -> usize {
        self.reader.len()
    }

    /// Take the next complete or over-long record off the buffer
    fn next_record(&mut self) -> Option<Record> {
        let ceiling = self.config.line_ceiling;
        let buf = self.reader.buffered();
        let limit = buf.len().min(ceiling + 1);
        let start = self.scanned.min(limit);

        if let Some(pos) = buf[start..limit]
            .iter()
            .position(|&b| b == LINE_TERMINATOR)
        {
            let end = start + pos;
            let mut line = self.reader.consume(end + 1);
            line.truncate(end);
            if line.last() == Some(&b'\r') {
                line.truncate(end - 1);
            }
            self.scanned = 0;
            return Some(Record::Line(line));
        }

        // A trailing CR does not count toward the ceiling
        if buf.len() > ceiling && buf[ceiling] == b'\r' {
            match buf.get(ceiling + 1).copied() {
                Some(LINE_TERMINATOR) => {
                    let mut line = self.reader.consume(ceiling + 2);
                    line.truncate(ceiling);
                    self.scanned = 0;
                    return Some(Record::Line(line));
                }
                Some(_) => {}
                None => {
                    self.scanned = limit;
                    return None;
                }
            }
        }

        if buf.len() > ceiling {
            let cut = match char_boundary(&buf[..ceiling]) {
                0 => ceiling,
                cut => cut,
            };
            self.scanned = 0;
            return Some(Record::Truncated(self.reader.consume(cut)));
        }

        self.scanned = limit;
        None
    }

    /// Forward the ingestion drop marker once every byte that arrived before
    /// the drop has been consumed, or when no complete record is left
    fn forward_drop_marker(
        &mut self,
        clock: &SharedClock,
        console: &mut dyn ConsoleSink,
        batch: &mut BatchWriter,
        force: bool,
    ) -> usize {
        if self.drop_pending == 0 || (self.drop_boundary > 0 && !force) {
            return 0;
        }
        let dropped = std::mem::take(&mut self.drop_pending);
        self.drop_boundary = 0;
        let marker = LogLine::new(
            clock.stamp(),
            format!("[INGEST DROPPED {} bytes]", dropped),
        );
        self.forward(marker, console, batch);
        1
    }

    fn forward(
        &mut self,
        line: LogLine,
        console: &mut dyn ConsoleSink,
        batch: &mut BatchWriter,
    ) {
        let rendered = line.to_string();
        console.emit(&rendered);
        batch.push(rendered);
        self.stats.lines_forwarded += 1;
    }

    /// Run one bounded scheduling slice
    pub fn run_cycle(
        &mut self,
        clock: &SharedClock,
        console: &mut dyn ConsoleSink,
        batch: &mut BatchWriter,
    ) -> CycleReport {
        // Everything accepted before these drops is queued by now
        let dropped = self.reader.take_dropped();
        let mut report = CycleReport {
            producer_closed: !self.reader.fill(),
            ..CycleReport::default()
        };

        if dropped > 0 {
            warn!("Ingestion buffer full, {} bytes dropped", dropped);
            self.drop_pending += dropped;
            self.drop_boundary = self.reader.buffered().len();
        }

        let mut exhausted = false;
        loop {
            report.forwarded += self.forward_drop_marker(clock, console, batch, false);
            if report.records >= self.config.lines_per_cycle {
                break;
            }

            let before = self.reader.buffered().len();
            let Some(record) = self.next_record() else {
                exhausted = true;
                break;
            };
            let consumed = before - self.reader.buffered().len();
            self.drop_boundary = self.drop_boundary.saturating_sub(consumed);
            report.records += 1;

            let text = match record {
                Record::Line(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Record::Truncated(bytes) => {
                    self.stats.truncated_lines += 1;
                    let mut text = String::from_utf8_lossy(&bytes).into_owned();
                    text.push_str(TRUNCATION_MARKER);
                    text
                }
            };

            if text.is_empty() {
                continue;
            }

            trace!("Line: {} bytes", text.len());
            self.forward(LogLine::new(clock.stamp(), text), console, batch);
            report.forwarded += 1;
        }

        let clearing = self.reader.len() > self.config.high_water;
        if exhausted || clearing {
            report.forwarded += self.forward_drop_marker(clock, console, batch, true);
        }

        if clearing {
            let discarded = self.reader.clear();
            self.scanned = 0;
            self.stats.overflow_clears += 1;
            self.stats.bytes_discarded += discarded as u64;
            warn!(
                "Ingestion buffer above high-water mark, {} bytes discarded",
                discarded
            );

            let marker = LogLine::new(
                clock.stamp(),
                format!("[BUFFER OVERFLOW] {} bytes discarded", discarded),
            );
            self.forward(marker, console, batch);
            report.forwarded += 1;
            report.discarded = discarded;
        }

        report
    }

    /// Forward every complete line still buffered, ignoring the per-cycle cap
    ///
    /// A trailing partial line stays in the buffer.
    pub fn drain(
        &mut self,
        clock: &SharedClock,
        console: &mut dyn ConsoleSink,
        batch: &mut BatchWriter,
    ) -> usize {
        let mut forwarded = 0;
        loop {
            let report = self.run_cycle(clock, console, batch);
            forwarded += report.forwarded;
            if report.records < self.config.lines_per_cycle {
                return forwarded;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchFlusher, write_batch};
    use crate::clock::{ClockAdapter, DEFAULT_RESYNC, NoClock};
    use crate::ingest::{IngestWriter, ingestion_buffer};
    use proptest::prelude::*;

    #[derive(Default)]
    struct VecConsole(Vec<String>);

    impl ConsoleSink for VecConsole {
        fn emit(&mut self, line: &str) {
            self.0.push(line.to_string());
        }
    }

    struct Harness {
        writer: IngestWriter,
        assembler: LineAssembler,
        clock: SharedClock,
        console: VecConsole,
        batch: BatchWriter,
        flusher: BatchFlusher,
    }

    impl Harness {
        fn new(config: ReassemblyConfig, capacity: usize) -> Self {
            let (writer, reader, _gauge) = ingestion_buffer(capacity);
            let (batch, flusher) = write_batch(1 << 20);
            Self {
                writer,
                assembler: LineAssembler::new(reader, config),
                clock: SharedClock::new(ClockAdapter::new(Box::new(NoClock), DEFAULT_RESYNC)),
                console: VecConsole::default(),
                batch,
                flusher,
            }
        }

        fn cycle(&mut self) -> CycleReport {
            self.assembler
                .run_cycle(&self.clock, &mut self.console, &mut self.batch)
        }

        fn drain(&mut self) {
            self.assembler
                .drain(&self.clock, &mut self.console, &mut self.batch);
        }

        /// Forwarded texts without the stamp prefix
        fn texts(&self) -> Vec<String> {
            self.console
                .0
                .iter()
                .map(|l| l.strip_prefix("[NO_RTC] ").unwrap_or(l).to_string())
                .collect()
        }
    }

    fn config(line_ceiling: usize, lines_per_cycle: usize, high_water: usize) -> ReassemblyConfig {
        ReassemblyConfig {
            line_ceiling,
            lines_per_cycle,
            high_water,
        }
    }

    #[test]
    fn test_splits_lines_and_strips_cr() {
        let mut h = Harness::new(ReassemblyConfig::default(), 4096);
        h.writer.append(b"first\r\nsecond\nthi");
        h.cycle();
        assert_eq!(h.texts(), vec!["first", "second"]);

        h.writer.append(b"rd\r\n");
        h.cycle();
        assert_eq!(h.texts(), vec!["first", "second", "third"]);
        assert_eq!(h.assembler.pending(), 0);
    }

    #[test]
    fn test_empty_lines_are_consumed_but_not_forwarded() {
        let mut h = Harness::new(ReassemblyConfig::default(), 4096);
        h.writer.append(b"\n\r\nvalue\n");
        let report = h.cycle();
        assert_eq!(report.records, 3);
        assert_eq!(report.forwarded, 1);
        assert_eq!(h.texts(), vec!["value"]);
    }

    #[test]
    fn test_only_trailing_cr_is_stripped() {
        let mut h = Harness::new(ReassemblyConfig::default(), 4096);
        h.writer.append(b"a\rb\r\r\n");
        h.cycle();
        assert_eq!(h.texts(), vec!["a\rb\r"]);
    }

    #[test]
    fn test_lines_reach_console_and_batch() {
        let mut h = Harness::new(ReassemblyConfig::default(), 4096);
        h.writer.append(b"one\ntwo\n");
        h.cycle();
        let snapshot = h.flusher.take();
        assert_eq!(snapshot.lines, 2);
        assert_eq!(snapshot.text, "[NO_RTC] one\n[NO_RTC] two\n");
        assert_eq!(h.console.0, vec!["[NO_RTC] one", "[NO_RTC] two"]);
    }

    #[test]
    fn test_per_cycle_cap() {
        let mut h = Harness::new(config(64, 3, 4096), 4096);
        h.writer.append(b"1\n2\n3\n4\n5\n");
        assert_eq!(h.cycle().forwarded, 3);
        assert_eq!(h.cycle().forwarded, 2);
        assert_eq!(h.texts(), vec!["1", "2", "3", "4", "5"]);
    }

    #[test]
    fn test_line_at_ceiling_is_intact() {
        let mut h = Harness::new(config(8, 10, 4096), 4096);
        h.writer.append(b"12345678\n");
        h.cycle();
        assert_eq!(h.texts(), vec!["12345678"]);
    }

    #[test]
    fn test_crlf_line_at_ceiling_is_intact() {
        let mut h = Harness::new(config(8, 10, 4096), 4096);
        h.writer.append(b"12345678\r\n1234567\r\r\n");
        h.cycle();
        assert_eq!(h.texts(), vec!["12345678", "1234567\r"]);
        assert_eq!(h.assembler.stats().truncated_lines, 0);
    }

    #[test]
    fn test_crlf_split_at_ceiling_waits_for_line_feed() {
        let mut h = Harness::new(config(8, 10, 4096), 4096);
        h.writer.append(b"12345678\r");
        h.cycle();
        assert!(h.texts().is_empty());

        h.writer.append(b"\nnext\n");
        h.cycle();
        assert_eq!(h.texts(), vec!["12345678", "next"]);
    }

    #[test]
    fn test_cr_at_ceiling_inside_long_line_is_truncated() {
        let mut h = Harness::new(config(8, 10, 4096), 4096);
        h.writer.append(b"12345678\rxy\n");
        h.cycle();
        assert_eq!(h.texts(), vec!["12345678 [TRUNCATED]", "\rxy"]);
    }

    #[test]
    fn test_truncation_keeps_multibyte_characters_whole() {
        let mut h = Harness::new(config(8, 10, 4096), 4096);
        h.writer.append("1234567\u{e9}89\n".as_bytes());
        h.cycle();
        assert_eq!(h.texts(), vec!["1234567 [TRUNCATED]", "\u{e9}89"]);

        h.writer.append("123456\u{20ac}\u{20ac}\n".as_bytes());
        h.cycle();
        assert_eq!(
            h.texts(),
            vec![
                "1234567 [TRUNCATED]",
                "\u{e9}89",
                "123456 [TRUNCATED]",
                "\u{20ac}\u{20ac}",
            ]
        );
    }

    #[test]
    fn test_char_boundary() {
        assert_eq!(char_boundary(b"abc"), 3);
        assert_eq!(char_boundary("a\u{e9}".as_bytes()), 3);
        assert_eq!(char_boundary(&"a\u{e9}".as_bytes()[..2]), 1);
        assert_eq!(char_boundary(&"\u{1f600}".as_bytes()[..3]), 0);
        // Stray continuation bytes are left to lossy decoding
        assert_eq!(char_boundary(&[b'a', 0x80]), 2);
    }

    #[test]
    fn test_over_long_line_is_truncated_and_marked() {
        let mut h = Harness::new(config(8, 10, 4096), 4096);
        h.writer.append(b"123456789abc\n");
        h.cycle();
        assert_eq!(h.texts(), vec!["12345678 [TRUNCATED]", "9abc"]);
        assert_eq!(h.assembler.stats().truncated_lines, 1);
    }

    #[test]
    fn test_terminator_free_stream_truncates_once_per_ceiling() {
        let ceiling = 16;
        let mut h = Harness::new(config(ceiling, 10, 1 << 16), 1 << 16);
        let input: Vec<u8> = (0..5 * ceiling + 3).map(|i| b'a' + (i % 26) as u8).collect();
        for chunk in input.chunks(7) {
            h.writer.append(chunk);
            h.cycle();
        }

        let texts = h.texts();
        assert_eq!(texts.len(), 5);
        for (i, text) in texts.iter().enumerate() {
            let body = text.strip_suffix(TRUNCATION_MARKER).unwrap();
            assert_eq!(body.as_bytes(), &input[i * ceiling..(i + 1) * ceiling]);
        }
        // The remainder is still buffered, not lost
        assert_eq!(h.assembler.pending(), 3);
    }

    #[test]
    fn test_high_water_clears_with_marker() {
        let mut h = Harness::new(config(64, 1, 20), 64);
        h.writer.append(b"a\nb\nc\n0123456789012345678901234567890");
        let report = h.cycle();
        assert_eq!(report.discarded, 35);
        assert_eq!(h.assembler.pending(), 0);
        assert_eq!(
            h.texts(),
            vec!["a", "[BUFFER OVERFLOW] 35 bytes discarded"]
        );
        assert_eq!(h.assembler.stats().overflow_clears, 1);
    }

    #[test]
    fn test_ingest_drops_become_marker_line() {
        let mut h = Harness::new(ReassemblyConfig::default(), 8);
        h.writer.append(b"ok\n");
        h.writer.append(b"far too long");
        h.cycle();
        assert_eq!(h.texts(), vec!["ok", "[INGEST DROPPED 12 bytes]"]);
    }

    #[test]
    fn test_drop_marker_waits_for_earlier_lines_across_cycles() {
        let mut h = Harness::new(config(64, 1, 4096), 8);
        h.writer.append(b"a\nb\n");
        h.writer.append(b"toolong!!");
        h.cycle();
        assert_eq!(h.texts(), vec!["a"]);

        h.cycle();
        h.writer.append(b"c\n");
        h.cycle();
        assert_eq!(h.texts(), vec!["a", "b", "[INGEST DROPPED 9 bytes]", "c"]);
    }

    #[test]
    fn test_drop_marker_precedes_unfinished_line() {
        let mut h = Harness::new(ReassemblyConfig::default(), 8);
        h.writer.append(b"ok\npar");
        h.writer.append(b"dropped");
        h.cycle();
        assert_eq!(h.texts(), vec!["ok", "[INGEST DROPPED 7 bytes]"]);
        assert_eq!(h.assembler.pending(), 3);
    }

    #[test]
    fn test_drain_ignores_cycle_cap_but_keeps_partial() {
        let mut h = Harness::new(config(64, 2, 4096), 4096);
        h.writer.append(b"1\n2\n3\n4\n5\npartial");
        h.drain();
        assert_eq!(h.texts(), vec!["1", "2", "3", "4", "5"]);
        assert_eq!(h.assembler.pending(), 7);
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut h = Harness::new(ReassemblyConfig::default(), 4096);
        h.writer.append(&[b'o', 0xFF, b'k', b'\n']);
        h.cycle();
        assert_eq!(h.texts(), vec!["o\u{FFFD}k"]);
    }

    proptest! {
        #[test]
        fn prop_one_line_per_terminator(
            lines in prop::collection::vec("[a-z0-9 ]{1,40}", 1..40),
            crlf in any::<bool>(),
            split in 1usize..17,
        ) {
            let mut h = Harness::new(config(64, 10, 1 << 16), 1 << 16);
            let sep: &[u8] = if crlf { b"\r\n" } else { b"\n" };
            let mut stream = Vec::new();
            for line in &lines {
                stream.extend_from_slice(line.as_bytes());
                stream.extend_from_slice(sep);
            }
            for chunk in stream.chunks(split) {
                h.writer.append(chunk);
                h.cycle();
            }
            h.drain();
            prop_assert_eq!(h.texts(), lines);
        }

        #[test]
        fn prop_truncation_count_matches_ceiling_multiples(
            ceiling in 4usize..64,
            full in 0usize..8,
            rest in 1usize..4,
        ) {
            let mut h = Harness::new(config(ceiling, 10, 1 << 16), 1 << 16);
            let rest = rest.min(ceiling);
            let input = vec![b'x'; full * ceiling + rest];
            h.writer.append(&input);
            h.drain();
            let texts = h.texts();
            prop_assert_eq!(texts.len(), full);
            prop_assert!(texts.iter().all(|t| t.ends_with(TRUNCATION_MARKER)));
            prop_assert_eq!(h.assembler.pending(), rest);
        }
    }
}
