//! Pipeline Integration Tests
//!
//! Drives the full capture pipeline (completion handler, reassembly, batch,
//! persistence) against in-memory storage and a controllable clock.
//!
//! # Test Scenarios
//! - Lines split across packets arrive intact and in order in the log file
//! - Sessions without a clock
//! - Flush idempotence
//! - Device detach stops resubmission, a later attach resumes cleanly
//! - Overload on the ingestion side and on the storage side
//! - Rotation in the middle of a stream
//!
//! Run with: `cargo test -p common --test pipeline_tests`

use capture::clock::DEFAULT_RESYNC;
use capture::command::{time_reply, time_set_reply};
use capture::persist::STARTUP_MARKER;
use capture::{
    CaptureError, ClockAdapter, Pipeline, PipelineConfig, ReassemblyConfig, Resubmit,
    SharedClock, TransferStatus, resolve_bulk_in,
};
use common::test_utils::{
    CapturedConsole, ConfigDescriptorBuilder, ManualClock, MemoryStorage, datetime, packetize,
};
use std::time::{Duration, Instant};

struct Rig {
    pipeline: Pipeline<MemoryStorage>,
    storage: MemoryStorage,
    console: CapturedConsole,
}

impl Rig {
    fn new(config: PipelineConfig, clock: ManualClock) -> Self {
        let storage = MemoryStorage::new();
        let clock = SharedClock::new(ClockAdapter::new(Box::new(clock), DEFAULT_RESYNC));
        let pipeline = Pipeline::build(&config, storage.clone(), clock);
        pipeline.gate.open();
        Self {
            pipeline,
            storage,
            console: CapturedConsole::new(),
        }
    }

    fn receive(&self, data: &[u8], packet_size: usize) {
        for packet in packetize(data, packet_size) {
            let next = self
                .pipeline
                .ingestion
                .on_transfer_complete(TransferStatus::Completed, &packet);
            assert_eq!(next, Resubmit::Again);
        }
    }

    fn reassemble(&mut self) {
        let p = &mut self.pipeline;
        p.assembler.drain(&p.clock, &mut self.console, &mut p.batch);
    }

    fn flush(&mut self) {
        self.pipeline.persistence.finish(Instant::now());
    }

    fn file(&self) -> String {
        let name = self
            .pipeline
            .persistence
            .current_file()
            .expect("log file selected");
        self.storage.contents(name).expect("log file exists")
    }
}

fn fixed_clock() -> ManualClock {
    ManualClock::at(datetime(2025, 1, 15, 10, 30, 0))
}

#[test]
fn test_lines_round_trip_to_log_file() {
    let mut rig = Rig::new(PipelineConfig::default(), fixed_clock());
    assert_eq!(
        rig.pipeline.persistence.start_session().unwrap(),
        "log_20250115_103000.txt"
    );

    let lines: Vec<String> = (0..200).map(|i| format!("sensor {} value={}", i, i * 7)).collect();
    let mut stream = Vec::new();
    for line in &lines {
        stream.extend_from_slice(line.as_bytes());
        stream.extend_from_slice(b"\r\n");
    }

    // Interleave reception, reassembly and persistence the way the runtime does
    for chunk in stream.chunks(1024) {
        rig.receive(chunk, 64);
        rig.reassemble();
        rig.pipeline.persistence.run_cycle(Instant::now());
    }
    rig.flush();

    let file = rig.file();
    let mut file_lines = file.lines();
    assert_eq!(
        file_lines.next(),
        Some(format!("[15.01.2025 10:30:00] {}", STARTUP_MARKER).as_str())
    );
    let logged: Vec<&str> = file_lines
        .map(|l| l.strip_prefix("[15.01.2025 10:30:00] ").unwrap())
        .collect();
    assert_eq!(logged, lines);

    assert_eq!(rig.console.lines().len(), 200);
    assert_eq!(rig.pipeline.persistence.stats().lines_written, 200);
    assert_eq!(rig.pipeline.counters.total_bytes(), stream.len() as u64);
}

#[test]
fn test_session_without_clock() {
    let mut rig = Rig::new(PipelineConfig::default(), ManualClock::unavailable());
    assert_eq!(rig.pipeline.persistence.start_session().unwrap(), "usb_log.txt");

    rig.receive(b"boot ok\n", 64);
    rig.reassemble();
    rig.flush();

    assert_eq!(
        rig.file(),
        "[NO_RTC] === USB Logger Started ===\n[NO_RTC] boot ok\n"
    );
    assert_eq!(time_reply(rig.pipeline.clock.now()), "[RTC] Clock unavailable");
    assert!(matches!(
        rig.pipeline.clock.set(datetime(2025, 1, 1, 0, 0, 0)),
        Err(CaptureError::ClockUnavailable)
    ));
}

#[test]
fn test_settime_then_gettime() {
    let rig = Rig::new(PipelineConfig::default(), fixed_clock());
    let new_time = datetime(2026, 3, 1, 8, 0, 0);
    rig.pipeline.clock.set(new_time).unwrap();
    assert_eq!(time_set_reply(new_time), "[RTC] Time set: 2026-03-01 08:00:00");
    assert_eq!(
        time_reply(rig.pipeline.clock.now()),
        "[RTC] Current time: 2026-03-01 08:00:00"
    );
}

#[test]
fn test_repeated_flushes_write_each_line_once() {
    let mut rig = Rig::new(PipelineConfig::default(), fixed_clock());
    rig.pipeline.persistence.start_session().unwrap();

    rig.receive(b"only once\n", 64);
    rig.reassemble();
    let opens_before = rig.storage.open_count();
    for _ in 0..5 {
        rig.flush();
    }

    assert_eq!(rig.file().matches("only once").count(), 1);
    assert_eq!(rig.storage.open_count(), opens_before + 1);
    assert_eq!(rig.pipeline.persistence.stats().flush_ops, 1);
}

#[test]
fn test_detach_stops_resubmission() {
    let mut rig = Rig::new(PipelineConfig::default(), fixed_clock());
    rig.pipeline.persistence.start_session().unwrap();

    rig.receive(b"before\n", 64);
    let stage = &rig.pipeline.ingestion;
    assert_eq!(stage.on_transfer_complete(TransferStatus::TimedOut, &[]), Resubmit::Again);
    assert_eq!(stage.on_transfer_complete(TransferStatus::NoDevice, &[]), Resubmit::Stop);
    assert!(!rig.pipeline.gate.is_open());

    // A late completion after detach must not be appended
    assert_eq!(
        stage.on_transfer_complete(TransferStatus::Completed, b"after\n"),
        Resubmit::Stop
    );

    rig.reassemble();
    rig.flush();
    let file = rig.file();
    assert!(file.contains("before"));
    assert!(!file.contains("after"));
}

#[test]
fn test_reattach_resumes_ingestion() {
    let mut rig = Rig::new(PipelineConfig::default(), fixed_clock());
    rig.pipeline.persistence.start_session().unwrap();

    rig.receive(b"first device\nunfinished", 64);
    let stage = &rig.pipeline.ingestion;
    assert_eq!(stage.on_transfer_complete(TransferStatus::NoDevice, &[]), Resubmit::Stop);
    assert_eq!(
        stage.on_transfer_complete(TransferStatus::Completed, b" stale\n"),
        Resubmit::Stop
    );

    // The next device gets its own endpoint before the gate opens
    let descriptor = ConfigDescriptorBuilder::cdc_acm(0x82).build();
    let endpoint = resolve_bulk_in(&descriptor, None).unwrap();
    assert_eq!(endpoint.address, 0x82);
    rig.pipeline.gate.open();

    rig.receive(b"second device\n", 64);
    assert!(rig.pipeline.gate.is_open());
    rig.reassemble();
    rig.flush();

    let file = rig.file();
    assert!(!file.contains("stale"));
    let logged: Vec<&str> = file
        .lines()
        .skip(1)
        .map(|l| l.strip_prefix("[15.01.2025 10:30:00] ").unwrap())
        .collect();
    assert_eq!(logged, vec!["first device", "unfinished", "second device"]);
}

#[test]
fn test_ingestion_overload_is_reported_in_log() {
    let config = PipelineConfig {
        ingest_capacity: 256,
        reassembly: ReassemblyConfig {
            high_water: 192,
            ..ReassemblyConfig::default()
        },
        ..PipelineConfig::default()
    };
    let mut rig = Rig::new(config, fixed_clock());
    rig.pipeline.persistence.start_session().unwrap();

    // 512 bytes arrive before reassembly gets to run
    let burst = format!("{}\n", "x".repeat(63)).repeat(8);
    rig.receive(burst.as_bytes(), 64);
    let dropped = rig.pipeline.counters.take_interval().dropped_bytes;
    assert_eq!(dropped, 256);
    assert!(rig.pipeline.gauge.used() <= rig.pipeline.gauge.capacity());

    rig.reassemble();
    rig.flush();
    let file = rig.file();
    assert!(file.contains("[INGEST DROPPED 256 bytes]"));
    assert_eq!(file.matches(&"x".repeat(63)).count(), 4);
}

#[test]
fn test_storage_failure_counts_lost_lines_and_recovers() {
    let mut rig = Rig::new(PipelineConfig::default(), fixed_clock());
    rig.pipeline.persistence.start_session().unwrap();

    rig.storage.set_failing(true);
    rig.receive(b"lost 1\nlost 2\n", 64);
    rig.reassemble();
    rig.flush();
    assert_eq!(rig.pipeline.persistence.stats().lines_lost, 2);

    rig.storage.set_failing(false);
    rig.receive(b"kept\n", 64);
    rig.reassemble();
    rig.flush();

    let file = rig.file();
    assert!(!file.contains("lost"));
    assert!(file.ends_with("kept\n"));
}

#[test]
fn test_rotation_mid_stream() {
    let clock = fixed_clock();
    let mut rig = Rig::new(PipelineConfig::default(), clock);
    let first = rig.pipeline.persistence.start_session().unwrap();

    rig.receive(b"old file\n", 64);
    rig.reassemble();

    rig.pipeline.clock.set(datetime(2025, 1, 15, 12, 0, 0)).unwrap();
    let second = rig.pipeline.persistence.rotate(Instant::now()).unwrap();
    assert_ne!(first, second);

    rig.receive(b"new file\n", 64);
    rig.reassemble();
    rig.flush();

    let old = rig.storage.contents(&first).unwrap();
    let new = rig.storage.contents(&second).unwrap();
    assert!(old.contains("old file") && !old.contains("new file"));
    assert!(new.starts_with("[15.01.2025 12:00:00] === New logging session ==="));
    assert!(new.contains("new file"));
}

#[test]
fn test_dwell_flush_without_high_water() {
    let mut rig = Rig::new(PipelineConfig::default(), fixed_clock());
    rig.pipeline.persistence.start_session().unwrap();
    rig.receive(b"slow trickle\n", 64);
    rig.reassemble();

    let start = Instant::now();
    assert!(rig.pipeline.persistence.run_cycle(start).is_none());
    let outcome = rig
        .pipeline
        .persistence
        .run_cycle(start + Duration::from_secs(3))
        .unwrap();
    assert!(outcome.written);
    assert!(rig.file().contains("slow trickle"));
}

#[test]
fn test_lines_reach_a_real_directory() {
    let dir = tempfile::tempdir().unwrap();
    let storage = capture::DirStorage::new(dir.path(), true);
    let clock = SharedClock::new(ClockAdapter::new(Box::new(fixed_clock()), DEFAULT_RESYNC));
    let mut pipeline = Pipeline::build(&PipelineConfig::default(), storage.clone(), clock);
    pipeline.gate.open();
    let name = pipeline.persistence.start_session().unwrap();

    for packet in packetize(b"temp=21.5\r\nhum=40\n", 8) {
        pipeline
            .ingestion
            .on_transfer_complete(TransferStatus::Completed, &packet);
    }
    let mut console = CapturedConsole::new();
    pipeline
        .assembler
        .drain(&pipeline.clock, &mut console, &mut pipeline.batch);
    pipeline.persistence.finish(Instant::now());

    let written = std::fs::read_to_string(storage.path_of(&name)).unwrap();
    assert_eq!(
        written,
        format!(
            "[15.01.2025 10:30:00] {}\n[15.01.2025 10:30:00] temp=21.5\n[15.01.2025 10:30:00] hum=40\n",
            STARTUP_MARKER
        )
    );
}
