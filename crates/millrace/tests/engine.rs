//! End-to-end processing properties: deterministic application, atomic
//! follow-ups, snapshot/recovery, and replay without re-emission.

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use millrace::{
    ActorScheduler, ActorState, DispatchTable, InMemoryLogStorage, InMemoryStateDb, LogStream,
    LogStreamConfig, ProcessingContext, ProcessingError, Record, RecordSpec, RecordType,
    SchedulerConfig, SnapshotDirector, SnapshotDirectorConfig, SnapshotStore, StateDb,
    StreamProcessor, StreamProcessorConfig,
};

const VT_LEDGER: u16 = 1;
const INTENT_DEPOSIT: u16 = 1;
const INTENT_DEPOSITED: u16 = 2;

/// Deposits `payload[1]` into account `payload[0]`, tracks a running
/// total, and emits a `Deposited` event.
fn deposit_handler(
    record: &Record,
    ctx: &mut ProcessingContext<'_, InMemoryStateDb>,
) -> Result<(), ProcessingError> {
    let account = record.payload[0];
    let amount = u64::from(record.payload[1]);

    let balance_key = [b'b', account];
    let balance = read_u64(ctx.get(&balance_key)) + amount;
    ctx.put(&balance_key, balance.to_le_bytes().to_vec());

    let total = read_u64(ctx.get(b"total")) + amount;
    ctx.put(b"total", total.to_le_bytes().to_vec());

    ctx.stage_follow_up(RecordSpec::event(
        VT_LEDGER,
        INTENT_DEPOSITED,
        record.payload.clone(),
    ));
    Ok(())
}

fn read_u64(value: Option<Vec<u8>>) -> u64 {
    value
        .and_then(|v| <[u8; 8]>::try_from(v.as_slice()).ok())
        .map_or(0, u64::from_le_bytes)
}

fn ledger_dispatch() -> DispatchTable<InMemoryStateDb> {
    DispatchTable::builder()
        .on(RecordType::Command, VT_LEDGER, INTENT_DEPOSIT, deposit_handler)
        .build()
}

fn wait_for<F: Fn() -> bool>(predicate: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    predicate()
}

struct Fixture {
    scheduler: ActorScheduler,
    stream: Arc<LogStream>,
    snapshots: Arc<SnapshotStore>,
}

impl Fixture {
    fn new(snapshot_dir: &Path) -> Self {
        let scheduler = ActorScheduler::new(SchedulerConfig::default()).unwrap();
        let storage = Arc::new(InMemoryLogStorage::new());
        let stream = Arc::new(LogStream::new(
            LogStreamConfig::default(),
            storage as Arc<dyn millrace::LogStorage>,
        ));
        stream.open_appender(&scheduler).unwrap();
        let snapshots = Arc::new(SnapshotStore::open(snapshot_dir).unwrap());
        Self {
            scheduler,
            stream,
            snapshots,
        }
    }

    fn spawn_processor(
        &self,
    ) -> (
        millrace::ActorHandle<StreamProcessor<InMemoryStateDb>>,
        Arc<millrace::engine::ProcessorPositions>,
    ) {
        let processor = StreamProcessor::new(
            StreamProcessorConfig::default(),
            InMemoryStateDb::new(),
            ledger_dispatch(),
            &self.stream,
            Arc::clone(&self.snapshots),
        );
        let positions = processor.positions();
        let handle = self.scheduler.spawn(processor).unwrap();
        (handle, positions)
    }
}

/// Reads the processor's state by checkpointing it into a scratch
/// directory and restoring the copy locally.
fn read_state(
    handle: &millrace::ActorHandle<StreamProcessor<InMemoryStateDb>>,
    scratch: &Path,
) -> InMemoryStateDb {
    let future: millrace::ActorFuture<Result<i64, String>> = millrace::ActorFuture::new();
    let completer = future.clone();
    let dir = scratch.to_path_buf();
    handle
        .submit(move |processor, _ctx| {
            completer.complete(processor.checkpoint_into(&dir).map_err(|e| e.to_string()));
            Ok(())
        })
        .unwrap();
    future.join_timeout(Duration::from_secs(2)).unwrap().unwrap();

    let mut state = InMemoryStateDb::new();
    state.restore(scratch).unwrap();
    state
}

fn collect_log(stream: &LogStream) -> Vec<Record> {
    let mut reader = stream.new_reader();
    let mut records = Vec::new();
    while let Some(record) = reader.next().unwrap() {
        records.push(record);
    }
    records
}

#[test]
fn commands_fold_into_state_and_emit_follow_ups() {
    let snapshot_dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(snapshot_dir.path());
    let (handle, positions) = fixture.spawn_processor();

    let writer = fixture.stream.new_writer();
    for (account, amount) in [(1u8, 10u8), (2, 20), (1, 5)] {
        writer
            .write(RecordSpec::command(
                VT_LEDGER,
                INTENT_DEPOSIT,
                vec![account, amount],
            ))
            .unwrap();
    }

    // 3 commands at positions 0..2 plus 3 events at 3..5.
    assert!(wait_for(|| positions.last_processed() >= 5, Duration::from_secs(2)));
    assert!(positions.last_written() >= 3);

    let scratch = tempfile::tempdir().unwrap();
    let state = read_state(&handle, scratch.path());
    assert_eq!(read_u64(state.get(b"total")), 35);
    assert_eq!(read_u64(state.get(&[b'b', 1])), 15);
    assert_eq!(read_u64(state.get(&[b'b', 2])), 20);

    // Every event names its causing command.
    let records = collect_log(&fixture.stream);
    let events: Vec<&Record> = records.iter().filter(|r| r.is_event()).collect();
    assert_eq!(events.len(), 3);
    assert_eq!(
        events.iter().map(|e| e.source_position).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );

    fixture.scheduler.shutdown(Duration::from_secs(1));
}

#[test]
fn handler_error_is_fatal_and_isolated() {
    fn failing_handler(
        _record: &Record,
        _ctx: &mut ProcessingContext<'_, InMemoryStateDb>,
    ) -> Result<(), ProcessingError> {
        Err(ProcessingError::HandlerFailed {
            position: -1,
            message: "invariant violated".to_string(),
        })
    }

    let snapshot_dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(snapshot_dir.path());

    let processor = StreamProcessor::new(
        StreamProcessorConfig::default(),
        InMemoryStateDb::new(),
        DispatchTable::builder()
            .on(RecordType::Command, VT_LEDGER, INTENT_DEPOSIT, failing_handler)
            .build(),
        &fixture.stream,
        Arc::clone(&fixture.snapshots),
    );
    let handle = fixture.scheduler.spawn(processor).unwrap();

    let writer = fixture.stream.new_writer();
    writer
        .write(RecordSpec::command(VT_LEDGER, INTENT_DEPOSIT, vec![1, 1]))
        .unwrap();

    // The record is never skipped: the processor fails instead.
    assert!(wait_for(
        || handle.state() == ActorState::Failed,
        Duration::from_secs(2)
    ));

    // The log stream itself stays healthy.
    let position = writer
        .write(RecordSpec::command(VT_LEDGER, INTENT_DEPOSIT, vec![1, 1]))
        .unwrap();
    assert!(wait_for(
        || fixture.stream.commit_position() >= position,
        Duration::from_secs(2)
    ));

    fixture.scheduler.shutdown(Duration::from_secs(1));
}

#[test]
fn recovery_resumes_after_snapshot_and_replays_deterministically() {
    let snapshot_dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(snapshot_dir.path());
    let (handle, positions) = fixture.spawn_processor();

    let writer = fixture.stream.new_writer();
    for (account, amount) in [(1u8, 1u8), (1, 2), (1, 3)] {
        writer
            .write(RecordSpec::command(
                VT_LEDGER,
                INTENT_DEPOSIT,
                vec![account, amount],
            ))
            .unwrap();
    }
    assert!(wait_for(|| positions.last_processed() >= 5, Duration::from_secs(2)));

    // Periodic director publishes a snapshot of the processed prefix.
    let director = SnapshotDirector::new(
        SnapshotDirectorConfig {
            interval: Duration::from_millis(10),
            term: 1,
        },
        handle.clone(),
        Arc::clone(&positions),
        Arc::clone(&fixture.snapshots),
        Arc::clone(&fixture.stream),
    );
    let director_handle = fixture.scheduler.spawn(director).unwrap();
    assert!(wait_for(
        || fixture.snapshots.latest().unwrap().is_some(),
        Duration::from_secs(2)
    ));
    let snapshot = fixture.snapshots.latest().unwrap().unwrap();
    assert_eq!(snapshot.metadata().term, 1);
    assert!(snapshot.metadata().position >= 5);

    // Simulated crash: director and processor stop; new records arrive.
    assert!(director_handle
        .close()
        .join_timeout(Duration::from_secs(2))
        .is_some());
    assert!(handle.close().join_timeout(Duration::from_secs(2)).is_some());
    for (account, amount) in [(2u8, 4u8), (2, 5)] {
        writer
            .write(RecordSpec::command(
                VT_LEDGER,
                INTENT_DEPOSIT,
                vec![account, amount],
            ))
            .unwrap();
    }
    assert!(wait_for(
        || fixture.stream.commit_position() >= 7,
        Duration::from_secs(2)
    ));

    // A fresh processor recovers from the snapshot and catches up.
    let (restarted, restarted_positions) = fixture.spawn_processor();
    assert!(wait_for(
        || restarted_positions.last_processed() >= 9,
        Duration::from_secs(2)
    ));

    // State equals an uninterrupted run over the same record sequence.
    let scratch = tempfile::tempdir().unwrap();
    let state = read_state(&restarted, scratch.path());
    assert_eq!(read_u64(state.get(b"total")), 15);
    assert_eq!(read_u64(state.get(&[b'b', 1])), 6);
    assert_eq!(read_u64(state.get(&[b'b', 2])), 9);

    // Exactly one event per command, each sourced once.
    let records = collect_log(&fixture.stream);
    let mut sources: Vec<i64> = records
        .iter()
        .filter(|r| r.is_event())
        .map(|r| r.source_position)
        .collect();
    sources.sort_unstable();
    assert_eq!(sources, vec![0, 1, 2, 6, 7]);

    fixture.scheduler.shutdown(Duration::from_secs(1));
}

#[test]
fn replay_reapplies_state_without_reemitting_follow_ups() {
    let snapshot_dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(snapshot_dir.path());
    let (handle, positions) = fixture.spawn_processor();

    let writer = fixture.stream.new_writer();
    // Two commands: positions 0 and 1, events at 2 and 3.
    writer
        .write(RecordSpec::command(VT_LEDGER, INTENT_DEPOSIT, vec![1, 1]))
        .unwrap();
    writer
        .write(RecordSpec::command(VT_LEDGER, INTENT_DEPOSIT, vec![1, 2]))
        .unwrap();
    assert!(wait_for(|| positions.last_processed() >= 3, Duration::from_secs(2)));

    // Snapshot the prefix, then process one more command before the
    // "crash".
    let pending = fixture.snapshots.begin_pending("manual").unwrap();
    let future: millrace::ActorFuture<Result<i64, String>> = millrace::ActorFuture::new();
    let completer = future.clone();
    let dir = pending.clone();
    handle
        .submit(move |processor, _ctx| {
            completer.complete(processor.checkpoint_into(&dir).map_err(|e| e.to_string()));
            Ok(())
        })
        .unwrap();
    let snapshot_position = future
        .join_timeout(Duration::from_secs(2))
        .unwrap()
        .unwrap();
    fixture
        .snapshots
        .publish(
            &pending,
            &millrace::SnapshotMetadata::new(1, 0, snapshot_position),
        )
        .unwrap();

    writer
        .write(RecordSpec::command(VT_LEDGER, INTENT_DEPOSIT, vec![1, 4]))
        .unwrap();
    assert!(wait_for(|| positions.last_processed() >= 5, Duration::from_secs(2)));
    assert!(handle.close().join_timeout(Duration::from_secs(2)).is_some());

    // The restarted processor replays the post-snapshot suffix. The
    // suffix's command already has its event in the log, so nothing is
    // re-emitted.
    let (restarted, restarted_positions) = fixture.spawn_processor();
    assert!(wait_for(
        || restarted_positions.last_processed() >= 5,
        Duration::from_secs(2)
    ));

    let scratch = tempfile::tempdir().unwrap();
    let state = read_state(&restarted, scratch.path());
    assert_eq!(read_u64(state.get(b"total")), 7);

    let records = collect_log(&fixture.stream);
    let command_count = records.iter().filter(|r| r.is_command()).count();
    let event_count = records.iter().filter(|r| r.is_event()).count();
    assert_eq!(command_count, 3);
    assert_eq!(event_count, 3);

    fixture.scheduler.shutdown(Duration::from_secs(1));
}
