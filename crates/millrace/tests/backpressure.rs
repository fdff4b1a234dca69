//! Producer-side backpressure: the bounded memory pool gating writes into
//! the log stream.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use millrace::{
    ActorScheduler, BoundedMemoryPool, InMemoryLogStorage, LogStream, LogStreamConfig,
    MemoryPoolConfig, PoolError, RecordSpec, SchedulerConfig,
};

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

#[test]
fn pool_bounds_in_flight_request_memory() {
    let scheduler = ActorScheduler::new(SchedulerConfig::default()).unwrap();
    let storage = Arc::new(InMemoryLogStorage::new());
    let stream = Arc::new(LogStream::new(
        LogStreamConfig::default(),
        storage as Arc<dyn millrace::LogStorage>,
    ));
    stream.open_appender(&scheduler).unwrap();

    let pool = Arc::new(BoundedMemoryPool::new(
        MemoryPoolConfig::builder()
            .capacity(256)
            .max_block_time(Duration::from_millis(20))
            .build(),
    ));
    let writer = stream.new_writer();

    // A producer reserves request memory before writing and reclaims it
    // once the record is committed.
    let mut block = pool.allocate(128).unwrap();
    block.as_mut_slice().copy_from_slice(&[7u8; 128]);
    let position = writer
        .write(RecordSpec::command(1, 1, block.as_slice().to_vec()))
        .unwrap();

    // While the first request is in flight, capacity for a second large
    // one is unavailable: the producer blocks on its own thread, then
    // gets a typed failure.
    assert!(matches!(
        pool.allocate(200),
        Err(PoolError::CapacityExhausted { .. })
    ));

    assert!(wait_for(
        || stream.commit_position() >= position,
        Duration::from_secs(2)
    ));
    pool.reclaim(block);

    // Reclaimed capacity admits the next request.
    let block = pool.allocate(200).unwrap();
    pool.reclaim(block);

    scheduler.shutdown(Duration::from_secs(1));
}
