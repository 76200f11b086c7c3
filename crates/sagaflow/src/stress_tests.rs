//! Randomized interleavings of dispatch and run progress.
//!
//! Each test derives its schedule from a seeded [`fastrand::Rng`], so a
//! failure can be replayed by fixing the seed printed in the assertion.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::timeout;

use crate::{Action, EngineBuilder, EngineHandle, FlowError, Policy, TaskContext};

const ROUNDS: usize = 40;
const GUARD: Duration = Duration::from_secs(10);

// ============================================================================
// Helpers
// ============================================================================

fn schedule(seed: u64) -> Vec<(u64, u64)> {
    let mut rng = fastrand::Rng::with_seed(seed);
    (0..ROUNDS)
        .map(|_| (rng.u64(0..4), rng.u64(0..8)))
        .collect()
}

async fn dispatch_all(handle: &EngineHandle, kind: &'static str, plan: &[(u64, u64)], ended: &Arc<AtomicUsize>) {
    for (n, (jitter_ms, delay_ms)) in plan.iter().enumerate() {
        let ended = ended.clone();
        handle.dispatch(
            Action::with_payload(kind, json!({"n": n, "delay_ms": delay_ms})).on_end(move |_, _| {
                ended.fetch_add(1, Ordering::SeqCst);
            }),
        );
        if *jitter_ms > 0 {
            tokio::time::sleep(Duration::from_millis(*jitter_ms)).await;
        }
    }
}

async fn record_after_delay(action: Action, mut ctx: TaskContext) -> Result<(), FlowError> {
    let n = action.payload()["n"].clone();
    let delay_ms = action.payload()["delay_ms"].as_u64().unwrap_or(0);
    ctx.delay(Duration::from_millis(delay_ms)).await?;

    let mut writes = ctx
        .select(|state| state.entity("writes").cloned())
        .unwrap_or_else(|| json!([]));
    if let Some(items) = writes.as_array_mut() {
        items.push(n.clone());
    }
    ctx.update_entity("writes", writes)?;
    ctx.update_entity("last", n)?;
    Ok(())
}

fn written(handle: &EngineHandle) -> Vec<u64> {
    handle
        .state()
        .entity("writes")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_u64).collect())
        .unwrap_or_default()
}

// ============================================================================
// Policies under random interleavings
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_flight_never_writes_out_of_order() {
    for seed in [7, 42, 1337] {
        let handle = EngineBuilder::new()
            .register("WRITE", Policy::SingleFlightLatest, record_after_delay)
            .build()
            .start();
        let ended = Arc::new(AtomicUsize::new(0));

        dispatch_all(&handle, "WRITE", &schedule(seed), &ended).await;
        timeout(GUARD, handle.settled()).await.unwrap();

        let writes = written(&handle);
        assert!(
            writes.windows(2).all(|pair| pair[0] < pair[1]),
            "seed {seed}: superseded run wrote late: {writes:?}"
        );
        assert_eq!(writes.last(), Some(&(ROUNDS as u64 - 1)), "seed {seed}");
        assert_eq!(ended.load(Ordering::SeqCst), ROUNDS, "seed {seed}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_every_completes_every_run() {
    for seed in [3, 99] {
        let handle = EngineBuilder::new()
            .register("WRITE", Policy::ConcurrentEvery, record_after_delay)
            .build()
            .start();
        let ended = Arc::new(AtomicUsize::new(0));

        dispatch_all(&handle, "WRITE", &schedule(seed), &ended).await;
        timeout(GUARD, handle.settled()).await.unwrap();

        let mut writes = written(&handle);
        writes.sort_unstable();
        assert_eq!(writes, (0..ROUNDS as u64).collect::<Vec<_>>(), "seed {seed}");
        assert_eq!(ended.load(Ordering::SeqCst), ROUNDS, "seed {seed}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sequential_never_overlaps() {
    let active = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(Mutex::new(Vec::new()));
    let (gauge, seen) = (active.clone(), overlaps.clone());

    let handle = EngineBuilder::new()
        .register("WRITE", Policy::Sequential, move |action: Action, ctx: TaskContext| {
            let gauge = gauge.clone();
            let seen = seen.clone();
            async move {
                let running = gauge.fetch_add(1, Ordering::SeqCst) + 1;
                if running > 1 {
                    seen.lock().unwrap().push(running);
                }
                let result = record_after_delay(action, ctx).await;
                gauge.fetch_sub(1, Ordering::SeqCst);
                result
            }
        })
        .build()
        .start();
    let ended = Arc::new(AtomicUsize::new(0));

    dispatch_all(&handle, "WRITE", &schedule(11), &ended).await;
    timeout(GUARD, handle.settled()).await.unwrap();

    assert!(overlaps.lock().unwrap().is_empty());
    assert_eq!(written(&handle), (0..ROUNDS as u64).collect::<Vec<_>>());
    assert_eq!(ended.load(Ordering::SeqCst), ROUNDS);
}
