use std::time::Instant;

use nonzero_ext::nonzero;
use tokenwell::{RateLimit, TokenBucket, TokioTimer};
use tokio::task::JoinSet;

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    // 2 tokens per second, at most 4 at once
    let limit = RateLimit::per_second_and_burst(nonzero!(2u32), nonzero!(4u32));
    let bucket = TokenBucket::started(limit, TokioTimer::new());

    let start = Instant::now();
    let mut handles = JoinSet::new();
    for i in 1..=6u32 {
        let waiter = bucket.will_deduct(nonzero!(3u32)).expect("3 fits into 4");
        handles.spawn(async move {
            waiter.await.expect("bucket outlives the waiters");
            println!("[waiter={i}] got 3 tokens, elapsed={:?}", start.elapsed());
        });
    }
    println!(
        "queued {} tokens across {} waiters",
        bucket.backlog_total(),
        bucket.backlog_len()
    );

    handles.join_all().await;
    println!("Completed in {:?}", start.elapsed());
}
