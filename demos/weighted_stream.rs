use std::num::NonZeroU32;
use std::time::{Duration, Instant};

use futures::stream;
use nonzero_ext::nonzero;
use tokenwell::{RateLimit, ThrottleStreamExt, TokenBucket, TokioTimer};
use tokio_stream::StreamExt;

#[derive(Debug)]
struct Upload {
    file: &'static str,
    kib: u32,
}

/// An upload stream and a stream of pings share one bucket. Both queue on the
/// same backlog, so a large upload holds back the pings queued after it.
#[tokio::main]
async fn main() {
    // 4 tokens per second, at most 8 at once; one token per KiB
    let limit = RateLimit::per_second_and_burst(nonzero!(4u32), nonzero!(8u32));
    let bucket = TokenBucket::started(limit, TokioTimer::new());
    let start = Instant::now();

    let uploads = stream::iter([
        Upload { file: "notes.txt", kib: 2 },
        Upload { file: "photo.jpg", kib: 8 },
        Upload { file: "report.pdf", kib: 6 },
        Upload { file: "huge.iso", kib: 64 },
    ])
    .throttle_weighted(bucket.clone(), |upload: &Upload| {
        NonZeroU32::new(upload.kib).unwrap_or(nonzero!(1u32))
    });

    let pinger = {
        let bucket = bucket.clone();
        tokio::spawn(async move {
            for seq in 1..=5 {
                let pong = bucket.will_deduct(nonzero!(1u32)).expect("1 fits into 8");
                println!(
                    "[{:>5.2}s] ping #{seq} queued, backlog holds {} tokens",
                    start.elapsed().as_secs_f64(),
                    bucket.backlog_total()
                );
                pong.await.expect("bucket outlives the pinger");
                println!("[{:>5.2}s] ping #{seq} sent", start.elapsed().as_secs_f64());
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
        })
    };

    let mut uploads = std::pin::pin!(uploads);
    while let Some(upload) = uploads.next().await {
        // weights above the burst are clamped to it
        println!(
            "[{:>5.2}s] uploaded {} ({} KiB), {} tokens left, {} queued",
            start.elapsed().as_secs_f64(),
            upload.file,
            upload.kib,
            bucket.available(),
            bucket.backlog_total()
        );
    }

    pinger.await.expect("pinger task panicked");
    println!("done in {:.2}s", start.elapsed().as_secs_f64());
}
