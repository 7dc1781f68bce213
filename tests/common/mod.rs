#![allow(dead_code)]

pub mod tracing;

use remote_window::config::Config;
use remote_window::event::{EngineEvent, Subscription};
use std::time::Duration;

/// Lines `"{n:08} {tag} ..."`, each 64 bytes including the newline
pub fn log_line(n: usize, tag: &str) -> String {
    let mut line = format!("{:08} {:<5} request served", n, tag);
    line.truncate(63);
    format!("{:<63}\n", line)
}

/// Build a log of at least `min_bytes`, tagging every `error_every`th line ERROR
pub fn generate_log(min_bytes: usize, error_every: usize) -> String {
    let mut out = String::with_capacity(min_bytes + 64);
    let mut n = 0;
    while out.len() < min_bytes {
        let tag = if error_every > 0 && n % error_every == 0 {
            "ERROR"
        } else {
            "INFO"
        };
        out.push_str(&log_line(n, tag));
        n += 1;
    }
    out
}

pub fn config_with_threshold(threshold: u64) -> Config {
    let mut config = Config::default();
    config.mode.large_file_threshold_bytes = threshold;
    config.mode.max_full_load_bytes = threshold.max(config.mode.max_full_load_bytes);
    config
}

/// Wait for the first event matching `pred`, failing the test after 5s.
pub async fn next_matching(
    subscription: &mut Subscription,
    pred: impl Fn(&EngineEvent) -> bool,
) -> EngineEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match subscription.events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
