#![allow(dead_code)]

mod dirs;
mod fetcher;
mod logging;

use std::time::Duration;

pub use dirs::{TestDirs, write_aged_file, write_fresh_file};
pub use fetcher::MemoryFetcher;
pub use logging::LogCapture;

use anyhow::{Result, anyhow};
use tokio::time::sleep;

/// Polls `check` until it returns true or `deadline` passes.
pub async fn wait_until<F>(deadline: Duration, mut check: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let step = Duration::from_millis(10);
    let mut waited = Duration::ZERO;
    while waited < deadline {
        if check() {
            return Ok(());
        }
        sleep(step).await;
        waited += step;
    }
    if check() {
        Ok(())
    } else {
        Err(anyhow!("condition not met within {deadline:?}"))
    }
}
