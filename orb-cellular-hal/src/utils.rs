use crate::error::HalError;
use color_eyre::{eyre::eyre, Result};
use std::{
    future::Future,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};
use tokio::{process::Command, time};
use tracing::debug;

pub async fn run_cmd(cmd: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(cmd).args(args).output().await?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        let err = String::from_utf8_lossy(&output.stderr);
        let args = args.join(" ");
        Err(eyre!("Failed to run {cmd} {args}. Error {err}"))
    }
}

/// Shared, lock-protected value. Writers replace or mutate it under the write
/// lock, readers only ever see a complete value.
pub struct State<T> {
    state: Arc<RwLock<T>>,
}

impl<T> State<T> {
    pub fn new(state: T) -> Self {
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    pub fn read<F, K>(&self, f: F) -> K
    where
        F: FnOnce(&T) -> K,
    {
        let value = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&value)
    }

    pub fn write<F, K>(&self, f: F) -> K
    where
        F: FnOnce(&mut T) -> K,
    {
        let mut value = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut value)
    }
}

impl<T> Clone for State<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

/// Runs `f` up to `attempts` times, sleeping `backoff` (doubled every time)
/// between tries. Only timeouts are retried, any other error is returned
/// straight away.
pub async fn retry_on_timeout<F, Fut, K>(
    attempts: u32,
    backoff: Duration,
    mut f: F,
) -> Result<K, HalError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<K, HalError>>,
{
    let mut backoff = backoff;
    let mut attempt = 1;

    loop {
        match f().await {
            Err(e) if e.is_timeout() && attempt < attempts => {
                debug!(attempt, ?backoff, "query timed out, retrying");
                time::sleep(backoff).await;
                backoff *= 2;
                attempt += 1;
            }

            other => return other,
        }
    }
}
