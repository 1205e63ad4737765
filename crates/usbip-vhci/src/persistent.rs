//! Persistent-device replay.
//!
//! A registry-like store holds one `host,service,busid` line per device that
//! should be re-attached on startup. Replay runs on a worker task and retries
//! in rounds with a widening delay; a server refusal that can never succeed
//! drops the line instead of retrying it forever.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::device::Location;
use crate::vhci::Vhci;

/// Narrow interface over the persistent-device registry.
pub trait PersistentStore: Send + Sync {
    fn read(&self) -> std::io::Result<Vec<String>>;
    fn write(&self, lines: &[String]) -> std::io::Result<()>;
}

/// In-memory store, for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryStore {
    lines: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: Mutex::new(lines.into_iter().map(Into::into).collect()),
        }
    }
}

impl PersistentStore for MemoryStore {
    fn read(&self) -> std::io::Result<Vec<String>> {
        Ok(self.lines.lock().unwrap().clone())
    }

    fn write(&self, lines: &[String]) -> std::io::Result<()> {
        *self.lines.lock().unwrap() = lines.to_vec();
        Ok(())
    }
}

/// Parse one persistent record. Malformed lines yield `None` and are
/// silently dropped by the caller.
pub(crate) fn parse_line(line: &str) -> Option<Location> {
    let (host, rest) = line.split_once(',')?;
    let (service, busid) = rest.split_once(',')?;
    if host.is_empty() || service.is_empty() || busid.is_empty() {
        return None;
    }
    Some(Location {
        host: host.to_owned(),
        service: service.to_owned(),
        busid: busid.to_owned(),
    })
}

/// Delay before retry round `attempt` (1-based) with `line_count` records:
/// the first two rounds run immediately, after that the delay widens with
/// the attempt number and is capped at half an hour.
pub(crate) fn replay_delay(attempt: u32, line_count: u32) -> Duration {
    const UNIT_SECS: u64 = 10;
    const MAX_DELAY_SECS: u64 = 30 * 60;

    if attempt <= 2 {
        return Duration::ZERO;
    }
    let secs = (UNIT_SECS * u64::from(attempt)) / u64::from(line_count.max(1));
    Duration::from_secs(secs.min(MAX_DELAY_SECS))
}

impl Vhci {
    /// Replace the persistent-device records.
    pub fn set_persistent(
        &self,
        store: &dyn PersistentStore,
        lines: &[String],
    ) -> std::io::Result<()> {
        store.write(lines)
    }

    /// Read back the persistent-device records.
    pub fn get_persistent(&self, store: &dyn PersistentStore) -> std::io::Result<Vec<String>> {
        store.read()
    }

    /// Re-attach every stored device on a worker task. Each round tries all
    /// remaining records once; success and non-retryable failures drop a
    /// record, transient failures keep it for the next round.
    pub fn spawn_persistent_replay(
        &self,
        store: Arc<dyn PersistentStore>,
    ) -> tokio::task::JoinHandle<()> {
        let vhci = self.clone();
        tokio::spawn(async move {
            let lines = match store.read() {
                Ok(lines) => lines,
                Err(err) => {
                    warn!(error = %err, "cannot read persistent devices");
                    return;
                }
            };

            let mut remaining: Vec<Location> = lines
                .iter()
                .filter(|line| !line.is_empty())
                .filter_map(|line| {
                    let parsed = parse_line(line);
                    if parsed.is_none() {
                        debug!(line = %line, "dropping malformed persistent record");
                    }
                    parsed
                })
                .collect();

            let line_count = remaining.len() as u32;
            if line_count == 0 {
                return;
            }
            info!(count = line_count, "replaying persistent devices");

            for attempt in 1.. {
                let delay = replay_delay(attempt, line_count);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }

                let mut next_round = Vec::new();
                for location in remaining {
                    match vhci.attach(location.clone()).await {
                        Ok(port) => {
                            info!(%location, port, "persistent device attached");
                        }
                        Err(err) if err.is_retryable() => {
                            debug!(%location, error = %err, attempt, "attach failed, will retry");
                            next_round.push(location);
                        }
                        Err(err) => {
                            warn!(%location, error = %err, "dropping persistent device");
                        }
                    }
                }

                remaining = next_round;
                if remaining.is_empty() {
                    break;
                }
            }
        })
    }
}
