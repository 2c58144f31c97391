use std::fs;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Deserialize;

use crate::adapters::link::{DeviceLink, LinkError};

/// Scripted stand-in for the radio link: replays captured inbound chunks
/// (including deliberately torn lines) so the full pipeline can run without
/// hardware. Outbound commands are logged and discarded.
#[derive(Debug)]
pub struct ReplayFileLink {
    script: ReplayScript,
    state: Mutex<ReplayState>,
    closed: AtomicBool,
}

#[derive(Debug, Clone, Deserialize)]
struct ReplayScript {
    #[serde(default)]
    loop_forever: bool,
    chunks: Vec<ReplayChunk>,
}

#[derive(Debug, Clone, Deserialize)]
struct ReplayChunk {
    data: String,
    #[serde(default)]
    delay_ms: u64,
}

#[derive(Debug)]
struct ReplayState {
    chunk_index: usize,
    /// Unconsumed tail of the current chunk when the caller's buffer was
    /// smaller than the chunk.
    pending: Vec<u8>,
}

impl ReplayFileLink {
    pub fn from_file(path: &str) -> Result<Self, LinkError> {
        let content = fs::read_to_string(path)?;
        let script: ReplayScript = serde_json::from_str(&content)
            .map_err(|error| LinkError::InvalidScript(error.to_string()))?;

        Self::from_script(script)
    }

    fn from_script(script: ReplayScript) -> Result<Self, LinkError> {
        if script.chunks.is_empty() {
            return Err(LinkError::InvalidScript(
                "replay script must contain at least one chunk".to_string(),
            ));
        }

        Ok(Self {
            script,
            state: Mutex::new(ReplayState {
                chunk_index: 0,
                pending: Vec::new(),
            }),
            closed: AtomicBool::new(false),
        })
    }

    #[cfg(test)]
    fn from_json(json: &str) -> Result<Self, LinkError> {
        let script: ReplayScript = serde_json::from_str(json)
            .map_err(|error| LinkError::InvalidScript(error.to_string()))?;
        Self::from_script(script)
    }
}

impl DeviceLink for ReplayFileLink {
    fn read_chunk(&self, buffer: &mut [u8]) -> std::io::Result<usize> {
        if self.closed.load(Ordering::Relaxed) {
            return Ok(0);
        }

        let (bytes, delay) = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| std::io::Error::other("replay state lock poisoned"))?;

            if state.pending.is_empty() {
                if state.chunk_index >= self.script.chunks.len() {
                    if !self.script.loop_forever {
                        return Ok(0);
                    }
                    state.chunk_index = 0;
                }
                let chunk = &self.script.chunks[state.chunk_index];
                state.chunk_index += 1;
                state.pending = chunk.data.as_bytes().to_vec();
                (take_front(&mut state.pending, buffer.len()), chunk.delay_ms)
            } else {
                (take_front(&mut state.pending, buffer.len()), 0)
            }
        };

        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }

        buffer[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }

    fn write_all(&self, bytes: &[u8]) -> std::io::Result<()> {
        tracing::debug!(
            command = %String::from_utf8_lossy(bytes).trim_end(),
            "replay link discarding outbound command"
        );
        Ok(())
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

fn take_front(pending: &mut Vec<u8>, max: usize) -> Vec<u8> {
    let take = pending.len().min(max);
    pending.drain(..take).collect()
}
