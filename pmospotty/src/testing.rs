//! Décodeur factice pour les tests : PCM déterministe en mémoire.

use crate::decoder::{DecodeRequest, DecoderLauncher, DecoderProcess, ProcessControl};
use crate::error::{Result, SpottyError};
use crate::wav::BYTES_PER_SECOND;
use pmoutils::Termination;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Octet PCM à la position `offset` du flux décodé
pub fn pcm_byte(offset: u64) -> u8 {
    (offset % 251) as u8
}

#[derive(Default)]
pub struct FakeLauncher {
    requests: Mutex<Vec<DecodeRequest>>,
    spawns: AtomicUsize,
    terminations: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
    fail: AtomicBool,
    pcm_len: Mutex<Option<u64>>,
    stall_after: Mutex<Option<u64>>,
    terminate_delay: Mutex<Duration>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limite la longueur du PCM produit (fin de flux anticipée)
    pub fn with_pcm_len(self, len: u64) -> Self {
        *self.pcm_len.lock().unwrap() = Some(len);
        self
    }

    /// Le décodeur se bloque après `len` octets, jusqu'à son arrêt
    pub fn with_stall_after(self, len: u64) -> Self {
        *self.stall_after.lock().unwrap() = Some(len);
        self
    }

    /// Durée d'un arrêt, comme le délai de grâce d'un vrai processus
    pub fn with_terminate_delay(self, delay: Duration) -> Self {
        *self.terminate_delay.lock().unwrap() = delay;
        self
    }

    pub fn pcm_range(offset: u64, len: u64) -> Vec<u8> {
        (offset..offset + len).map(pcm_byte).collect()
    }

    pub fn fail_spawns(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<DecodeRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    /// Nombre de décodeurs arrêtés alors qu'ils tournaient encore
    pub fn terminate_count(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl DecoderLauncher for FakeLauncher {
    fn launch(&self, request: &DecodeRequest) -> Result<DecoderProcess> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SpottyError::Spawn {
                binary: "fake-spotty".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
            });
        }

        self.requests.lock().unwrap().push(request.clone());
        let pid = self.spawns.fetch_add(1, Ordering::SeqCst) as u32 + 1;
        self.live.fetch_add(1, Ordering::SeqCst);

        let start = request.start_second * BYTES_PER_SECOND;
        let end = self.pcm_len.lock().unwrap().unwrap_or(u64::MAX);
        let stall_at = self
            .stall_after
            .lock()
            .unwrap()
            .map(|len| start.saturating_add(len));
        let control = Arc::new(FakeControl {
            pid,
            delay: *self.terminate_delay.lock().unwrap(),
            stopped: AtomicBool::new(false),
            terminations: self.terminations.clone(),
            live: self.live.clone(),
        });
        let reader = FakeReader {
            position: start,
            end,
            stall_at,
            control: control.clone(),
        };
        Ok(DecoderProcess::new(Box::new(reader), control))
    }
}

struct FakeControl {
    pid: u32,
    delay: Duration,
    stopped: AtomicBool,
    terminations: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
}

impl ProcessControl for FakeControl {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn terminate(&self) -> Termination {
        if self.stopped.load(Ordering::SeqCst) {
            return Termination::AlreadyStopped;
        }
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Termination::AlreadyStopped;
        }
        self.terminations.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_sub(1, Ordering::SeqCst);
        Termination::Terminated
    }
}

struct FakeReader {
    position: u64,
    end: u64,
    stall_at: Option<u64>,
    control: Arc<FakeControl>,
}

impl Read for FakeReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.stall_at.is_some_and(|at| self.position >= at) {
            while !self.control.stopped.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
        }
        if self.control.stopped.load(Ordering::SeqCst) || self.position >= self.end {
            return Ok(0);
        }
        // Lectures courtes, comme sur un vrai pipe
        let limit = self.stall_at.unwrap_or(u64::MAX).max(self.position + 1).min(self.end);
        let n = buf.len().min(65_536).min((limit - self.position) as usize);
        for (i, b) in buf[..n].iter_mut().enumerate() {
            *b = pcm_byte(self.position + i as u64);
        }
        self.position += n as u64;
        Ok(n)
    }
}
