use std::path::Path;
use std::sync::{Arc, Mutex};
use tftp_transfer::FileBuffer;

/// Keep at most this many idle file views around.
const MAX_IDLE: usize = 16;

/// Idle read views kept between transfers, so a file that is requested
/// over and over (the PXE boot case) isn't reopened every time.
#[derive(Clone, Debug, Default)]
pub struct BufferPool {
    idle: Arc<Mutex<Vec<FileBuffer>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes an idle view backed by exactly `path`, already rewound.
    pub fn check_out(&self, path: &Path) -> Option<FileBuffer> {
        let mut idle = self.idle.lock().unwrap();
        let pos = idle.iter().position(|buffer| buffer.matches(path))?;
        Some(idle.remove(pos))
    }

    /// Returns a view after a completed transfer. The view is rewound and
    /// its replay buffer cleared before anyone can reuse it; a view that
    /// can't rewind is dropped instead.
    pub fn check_in(&self, mut buffer: FileBuffer) {
        if buffer.rewind().is_err() {
            return;
        }
        let mut idle = self.idle.lock().unwrap();
        if idle.len() >= MAX_IDLE {
            idle.remove(0);
        }
        idle.push(buffer);
    }
}
