//! Hardware driver seam.
//!
//! **Why**: Pushing pixels to a real panel can stall (USB hiccup, SPI
//! retry). The render tick must never block on that, so frames go to a
//! dedicated driver thread through a small bounded channel; when the device
//! falls behind, frames are dropped rather than queued up.
//!
//! **Used by**: Engine (one `present()` per tick). Driver failure is the one
//! fatal condition of the whole core — it trips a flag the runner observes.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Sender, TrySendError};
use log::{debug, error, trace};

use crate::frame::Frame;

/// Driver errors are fatal: the engine has nowhere to show pixels.
#[derive(Debug)]
pub struct DriverError(pub String);

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "driver error: {}", self.0)
    }
}

impl std::error::Error for DriverError {}

/// The external collaborator contract: accept one finished frame.
pub trait MatrixDriver: Send {
    fn name(&self) -> &str;
    fn present(&mut self, frame: &Frame) -> Result<(), DriverError>;
}

/// Discards frames; headless runs and tests.
pub struct NullDriver {
    presented: u64,
}

impl NullDriver {
    pub fn new() -> Self {
        Self { presented: 0 }
    }
}

impl Default for NullDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MatrixDriver for NullDriver {
    fn name(&self) -> &str {
        "null"
    }

    fn present(&mut self, _frame: &Frame) -> Result<(), DriverError> {
        self.presented += 1;
        if self.presented % 600 == 0 {
            trace!("NullDriver: {} frames presented", self.presented);
        }
        Ok(())
    }
}

/// Writes every Nth frame as a PNG; debugging without hardware.
pub struct PngDumpDriver {
    dir: PathBuf,
    every: u64,
    count: u64,
}

impl PngDumpDriver {
    pub fn new(dir: PathBuf, every: u64) -> Result<Self, DriverError> {
        std::fs::create_dir_all(&dir)
            .map_err(|e| DriverError(format!("create {}: {}", dir.display(), e)))?;
        Ok(Self { dir, every: every.max(1), count: 0 })
    }
}

impl MatrixDriver for PngDumpDriver {
    fn name(&self) -> &str {
        "png-dump"
    }

    fn present(&mut self, frame: &Frame) -> Result<(), DriverError> {
        self.count += 1;
        if self.count % self.every != 0 {
            return Ok(());
        }
        let path = self.dir.join(format!("frame_{:06}.png", self.count));
        frame
            .save_png(&path)
            .map_err(|e| DriverError(format!("{}: {}", path.display(), e)))
    }
}

/// Handle to the driver thread. The channel holds at most two frames; a
/// full channel means the device is behind and the newest frame is dropped.
pub struct DriverHandle {
    tx: Option<Sender<Frame>>,
    failed: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    handle: Option<thread::JoinHandle<()>>,
}

impl DriverHandle {
    pub fn spawn(mut driver: Box<dyn MatrixDriver>) -> Self {
        let (tx, rx) = bounded::<Frame>(2);
        let failed = Arc::new(AtomicBool::new(false));
        let failed_in = Arc::clone(&failed);

        let handle = thread::Builder::new()
            .name("marquee-driver".to_string())
            .spawn(move || {
                debug!("Driver thread started ({})", driver.name());
                for frame in rx {
                    if let Err(e) = driver.present(&frame) {
                        error!("Driver '{}' failed: {}", driver.name(), e);
                        failed_in.store(true, Ordering::SeqCst);
                        break;
                    }
                }
                debug!("Driver thread exiting");
            })
            .expect("Failed to spawn driver thread");

        Self {
            tx: Some(tx),
            failed,
            dropped: Arc::new(AtomicU64::new(0)),
            handle: Some(handle),
        }
    }

    /// Hand a frame off without blocking. Returns false when the frame was
    /// dropped because the device is behind.
    pub fn present(&self, frame: Frame) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if total % 100 == 1 {
                    debug!("Driver behind, {} frame(s) dropped so far", total);
                }
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// True once the driver reported a fatal error.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Close the channel and wait for the thread to flush.
    pub fn shutdown(mut self) {
        self.tx.take(); // disconnects, loop ends
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DriverHandle {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    struct RecordingDriver {
        frames: Arc<Mutex<Vec<u32>>>,
    }

    impl MatrixDriver for RecordingDriver {
        fn name(&self) -> &str {
            "recording"
        }
        fn present(&mut self, frame: &Frame) -> Result<(), DriverError> {
            self.frames.lock().unwrap().push(frame.width());
            Ok(())
        }
    }

    struct BrokenDriver;

    impl MatrixDriver for BrokenDriver {
        fn name(&self) -> &str {
            "broken"
        }
        fn present(&mut self, _frame: &Frame) -> Result<(), DriverError> {
            Err(DriverError("device gone".into()))
        }
    }

    #[test]
    fn test_frames_reach_driver_thread() {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let handle = DriverHandle::spawn(Box::new(RecordingDriver {
            frames: Arc::clone(&frames),
        }));

        assert!(handle.present(Frame::new(8, 4)));
        assert!(handle.present(Frame::new(16, 4)));
        handle.shutdown();

        assert_eq!(*frames.lock().unwrap(), vec![8, 16]);
    }

    #[test]
    fn test_failed_flag_set_on_driver_error() {
        let handle = DriverHandle::spawn(Box::new(BrokenDriver));
        handle.present(Frame::new(8, 4));

        // The driver thread flips the flag asynchronously
        for _ in 0..200 {
            if handle.is_failed() {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        assert!(handle.is_failed());
    }

    #[test]
    fn test_png_dump_writes_every_nth() {
        let dir = std::env::temp_dir().join(format!("marquee_dump_{}", uuid::Uuid::new_v4()));
        let mut driver = PngDumpDriver::new(dir.clone(), 2).unwrap();

        for _ in 0..4 {
            driver.present(&Frame::new(4, 4)).unwrap();
        }
        let dumped = std::fs::read_dir(&dir).unwrap().count();
        assert_eq!(dumped, 2);
        let _ = std::fs::remove_dir_all(dir);
    }
}
