use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::{fmt, io, thread};

use parking_lot::Mutex;

use rmqtt_impexp_conf::Stop;
use rmqtt_impexp_utils::Counter;

use crate::status::StatusFile;
use crate::types::RequestId;
use crate::{ImpexpError, Result};

const MAX_ID_COLLISIONS: usize = 1000;

/// Admission control and request id allocation shared by exports and imports.
#[derive(Clone)]
pub struct ImpexpManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    stopped: Mutex<bool>,
    active: Counter,
    next_id: AtomicU64,
    max_active: usize,
    stop: Stop,
}

impl fmt::Debug for ImpexpManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ImpexpManager {{ active: {:?}, max_active: {}, stopped: {} }}",
            self.inner.active,
            self.inner.max_active,
            self.is_stopped()
        )
    }
}

impl ImpexpManager {
    pub fn new(max_active: usize, stop: Stop) -> Self {
        let seed = rand::random::<u32>() as u64;
        ImpexpManager {
            inner: Arc::new(ManagerInner {
                stopped: Mutex::new(false),
                active: Counter::new(),
                next_id: AtomicU64::new(seed),
                max_active,
                stop,
            }),
        }
    }

    /// Takes an active-request slot. The slot is given back when the returned [`Admission`]
    /// is dropped.
    pub fn admit(&self) -> Result<Admission> {
        let stopped = self.inner.stopped.lock();
        if *stopped {
            return Err(ImpexpError::InvalidOperation);
        }
        if self.inner.active.count() >= self.inner.max_active as isize {
            return Err(ImpexpError::TooManyActiveRequests);
        }
        self.inner.active.inc();
        Ok(Admission { inner: self.inner.clone() })
    }

    #[inline]
    pub fn active(&self) -> isize {
        self.inner.active.count()
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        *self.inner.stopped.lock()
    }

    fn next_request_id(&self) -> RequestId {
        loop {
            let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    /// Allocates a request id together with its status file in `dir`. Ids whose status file
    /// already exists are skipped.
    pub fn allocate(&self, dir: &Path, prefix: &str) -> Result<(RequestId, StatusFile)> {
        std::fs::create_dir_all(dir)?;
        for _ in 0..MAX_ID_COLLISIONS {
            let id = self.next_request_id();
            match StatusFile::create(dir, prefix, id) {
                Ok(sf) => return Ok((id, sf)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(ImpexpError::AllocateError)
    }

    /// Stops accepting requests, then waits for the active ones to finish.
    pub fn stop(&self) {
        *self.inner.stopped.lock() = true;
        let mut loops = 0u32;
        while self.inner.active.count() > 0 {
            if loops == 0 {
                log::info!("waiting for {} active export/import requests", self.inner.active.count());
            }
            thread::sleep(self.inner.stop.pause(loops));
            loops = loops.saturating_add(1);
        }
        log::info!("export/import stopped");
    }
}

/// An active-request slot.
pub struct Admission {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for Admission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Admission")
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.inner.active.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn manager(max: usize) -> ImpexpManager {
        let stop = Stop {
            initial_pause: Duration::from_millis(1),
            medium_pause: Duration::from_millis(2),
            medium_after: 5,
            long_pause: Duration::from_millis(5),
            long_after: 10,
        };
        ImpexpManager::new(max, stop)
    }

    #[test]
    fn test_admission_limit() {
        let m = manager(2);
        let a1 = m.admit().unwrap();
        let _a2 = m.admit().unwrap();
        assert_eq!(m.admit().unwrap_err(), ImpexpError::TooManyActiveRequests);
        assert_eq!(m.active(), 2);
        drop(a1);
        assert_eq!(m.active(), 1);
        let _a3 = m.admit().unwrap();
        assert_eq!(m.active(), 2);
    }

    #[test]
    fn test_stop_waits_for_active() {
        let m = manager(4);
        let a = m.admit().unwrap();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            drop(a);
        });
        m.stop();
        assert_eq!(m.active(), 0);
        assert_eq!(m.admit().unwrap_err(), ImpexpError::InvalidOperation);
        handle.join().unwrap();
    }

    #[test]
    fn test_allocate_skips_existing_status_files() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(1);
        let (id1, sf1) = m.allocate(dir.path(), "impexp_").unwrap();
        assert_ne!(id1, 0);
        assert!(sf1.path().exists());
        //occupy the next id
        StatusFile::create(dir.path(), "impexp_", id1.wrapping_add(1).max(1)).unwrap();
        let (id2, _sf2) = m.allocate(dir.path(), "impexp_").unwrap();
        assert_ne!(id2, id1);
        assert_ne!(id2, id1.wrapping_add(1).max(1));
    }
}
