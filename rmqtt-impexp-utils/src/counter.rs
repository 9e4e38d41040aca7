use std::fmt;
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};

type Current = AtomicIsize;
type Max = AtomicIsize;

/// Current/peak pair, used for the number of active requests.
pub struct Counter(Current, Max);

impl Clone for Counter {
    fn clone(&self) -> Self {
        Counter(AtomicIsize::new(self.0.load(Ordering::SeqCst)), AtomicIsize::new(self.1.load(Ordering::SeqCst)))
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, r#"{{ "count":{}, "max":{} }}"#, self.count(), self.max())
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

impl Counter {
    #[inline]
    pub fn new() -> Self {
        Counter(AtomicIsize::new(0), AtomicIsize::new(0))
    }

    #[inline]
    pub fn inc(&self) -> isize {
        self.incs(1)
    }

    /// Returns the new current value.
    #[inline]
    pub fn incs(&self, c: isize) -> isize {
        let prev = self.0.fetch_add(c, Ordering::SeqCst);
        self.1.fetch_max(prev + c, Ordering::SeqCst);
        prev + c
    }

    #[inline]
    pub fn dec(&self) -> isize {
        self.decs(1)
    }

    #[inline]
    pub fn decs(&self, c: isize) -> isize {
        self.0.fetch_sub(c, Ordering::SeqCst) - c
    }

    #[inline]
    pub fn count(&self) -> isize {
        self.0.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn max(&self) -> isize {
        self.1.load(Ordering::SeqCst)
    }
}

/// Outstanding-task counter with "last one out" hand-off.
///
/// The driver of a piece of work holds one implicit unit, so a fresh counter starts at 1.
/// Every asynchronous task registers with [`TaskCounter::start`] and deregisters with
/// [`TaskCounter::finish`]. The driver gives up its own unit with `finish` as well when it
/// has to stop. Whichever call takes the count to zero returns `true`: that caller is now the
/// only party still running and becomes the new driver. The counter is re-armed to 1 on its
/// behalf before `finish` returns.
pub struct TaskCounter(AtomicUsize);

impl Default for TaskCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaskCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskCounter({})", self.outstanding())
    }
}

impl TaskCounter {
    #[inline]
    pub fn new() -> Self {
        TaskCounter(AtomicUsize::new(1))
    }

    #[inline]
    pub fn start(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns `true` when the caller was the last one out and now drives the work.
    #[inline]
    pub fn finish(&self) -> bool {
        let prev = self.0.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "TaskCounter finished more often than started");
        if prev == 1 {
            self.0.fetch_add(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    /// Number of outstanding units, including the driver's own.
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counter_tracks_peak() {
        let c = Counter::new();
        assert_eq!(c.inc(), 1);
        assert_eq!(c.inc(), 2);
        assert_eq!(c.dec(), 1);
        assert_eq!(c.count(), 1);
        assert_eq!(c.max(), 2);
        println!("{:?}", c);
    }

    #[test]
    fn test_task_counter_last_out() {
        let tc = TaskCounter::new();
        tc.start();
        tc.start();
        assert_eq!(tc.outstanding(), 3);
        //driver steps aside
        assert!(!tc.finish());
        assert!(!tc.finish());
        //last task takes over, counter re-armed
        assert!(tc.finish());
        assert_eq!(tc.outstanding(), 1);
        //a lone driver is always last out
        assert!(tc.finish());
        assert_eq!(tc.outstanding(), 1);
    }

    #[test]
    fn test_task_counter_exactly_one_resumer() {
        for _ in 0..50 {
            let tc = Arc::new(TaskCounter::new());
            let n = 16;
            for _ in 0..n {
                tc.start();
            }
            let mut handles = Vec::new();
            for _ in 0..n {
                let tc = tc.clone();
                handles.push(std::thread::spawn(move || tc.finish()));
            }
            let driver = tc.finish();
            let resumers = handles.into_iter().map(|h| h.join().unwrap()).filter(|r| *r).count()
                + usize::from(driver);
            assert_eq!(resumers, 1);
            assert_eq!(tc.outstanding(), 1);
        }
    }
}
