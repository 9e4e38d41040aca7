//! One-shot completion slot whose continuation runs on the completing thread.
//!
//! A [`Completer`] and a [`Deferred`] share a slot. Whichever side arrives second runs the
//! continuation: if the value is already there when [`Deferred::on_complete`] is called the
//! callback runs inline, otherwise it is stored and later run by [`Completer::complete`] on
//! whatever thread completes the operation. Dropping a `Completer` without completing it
//! resolves the slot with [`Canceled`].

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Canceled;

impl fmt::Display for Canceled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "deferred operation canceled")
    }
}

impl std::error::Error for Canceled {}

type Continuation<T> = Box<dyn FnOnce(Result<T, Canceled>) + Send + 'static>;

enum State<T> {
    Empty,
    Ready(Result<T, Canceled>),
    Waiting(Continuation<T>),
    Done,
}

struct Slot<T> {
    state: Mutex<State<T>>,
}

pub struct Completer<T> {
    slot: Option<Arc<Slot<T>>>,
}

pub struct Deferred<T> {
    slot: Arc<Slot<T>>,
}

/// Creates a connected completer/deferred pair.
pub fn deferred<T: Send + 'static>() -> (Completer<T>, Deferred<T>) {
    let slot = Arc::new(Slot { state: Mutex::new(State::Empty) });
    (Completer { slot: Some(slot.clone()) }, Deferred { slot })
}

impl<T> Slot<T> {
    fn resolve(&self, res: Result<T, Canceled>) {
        let waiting = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, State::Done) {
                State::Empty => {
                    *state = State::Ready(res);
                    return;
                }
                State::Waiting(f) => f,
                State::Ready(prev) => {
                    *state = State::Ready(prev);
                    return;
                }
                State::Done => return,
            }
        };
        waiting(res);
    }
}

impl<T> Completer<T> {
    #[inline]
    pub fn complete(mut self, v: T) {
        if let Some(slot) = self.slot.take() {
            slot.resolve(Ok(v));
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.resolve(Err(Canceled));
        }
    }
}

impl<T> fmt::Debug for Completer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Completer ...")
    }
}

impl<T> Deferred<T> {
    /// Registers the continuation. Runs it immediately if the result is already known.
    pub fn on_complete<F>(self, f: F)
    where
        F: FnOnce(Result<T, Canceled>) + Send + 'static,
    {
        let ready = {
            let mut state = self.slot.state.lock();
            match std::mem::replace(&mut *state, State::Done) {
                State::Empty => {
                    *state = State::Waiting(Box::new(f));
                    return;
                }
                State::Ready(res) => res,
                State::Waiting(prev) => {
                    *state = State::Waiting(prev);
                    return;
                }
                State::Done => return,
            }
        };
        f(ready)
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        matches!(*self.slot.state.lock(), State::Ready(_))
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Deferred ...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn test_completed_before_registration() {
        let (c, d) = deferred::<u32>();
        c.complete(7);
        assert!(d.is_ready());
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        d.on_complete(move |r| {
            assert_eq!(r, Ok(7));
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_completed_on_other_thread() {
        let (c, d) = deferred::<String>();
        let (tx, rx) = mpsc::channel();
        let main_id = std::thread::current().id();
        d.on_complete(move |r| {
            tx.send((r, std::thread::current().id())).unwrap();
        });
        std::thread::spawn(move || c.complete("done".into())).join().unwrap();
        let (r, tid) = rx.recv().unwrap();
        assert_eq!(r.unwrap(), "done");
        assert_ne!(tid, main_id);
    }

    #[test]
    fn test_dropped_completer_cancels() {
        let (c, d) = deferred::<u8>();
        drop(c);
        let (tx, rx) = mpsc::channel();
        d.on_complete(move |r| tx.send(r).unwrap());
        assert_eq!(rx.recv().unwrap(), Err(Canceled));
    }
}
