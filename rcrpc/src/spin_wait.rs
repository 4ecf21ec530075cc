//! Blocking on a future without an OS wait primitive.
//!
//! [`block_until_complete`] polls the future on the calling thread. Between
//! polls it spins on a flag the future's waker sets, executing
//! [`std::hint::spin_loop`] instead of parking. This burns a core while
//! waiting and is meant for short bootstrap steps such as connecting from a
//! constructor.
//!
//! The future runs on the calling thread, so any I/O it awaits must be driven
//! elsewhere: call this from outside the runtime's worker threads, with the
//! runtime's context entered if the future spawns tasks.

use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Wake, Waker};

/// Waker that raises a flag.
struct SpinFlag {
    ready: AtomicBool,
}

impl Wake for SpinFlag {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.ready.store(true, Ordering::Release);
    }
}

/// State of the awaited operation after one poll.
enum Outcome<T> {
    Pending,
    Ready(T),
    Panicked(Box<dyn Any + Send + 'static>),
}

fn poll_once<F: Future>(fut: std::pin::Pin<&mut F>, cx: &mut Context<'_>) -> Outcome<F::Output> {
    match panic::catch_unwind(AssertUnwindSafe(|| fut.poll(cx))) {
        Ok(Poll::Ready(value)) => Outcome::Ready(value),
        Ok(Poll::Pending) => Outcome::Pending,
        Err(payload) => Outcome::Panicked(payload),
    }
}

/// Drive `fut` to completion on this thread, spinning between polls.
///
/// Returns the output unchanged, whether it is a value, a reference or `()`.
/// A panic inside the future is resumed on the caller with its original
/// payload.
pub fn block_until_complete<F: Future>(fut: F) -> F::Output {
    let flag = Arc::new(SpinFlag {
        ready: AtomicBool::new(true),
    });
    let waker = Waker::from(Arc::clone(&flag));
    let mut cx = Context::from_waker(&waker);
    let mut fut = pin!(fut);

    loop {
        if !flag.ready.swap(false, Ordering::Acquire) {
            std::hint::spin_loop();
            continue;
        }
        match poll_once(fut.as_mut(), &mut cx) {
            Outcome::Pending => {}
            Outcome::Ready(value) => return value,
            Outcome::Panicked(payload) => panic::resume_unwind(payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_value() {
        assert_eq!(block_until_complete(async { 42 }), 42);
    }

    #[test]
    fn test_reference_keeps_address() {
        let x = 7i32;
        let r = block_until_complete(async { &x });
        assert!(std::ptr::eq(r, &x));
    }

    #[test]
    fn test_owned_move() {
        let v = vec![1u8, 2, 3];
        let ptr = v.as_ptr();
        let out = block_until_complete(async move { v });
        assert_eq!(out.as_ptr(), ptr);
    }

    #[test]
    fn test_unit() {
        let () = block_until_complete(async {});
    }

    #[test]
    fn test_panic_payload_preserved() {
        let err = panic::catch_unwind(|| {
            block_until_complete(async {
                panic!("boom");
            })
        })
        .unwrap_err();
        assert_eq!(err.downcast_ref::<&str>(), Some(&"boom"));
    }

    #[test]
    fn test_woken_from_another_thread() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_time()
            .build()
            .unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        rt.spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(99u32);
        });
        assert_eq!(block_until_complete(rx).unwrap(), 99);
    }
}
