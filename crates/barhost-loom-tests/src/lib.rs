//! Loom tests for the barhost handoff protocol.
//!
//! These mirror the bracket used for widget contexts, the barlib lock and
//! the lazily created shared context, and check them under all thread
//! interleavings with the loom model checker.
//!
//! Run with:
//! ```sh
//! RUSTFLAGS="--cfg loom" cargo test -p barhost-loom-tests --release
//! ```
//!
//! For faster iteration with bounded preemptions:
//! ```sh
//! LOOM_MAX_PREEMPTIONS=2 RUSTFLAGS="--cfg loom" cargo test -p barhost-loom-tests --release
//! ```

#[cfg(loom)]
mod tests {
    use loom::cell::UnsafeCell;
    use loom::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use loom::sync::{Arc, Mutex};
    use loom::thread;

    // =========================================================================
    // Handoff - mirrors barhost's handoff::Exclusive under loom
    // =========================================================================

    const NOBODY: u64 = 0;

    #[derive(Debug, PartialEq)]
    enum HandoffError {
        Reentrant,
        NotHeld,
    }

    /// Exclusive access opened and closed by separate calls. Threads are
    /// identified by an explicit token instead of a thread-local.
    struct Handoff<T> {
        locked: AtomicBool,
        holder: AtomicU64,
        value: UnsafeCell<T>,
    }

    unsafe impl<T: Send> Sync for Handoff<T> {}

    impl<T> Handoff<T> {
        fn new(value: T) -> Self {
            Self {
                locked: AtomicBool::new(false),
                holder: AtomicU64::new(NOBODY),
                value: UnsafeCell::new(value),
            }
        }

        fn enter(&self, me: u64) -> Result<(), HandoffError> {
            if self.holder.load(Ordering::Relaxed) == me {
                return Err(HandoffError::Reentrant);
            }
            while self
                .locked
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                thread::yield_now();
            }
            self.holder.store(me, Ordering::Relaxed);
            Ok(())
        }

        fn leave(&self, me: u64) -> Result<(), HandoffError> {
            if self.holder.load(Ordering::Relaxed) != me {
                return Err(HandoffError::NotHeld);
            }
            self.holder.store(NOBODY, Ordering::Relaxed);
            self.locked.store(false, Ordering::Release);
            Ok(())
        }

        /// Access the value; the caller must hold the bracket.
        fn held<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
            self.value.with_mut(|p| f(unsafe { &mut *p }))
        }

        fn with<R>(&self, me: u64, f: impl FnOnce(&mut T) -> R) -> Result<R, HandoffError> {
            self.enter(me)?;
            let r = self.held(f);
            self.leave(me)?;
            Ok(r)
        }
    }

    /// A worker's handoff: begin, push, end.
    fn handoff(ctx: &Handoff<Vec<u32>>, me: u64, value: u32) {
        ctx.enter(me).unwrap();
        ctx.held(|stack| {
            assert!(stack.is_empty(), "stack must be empty at call_begin");
            stack.push(value);
        });
        ctx.held(|stack| {
            assert_eq!(stack.len(), 1);
            stack.clear();
        });
        ctx.leave(me).unwrap();
    }

    // =========================================================================
    // Bracket tests
    // =========================================================================

    #[test]
    fn bracket_sequential() {
        loom::model(|| {
            let ctx = Handoff::new(0u32);
            ctx.with(1, |n| *n += 1).unwrap();
            ctx.with(1, |n| *n += 1).unwrap();
            assert_eq!(ctx.with(1, |n| *n).unwrap(), 2);
        });
    }

    #[test]
    fn bracket_reentry_refused() {
        loom::model(|| {
            let ctx = Handoff::new(());
            ctx.enter(1).unwrap();
            assert_eq!(ctx.enter(1), Err(HandoffError::Reentrant));
            ctx.leave(1).unwrap();
            ctx.enter(1).unwrap();
            ctx.leave(1).unwrap();
        });
    }

    #[test]
    fn bracket_leave_by_other_thread_refused() {
        loom::model(|| {
            let ctx = Arc::new(Handoff::new(()));
            ctx.enter(1).unwrap();

            let ctx2 = ctx.clone();
            let h = thread::spawn(move || ctx2.leave(2));
            assert_eq!(h.join().unwrap(), Err(HandoffError::NotHeld));

            ctx.leave(1).unwrap();
        });
    }

    #[test]
    fn brackets_never_interleave() {
        loom::model(|| {
            let ctx = Arc::new(Handoff::new(Vec::new()));
            let ctx2 = ctx.clone();

            let h = thread::spawn(move || handoff(&ctx2, 2, 20));
            handoff(&ctx, 1, 10);
            h.join().unwrap();

            assert!(ctx.with(1, |stack| stack.is_empty()).unwrap());
        });
    }

    #[test]
    fn event_watcher_and_worker_share_context() {
        loom::model(|| {
            // Widget context; the value is (stack, events seen).
            let ctx = Arc::new(Handoff::new((Vec::<u32>::new(), 0u32)));

            let worker_ctx = ctx.clone();
            let worker = thread::spawn(move || {
                worker_ctx.enter(2).unwrap();
                worker_ctx.held(|(stack, _)| {
                    assert!(stack.is_empty());
                    stack.push(1);
                });
                worker_ctx.held(|(stack, _)| stack.clear());
                worker_ctx.leave(2).unwrap();
            });

            // Event watcher thread.
            ctx.enter(1).unwrap();
            ctx.held(|(stack, events)| {
                assert!(stack.is_empty());
                stack.push(7);
                *events += 1;
                stack.clear();
            });
            ctx.leave(1).unwrap();

            worker.join().unwrap();
            assert_eq!(ctx.with(1, |(stack, events)| (stack.len(), *events)).unwrap(), (0, 1));
        });
    }

    // =========================================================================
    // Lock ordering: widget context, then barlib
    // =========================================================================

    #[test]
    fn widget_then_bar_does_not_deadlock() {
        loom::model(|| {
            let w1 = Arc::new(Handoff::new(Vec::<u32>::new()));
            let w2 = Arc::new(Handoff::new(Vec::<u32>::new()));
            let bar = Arc::new(Mutex::new(Vec::<(usize, u32)>::new()));

            let (w2c, bar2) = (w2.clone(), bar.clone());
            let h = thread::spawn(move || {
                w2c.enter(2).unwrap();
                w2c.held(|s| s.push(20));
                let v = w2c.held(|s| s.pop().unwrap());
                bar2.lock().unwrap().push((1, v));
                w2c.leave(2).unwrap();
            });

            w1.enter(1).unwrap();
            w1.held(|s| s.push(10));
            let v = w1.held(|s| s.pop().unwrap());
            bar.lock().unwrap().push((0, v));
            w1.leave(1).unwrap();

            h.join().unwrap();

            let mut rendered = bar.lock().unwrap().clone();
            rendered.sort();
            assert_eq!(rendered, vec![(0, 10), (1, 20)]);
        });
    }

    #[test]
    fn event_error_takes_bar_inside_widget_bracket() {
        loom::model(|| {
            let w = Arc::new(Handoff::new(()));
            let bar = Arc::new(Mutex::new(Vec::<&'static str>::new()));

            // Worker: value rendered under the widget bracket.
            let (wc, barc) = (w.clone(), bar.clone());
            let h = thread::spawn(move || {
                wc.enter(2).unwrap();
                barc.lock().unwrap().push("value");
                wc.leave(2).unwrap();
            });

            // Event watcher: failing handler sets an error, same order.
            w.enter(1).unwrap();
            bar.lock().unwrap().push("error");
            w.leave(1).unwrap();

            h.join().unwrap();
            assert_eq!(bar.lock().unwrap().len(), 2);
        });
    }

    // =========================================================================
    // Lazy shared context
    // =========================================================================

    /// Mirrors `shared_context`: racing callers may each build a state, only
    /// one is kept and every caller sees that one.
    struct Lazy {
        slot: Mutex<Option<usize>>,
        built: AtomicUsize,
    }

    impl Lazy {
        fn new() -> Self {
            Self {
                slot: Mutex::new(None),
                built: AtomicUsize::new(0),
            }
        }

        fn get(&self) -> usize {
            if let Some(v) = *self.slot.lock().unwrap() {
                return v;
            }
            let candidate = self.built.fetch_add(1, Ordering::SeqCst) + 1;
            let mut slot = self.slot.lock().unwrap();
            *slot.get_or_insert(candidate)
        }
    }

    #[test]
    fn shared_context_init_is_idempotent() {
        loom::model(|| {
            let lazy = Arc::new(Lazy::new());
            let lazy2 = lazy.clone();

            let h = thread::spawn(move || lazy2.get());
            let mine = lazy.get();
            let theirs = h.join().unwrap();

            assert_eq!(mine, theirs);
            assert_eq!(lazy.get(), mine);
            assert!(lazy.built.load(Ordering::SeqCst) <= 2);
        });
    }
}
