//! Panic interception.
//!
//! By the time `catch_unwind` hands back a panic payload the panicking frames
//! are gone, so the stack has to be recorded from inside the panic hook. The
//! hook installed here only does that for threads that are currently inside
//! an [`Interception`] scope; every other panic goes to the previously
//! installed hook untouched.

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::panic;
use std::sync::Once;

use backtrace::Backtrace;

/// What the hook saw of a panic raised inside an interception scope.
#[derive(Debug)]
pub struct CapturedPanic {
    /// Unresolved; resolving is left to whoever reports the panic.
    pub trace: Backtrace,
    pub location: Option<String>,
}

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
    static LAST: RefCell<Option<CapturedPanic>> = const { RefCell::new(None) };
}

static INSTALL: Once = Once::new();

/// Installs the intercepting hook in front of the current one. Idempotent.
pub fn install() {
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if !is_intercepting() {
                previous(info);
                return;
            }

            let captured = CapturedPanic {
                trace: Backtrace::new_unresolved(),
                location: info.location().map(ToString::to_string),
            };
            let _ = LAST.try_with(|slot| {
                if let Ok(mut slot) = slot.try_borrow_mut() {
                    *slot = Some(captured);
                }
            });
        }));
        tracing::debug!("panic interception hook installed");
    });
}

/// Removes and returns the last panic captured on this thread.
pub fn take() -> Option<CapturedPanic> {
    LAST.try_with(|slot| slot.try_borrow_mut().ok().and_then(|mut slot| slot.take()))
        .ok()
        .flatten()
}

pub fn is_intercepting() -> bool {
    DEPTH.try_with(|depth| depth.get() > 0).unwrap_or(false)
}

/// Marks the current thread as intercepting panics until dropped.
///
/// Scopes nest. The scope is released on every exit path, unwinding included.
/// It is tied to the thread it was created on and must not be held across an
/// `.await`.
#[must_use = "interception ends when the scope is dropped"]
pub struct Interception {
    _thread_bound: PhantomData<*const ()>,
}

impl Interception {
    /// Entering the outermost scope discards whatever an earlier scope on
    /// this thread captured and nobody took.
    pub fn enter() -> Self {
        let outermost = DEPTH.with(|depth| {
            let prev = depth.get();
            depth.set(prev + 1);
            prev == 0
        });
        if outermost {
            let _ = take();
        }
        Self {
            _thread_bound: PhantomData,
        }
    }
}

impl Drop for Interception {
    fn drop(&mut self) {
        let _ = DEPTH.try_with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn explode(msg: &str) {
        panic!("{msg}");
    }

    #[test]
    fn captures_inside_scope() {
        install();
        let _ = take();

        let result = panic::catch_unwind(|| {
            let _scope = Interception::enter();
            explode("boom");
        });
        assert!(result.is_err());
        assert!(!is_intercepting());

        let captured = take().expect("panic captured");
        let location = captured.location.expect("location recorded");
        assert!(location.contains("hook.rs"), "{location}");
        assert!(take().is_none());
    }

    #[test]
    fn ignores_panics_outside_scope() {
        install();
        let _ = take();

        let result = panic::catch_unwind(|| explode("not intercepted"));
        assert!(result.is_err());
        assert!(take().is_none());
    }

    #[test]
    fn outermost_scope_discards_untaken_capture() {
        install();
        let _ = take();

        let handled = panic::catch_unwind(|| {
            let _scope = Interception::enter();
            explode("handled and forgotten");
        });
        assert!(handled.is_err());

        let scope = Interception::enter();
        assert!(take().is_none());
        drop(scope);
    }

    #[test]
    fn nested_scope_keeps_capture() {
        install();
        let _ = take();

        let _outer = Interception::enter();
        let result = panic::catch_unwind(|| explode("inner"));
        assert!(result.is_err());

        let _inner = Interception::enter();
        assert!(take().is_some());
    }

    #[test]
    fn scopes_nest() {
        assert!(!is_intercepting());
        let outer = Interception::enter();
        {
            let _inner = Interception::enter();
            assert!(is_intercepting());
        }
        assert!(is_intercepting());
        drop(outer);
        assert!(!is_intercepting());
    }

    #[test]
    fn scope_is_per_thread() {
        let _scope = Interception::enter();
        let other = std::thread::spawn(is_intercepting).join().unwrap();
        assert!(!other);
    }
}
