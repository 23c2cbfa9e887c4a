//! Platform services on top of `std`.

use std::cell::Cell;
use std::io;
use std::sync::OnceLock;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use apptrace::Platform;

/// Process-wide clock origin, fixed by the first reading
static EPOCH: OnceLock<Instant> = OnceLock::new();

thread_local! {
    static CORE_ID: Cell<usize> = const { Cell::new(0) };
    static IN_ISR: Cell<bool> = const { Cell::new(false) };
}

/// [`Platform`] for hosted builds.
///
/// Every thread belongs to a simulated core, core 0 unless it was started
/// with [`spawn_pinned`]. Code run through [`run_as_isr`] reports
/// interrupt context.
#[derive(Debug, Clone, Copy, Default)]
pub struct PosixPlatform;

impl PosixPlatform {
    pub const fn new() -> Self {
        Self
    }
}

impl Platform for PosixPlatform {
    fn now_us(&self) -> u64 {
        let epoch = EPOCH.get_or_init(Instant::now);
        u64::try_from(epoch.elapsed().as_micros()).unwrap_or(u64::MAX)
    }

    fn core_id(&self) -> usize {
        current_core()
    }

    fn in_isr(&self) -> bool {
        IN_ISR.with(Cell::get)
    }

    fn delay_us(&self, us: u32) {
        thread::sleep(Duration::from_micros(u64::from(us)));
    }

    fn yield_now(&self) {
        thread::yield_now();
    }
}

/// Simulated core of the calling thread
pub fn current_core() -> usize {
    CORE_ID.with(Cell::get)
}

/// Start a task pinned to simulated core `core`
pub fn spawn_pinned<F, T>(core: usize, name: &str, f: F) -> io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    thread::Builder::new().name(name.to_owned()).spawn(move || {
        CORE_ID.with(|id| id.set(core));
        log::trace!("task {:?} pinned to core {}", thread::current().name(), core);
        f()
    })
}

/// Run `f` as an interrupt handler of the calling core
pub fn run_as_isr<R>(f: impl FnOnce() -> R) -> R {
    struct Restore(bool);

    impl Drop for Restore {
        fn drop(&mut self) {
            IN_ISR.with(|flag| flag.set(self.0));
        }
    }

    let _restore = Restore(IN_ISR.with(|flag| flag.replace(true)));
    f()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_threads_report_their_core() {
        let handles: Vec<_> = (0..3)
            .map(|core| spawn_pinned(core, "worker", move || PosixPlatform.core_id()).unwrap())
            .collect();
        let cores: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(cores, vec![0, 1, 2]);
    }

    #[test]
    fn isr_flag_is_scoped() {
        let platform = PosixPlatform::new();
        assert!(!platform.in_isr());
        let nested = run_as_isr(|| {
            assert!(platform.in_isr());
            run_as_isr(|| platform.in_isr())
        });
        assert!(nested);
        assert!(!platform.in_isr());
    }

    #[test]
    fn clock_is_monotonic() {
        let platform = PosixPlatform::new();
        let a = platform.now_us();
        platform.delay_us(1_000);
        let b = platform.now_us();
        assert!(b >= a + 1_000);
    }
}
