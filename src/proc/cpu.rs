use super::context::Context;
use crate::proc::Kernel;
use core::cell::Cell;

/// Per-CPU state.
///
/// The cells are only ever touched by the thread currently executing on this
/// CPU, which is what makes the `Sync` impl below sound.
pub(crate) struct Cpu {
    /// Slot index of the task running on this CPU, or `None`.
    pub current: Cell<Option<usize>>,
    /// swtch() here to enter the scheduler loop.
    pub context: Context,
    /// Depth of push_off() nesting.
    pub interrupt_disable_layers: Cell<i32>,
    /// Were interrupts enabled before push_off()?
    pub previous_interrupts_enabled: Cell<bool>,
    /// Virtual interrupt-enable flag.
    pub interrupts_enabled: Cell<bool>,
}

unsafe impl Sync for Cpu {}

impl Cpu {
    pub fn new() -> Cpu {
        Cpu {
            current: Cell::new(None),
            context: Context::new(),
            interrupt_disable_layers: Cell::new(0),
            previous_interrupts_enabled: Cell::new(false),
            interrupts_enabled: Cell::new(false),
        }
    }

    pub fn intr_on(&self) {
        self.interrupts_enabled.set(true);
    }
    pub fn intr_off(&self) {
        self.interrupts_enabled.set(false);
    }
    pub fn intr_get(&self) -> bool {
        self.interrupts_enabled.get()
    }
}

/// Which kernel and which CPU the current thread is executing on. The
/// hardware analogue is the `tp` register; here it is a thread-local set on
/// every resume from `swtch` and on scheduler entry.
#[derive(Copy, Clone)]
pub(crate) struct Hart {
    pub kern: *const Kernel,
    pub cpu: usize,
}

impl Hart {
    /// Caller must guarantee the kernel outlives the use, which holds for
    /// every task and scheduler thread: both are joined before the kernel
    /// is dropped.
    pub unsafe fn kernel<'a>(self) -> &'a Kernel {
        &*self.kern
    }
}

std::thread_local! {
    static HART: Cell<Option<Hart>> = const { Cell::new(None) };
}

pub(crate) fn hart() -> Option<Hart> {
    HART.with(|h| h.get())
}

pub(crate) fn set_hart(h: Option<Hart>) {
    HART.with(|cell| cell.set(h));
}

/// CPU number of the current thread, if it is executing on one.
pub(crate) fn cpuid() -> Option<usize> {
    hart().map(|h| h.cpu)
}

/// Disable (virtual) interrupts, tracking nesting depth. Threads outside any
/// CPU have no interrupt state to track.
pub(crate) fn push_off() {
    let Some(h) = hart() else { return };
    let c = unsafe { &h.kernel().cpus[h.cpu] };

    if c.interrupt_disable_layers.get() == 0 {
        c.previous_interrupts_enabled.set(c.intr_get());
        c.intr_off();
    }
    c.interrupt_disable_layers
        .set(c.interrupt_disable_layers.get() + 1);
}

pub(crate) fn pop_off() {
    let Some(h) = hart() else { return };
    let c = unsafe { &h.kernel().cpus[h.cpu] };

    if c.intr_get() {
        panic!("pop_off - interruptible");
    }
    let layers = c.interrupt_disable_layers.get() - 1;
    if layers < 0 {
        panic!("pop_off");
    }
    c.interrupt_disable_layers.set(layers);
    if layers == 0 && c.previous_interrupts_enabled.get() {
        c.intr_on();
    }
}
