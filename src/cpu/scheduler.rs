//! Tick scheduler.
//!
//! Drives one fetch-decode-execute cycle per tick. Ticks come either from
//! the periodic timer loop ([`Scheduler::run`], [`Scheduler::spawn`]) or
//! from explicit [`Scheduler::tick`] calls. A tick that arrives while
//! another one is still executing is dropped, not queued.

use crate::cpu::Cpu;
use crate::cpu::decode::Instruction;
use crate::cpu::execute::CpuError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

/// Callback run after every executed instruction.
pub type Observer = Box<dyn FnMut(&Cpu) + Send>;

/// Execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebugMode {
    /// Run silently.
    #[default]
    Normal,
    /// Single-step mode: the register file is logged before every instruction.
    Verbose,
}

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Delay between timer ticks.
    pub interval: Duration,
    /// Start in verbose mode.
    pub verbose: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(50),
            verbose: false,
        }
    }
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    /// Another tick was in progress; nothing happened.
    Skipped,
    /// One instruction was executed.
    Executed(Instruction),
    /// The instruction faulted and the timer was stopped.
    Faulted(CpuError),
}

/// State only touched from inside a tick (or between ticks).
struct Core {
    cpu: Cpu,
    mode: DebugMode,
    breakpoints: Vec<u16>,
    observers: Vec<Observer>,
}

/// Owns the CPU and decides when it runs.
pub struct Scheduler {
    core: Mutex<Core>,
    busy: AtomicBool,
    timer: AtomicBool,
    interval: Duration,
}

/// Holds the busy flag for the duration of a tick.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Scheduler {
    /// Wrap a CPU. The timer starts stopped.
    pub fn new(cpu: Cpu, config: SchedulerConfig) -> Self {
        let mode = if config.verbose { DebugMode::Verbose } else { DebugMode::Normal };
        Self {
            core: Mutex::new(Core {
                cpu,
                mode,
                breakpoints: Vec::new(),
                observers: Vec::new(),
            }),
            busy: AtomicBool::new(false),
            timer: AtomicBool::new(false),
            interval: config.interval,
        }
    }

    fn core(&self) -> MutexGuard<'_, Core> {
        // A panicking observer poisons the lock; the machine state is still usable
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set PC from the reset vector and SP to the top of the stack.
    pub fn init(&self) {
        self.core().cpu.init();
    }

    /// Break into verbose mode when PC reaches `addr`.
    pub fn set_breakpoint(&self, addr: u16) {
        self.core().breakpoints.push(addr);
    }

    /// Registered breakpoints, in insertion order.
    pub fn breakpoints(&self) -> Vec<u16> {
        self.core().breakpoints.clone()
    }

    /// Run `observer` after every instruction, after those already registered.
    pub fn add_observer<F>(&self, observer: F)
    where
        F: FnMut(&Cpu) + Send + 'static,
    {
        self.core().observers.push(Box::new(observer));
    }

    /// Current execution mode.
    pub fn mode(&self) -> DebugMode {
        self.core().mode
    }

    /// Switch execution mode.
    pub fn set_mode(&self, mode: DebugMode) {
        self.core().mode = mode;
    }

    /// Peek at or patch the machine between ticks.
    pub fn with_cpu<R>(&self, f: impl FnOnce(&mut Cpu) -> R) -> R {
        f(&mut self.core().cpu)
    }

    /// Copy of the current machine state.
    pub fn snapshot(&self) -> Cpu {
        self.core().cpu.clone()
    }

    /// Give the CPU back.
    pub fn into_cpu(self) -> Cpu {
        self.core.into_inner().unwrap_or_else(PoisonError::into_inner).cpu
    }

    /// Enable the periodic timer.
    pub fn start(&self) {
        if !self.timer.swap(true, Ordering::SeqCst) {
            log::info!("timer started ({:?} interval)", self.interval);
        }
    }

    /// Disable the periodic timer. A tick in progress runs to completion.
    pub fn stop(&self) {
        if self.timer.swap(false, Ordering::SeqCst) {
            log::info!("timer stopped");
        }
    }

    /// Whether the periodic timer is enabled.
    pub fn is_running(&self) -> bool {
        self.timer.load(Ordering::SeqCst)
    }

    /// Run one fetch-decode-execute cycle.
    pub fn tick(&self) -> Tick {
        let Some(_busy) = BusyGuard::acquire(&self.busy) else {
            log::trace!("tick skipped, previous tick still running");
            return Tick::Skipped;
        };

        let mut core = self.core();
        let pc = core.cpu.regs.pc();

        if core.breakpoints.contains(&pc) {
            log::info!("breakpoint at 0x{:X} reached, going to step-by-step mode", pc);
            core.mode = DebugMode::Verbose;
            self.stop();
        }

        let instr = Instruction::classify(core.cpu.mem.read_word(pc));
        if core.mode == DebugMode::Verbose {
            log::info!("{}", core.cpu.regs);
            match instr.decode() {
                Ok(op) => log::info!("0x{:04X}: {:04X}  {}", pc, instr.code, op),
                Err(_) => log::info!("0x{:04X}: {:04X}  ???", pc, instr.code),
            }
        }

        let outcome = match core.cpu.execute(instr) {
            Ok(()) => Tick::Executed(instr),
            Err(e) => {
                log::error!("fatal error at 0x{:X}: {}! CPU stopped", pc, e);
                self.stop();
                Tick::Faulted(e)
            }
        };

        let Core { cpu, observers, .. } = &mut *core;
        for observer in observers.iter_mut() {
            observer(&*cpu);
        }

        outcome
    }

    /// Tick at the configured interval until the timer is stopped.
    ///
    /// Returns immediately if the timer is not running.
    pub fn run(&self) {
        while self.is_running() {
            self.tick();
            std::thread::sleep(self.interval);
        }
    }

    /// Start the timer and run it on a background thread.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        self.start();
        let scheduler = Arc::clone(self);
        std::thread::spawn(move || scheduler.run())
    }

    /// Tick back to back, without waiting for the interval, until the timer
    /// stops or `max_ticks` ticks have been made.
    ///
    /// Returns the number of instructions executed (including a faulting one).
    pub fn run_for(&self, max_ticks: u64) -> u64 {
        self.start();

        let mut ticks = 0;
        let mut executed = 0;
        while self.is_running() && ticks < max_ticks {
            if !matches!(self.tick(), Tick::Skipped) {
                executed += 1;
            }
            ticks += 1;
        }

        self.stop();
        executed
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("running", &self.is_running())
            .field("busy", &self.busy.load(Ordering::Relaxed))
            .field("interval", &self.interval)
            .finish()
    }
}
