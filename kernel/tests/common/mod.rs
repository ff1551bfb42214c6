//! Host-side collaborators for the end-to-end IPC tests.
//!
//! The scheduler backs each PID with a real OS thread: `block_task` parks
//! the calling thread behind a permit flag and `unblock_task` hands the
//! permit over, giving the exact permit semantics the IPC core relies on.
//! A background ticker drives the registered timer hooks every
//! millisecond, so timed waits expire like they would off the PIT.
//!
//! The memory backend keeps frames as heap buffers and mappings as
//! bookkeeping, which lets tests read and write "mapped" shared memory
//! through [`HostMemory::write`]/[`HostMemory::read`].

// Each test binary uses a different slice of this harness.
#![allow(dead_code)]

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::thread::{self, JoinHandle, Thread};
use std::time::{Duration, Instant};

use edgex_kernel::memory::address::{PhysAddr, VirtAddr};
use edgex_kernel::memory::ops::{AllocFlags, MemoryOps, PageFlags};
use edgex_kernel::memory::FRAME_SIZE;
use edgex_kernel::sched::{Pid, Scheduler};

thread_local! {
    static CURRENT_PID: Cell<Pid> = const { Cell::new(1) };
}

/// Set the PID the scheduler reports for the calling thread.
pub fn set_current_pid(pid: Pid) {
    CURRENT_PID.with(|c| c.set(pid));
}

#[derive(Default)]
struct TaskSlot {
    thread: Option<Thread>,
    permit: bool,
}

pub struct HostScheduler {
    start: Instant,
    tasks: Mutex<HashMap<Pid, TaskSlot>>,
    timer_hooks: Mutex<Vec<fn()>>,
    exit_hooks: Mutex<Vec<fn(Pid)>>,
    boosts: Mutex<Vec<(Pid, u8)>>,
}

impl HostScheduler {
    fn new() -> Self {
        HostScheduler {
            start: Instant::now(),
            tasks: Mutex::new(HashMap::new()),
            timer_hooks: Mutex::new(Vec::new()),
            exit_hooks: Mutex::new(Vec::new()),
            boosts: Mutex::new(Vec::new()),
        }
    }

    /// Simulate task termination: run the registered exit hooks and drop
    /// the task's scheduling slot.
    pub fn exit_task(&self, pid: Pid) {
        let hooks: Vec<fn(Pid)> = self.exit_hooks.lock().unwrap().clone();
        for hook in hooks {
            hook(pid);
        }
        self.tasks.lock().unwrap().remove(&pid);
    }

    /// Currently requested priority boosts, oldest first.
    pub fn boosts(&self) -> Vec<(Pid, u8)> {
        self.boosts.lock().unwrap().clone()
    }

    fn run_timer_hooks(&self) {
        let hooks: Vec<fn()> = self.timer_hooks.lock().unwrap().clone();
        for hook in hooks {
            hook();
        }
    }
}

impl Scheduler for HostScheduler {
    fn current_pid(&self) -> Pid {
        CURRENT_PID.with(|c| c.get())
    }

    fn block_task(&self, pid: Pid) {
        {
            let mut tasks = self.tasks.lock().unwrap();
            let slot = tasks.entry(pid).or_default();
            if slot.permit {
                slot.permit = false;
                return;
            }
            slot.thread = Some(thread::current());
        }
        loop {
            thread::park();
            let mut tasks = self.tasks.lock().unwrap();
            let slot = tasks.entry(pid).or_default();
            if slot.permit {
                slot.permit = false;
                slot.thread = None;
                return;
            }
        }
    }

    fn unblock_task(&self, pid: Pid) {
        let thread = {
            let mut tasks = self.tasks.lock().unwrap();
            let slot = tasks.entry(pid).or_default();
            slot.permit = true;
            slot.thread.clone()
        };
        if let Some(thread) = thread {
            thread.unpark();
        }
    }

    fn now_ticks(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn register_timer_hook(&self, hook: fn()) {
        self.timer_hooks.lock().unwrap().push(hook);
    }

    fn register_task_exit_hook(&self, hook: fn(Pid)) {
        self.exit_hooks.lock().unwrap().push(hook);
    }

    fn boost_priority(&self, pid: Pid, level: u8) {
        self.boosts.lock().unwrap().push((pid, level));
    }

    fn reset_priority(&self, pid: Pid) {
        self.boosts.lock().unwrap().retain(|(p, _)| *p != pid);
    }
}

struct HostMapping {
    virt: u64,
    size: usize,
    frames: Vec<u64>,
}

pub struct HostMemory {
    frames: Mutex<HashMap<u64, Box<[u8; FRAME_SIZE]>>>,
    mappings: Mutex<Vec<HostMapping>>,
    next_frame: AtomicU64,
}

impl HostMemory {
    fn new() -> Self {
        HostMemory {
            frames: Mutex::new(HashMap::new()),
            mappings: Mutex::new(Vec::new()),
            next_frame: AtomicU64::new(0x100_0000),
        }
    }

    fn resolve(&self, virt: u64) -> Option<u64> {
        let mappings = self.mappings.lock().unwrap();
        let m = mappings
            .iter()
            .find(|m| virt >= m.virt && virt < m.virt + m.size as u64)?;
        let offset = (virt - m.virt) as usize;
        let frame = *m.frames.get(offset / FRAME_SIZE)?;
        Some(frame + (offset % FRAME_SIZE) as u64)
    }

    /// Write through a live mapping, as a mapped task would.
    pub fn write(&self, virt: VirtAddr, data: &[u8]) {
        for (i, &byte) in data.iter().enumerate() {
            let phys = self
                .resolve(virt.as_u64() + i as u64)
                .expect("write through unmapped address");
            let mut frames = self.frames.lock().unwrap();
            let frame = frames
                .get_mut(&(phys & !(FRAME_SIZE as u64 - 1)))
                .expect("write to freed frame");
            frame[(phys % FRAME_SIZE as u64) as usize] = byte;
        }
    }

    /// Read through a live mapping.
    pub fn read(&self, virt: VirtAddr, out: &mut [u8]) {
        for (i, slot) in out.iter_mut().enumerate() {
            let phys = self
                .resolve(virt.as_u64() + i as u64)
                .expect("read through unmapped address");
            let frames = self.frames.lock().unwrap();
            let frame = frames
                .get(&(phys & !(FRAME_SIZE as u64 - 1)))
                .expect("read from freed frame");
            *slot = frame[(phys % FRAME_SIZE as u64) as usize];
        }
    }
}

impl MemoryOps for HostMemory {
    fn alloc_pages(&self, n: usize, _flags: AllocFlags) -> Option<Vec<PhysAddr>> {
        let mut store = self.frames.lock().unwrap();
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let addr = self
                .next_frame
                .fetch_add(FRAME_SIZE as u64, Ordering::Relaxed);
            store.insert(addr, Box::new([0u8; FRAME_SIZE]));
            out.push(PhysAddr::new(addr));
        }
        Some(out)
    }

    fn free_pages(&self, frames: &[PhysAddr]) {
        let mut store = self.frames.lock().unwrap();
        for f in frames {
            store.remove(&f.as_u64());
        }
    }

    fn map_pages(
        &self,
        virt: VirtAddr,
        frames: &[PhysAddr],
        size: usize,
        _flags: PageFlags,
    ) -> Result<(), &'static str> {
        let mut mappings = self.mappings.lock().unwrap();
        mappings.retain(|m| m.virt != virt.as_u64());
        mappings.push(HostMapping {
            virt: virt.as_u64(),
            size,
            frames: frames.iter().map(|f| f.as_u64()).collect(),
        });
        Ok(())
    }

    fn unmap_pages(&self, virt: VirtAddr, size: usize) -> Result<(), &'static str> {
        let mut mappings = self.mappings.lock().unwrap();
        let before = mappings.len();
        mappings.retain(|m| m.virt != virt.as_u64());
        if mappings.len() != before {
            return Ok(());
        }
        // Tail unmap inside an existing mapping (segment shrink).
        for m in mappings.iter_mut() {
            if virt.as_u64() > m.virt && virt.as_u64() + (size as u64) == m.virt + m.size as u64 {
                let keep = (virt.as_u64() - m.virt) as usize;
                m.size = keep;
                m.frames.truncate(keep / FRAME_SIZE);
                return Ok(());
            }
        }
        Err("no mapping at address")
    }

    fn flush_tlb(&self, _virt: VirtAddr, _size: usize) {}

    fn copy_page(&self, dst: PhysAddr, src: PhysAddr) {
        let mut store = self.frames.lock().unwrap();
        if let Some(data) = store.get(&src.as_u64()).map(|b| **b) {
            if let Some(d) = store.get_mut(&dst.as_u64()) {
                **d = data;
            }
        }
    }
}

static ENV: OnceLock<(&'static HostScheduler, &'static HostMemory)> = OnceLock::new();

/// Install the host collaborators, initialise IPC, and start the ticker.
/// Idempotent across tests within one binary.
pub fn setup() -> (&'static HostScheduler, &'static HostMemory) {
    *ENV.get_or_init(|| {
        let sched: &'static HostScheduler = Box::leak(Box::new(HostScheduler::new()));
        let mem: &'static HostMemory = Box::leak(Box::new(HostMemory::new()));
        edgex_kernel::sched::install(sched);
        edgex_kernel::memory::ops::install(mem);
        edgex_kernel::ipc::init().expect("ipc init");

        thread::Builder::new()
            .name("timer-tick".into())
            .spawn(move || loop {
                thread::sleep(Duration::from_millis(1));
                sched.run_timer_hooks();
            })
            .expect("spawn ticker");

        (sched, mem)
    })
}

/// Run `f` on a fresh thread whose scheduler identity is `pid`.
pub fn spawn_task<F, T>(pid: Pid, f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    thread::spawn(move || {
        set_current_pid(pid);
        f()
    })
}

/// Poll `cond` until it holds, panicking after five seconds.
pub fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        thread::sleep(Duration::from_millis(1));
    }
}
