//! Double-buffered code-variant management.
//!
//! Each protected module owns one cache pair; exactly one buffer is active
//! (mapped into the protected process) while the other is rebuilt. A
//! background worker regenerates whichever buffer is not ready and loops
//! until stopped. The only inter-thread state is the two ready flags and the
//! stop flag; waiting is a yielding busy-poll with an explicit spin budget,
//! since the protected process is paused for the duration of a swap. The
//! layout and site maps of a buffer are only read by the controller after its
//! ready flag is observed true, and never written by the worker afterwards.

use crate::cache::{CachePair, CacheRegion};
use crate::encode::invalid_instr;
use crate::layout::{self, LayoutInputs, LayoutResult, Placement};
use crate::rbbl::{BlockTemplates, GenContext};
use crate::relocate;
use crate::result::{Error, Result};
use rand::rngs::StdRng;
use rondel_core::seed::Seed;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

/// Default spin budget for ready polling. Generation of a large module takes
/// visible time, so the budget is generous; tests pass far smaller bounds.
pub const DEFAULT_SPIN_BOUND: u64 = 1_000_000_000;

/// Chasing limit when following trampoline chains during translation.
const MAX_TRAMP_HOPS: usize = 64;

/// Which of the two alternating cache buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Epoch {
    First,
    Second,
}

impl Epoch {
    pub fn other(self) -> Epoch {
        match self {
            Epoch::First => Epoch::Second,
            Epoch::Second => Epoch::First,
        }
    }

    #[inline]
    pub fn index(self) -> usize {
        match self {
            Epoch::First => 0,
            Epoch::Second => 1,
        }
    }
}

/// Lifecycle of one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Retired; waiting for the worker to rebuild it.
    Stale,
    /// The worker is rebuilding it.
    Generating,
    /// Built and untouched; may be activated.
    Ready,
    /// Mapped and executing in the protected process.
    Active,
}

/// One module's templates, cache pair and per-buffer layouts.
pub struct ModuleVariant {
    name: String,
    templates: BlockTemplates,
    cache: CachePair,
    /// Process address of the original executable mapping.
    x_load_base: u64,
    x_load_size: u64,
    /// Process address of the cache mapping; the kernel flips this window
    /// between the two buffers, so it is epoch-independent.
    cc_load_base: u64,
    cc_offset: u64,
    slots: [LayoutResult; 2],
}

impl ModuleVariant {
    pub fn new(
        name: impl Into<String>,
        templates: BlockTemplates,
        cache: CachePair,
        x_load_base: u64,
        x_load_size: u64,
        cc_load_base: u64,
    ) -> Self {
        Self {
            name: name.into(),
            templates,
            cache,
            x_load_base,
            x_load_size,
            cc_load_base,
            cc_offset: cc_load_base.wrapping_sub(x_load_base),
            slots: [LayoutResult::default(), LayoutResult::default()],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Per-buffer capacity in bytes.
    pub fn buffer_size(&self) -> usize {
        self.cache.buffer_size()
    }

    /// Fills one buffer with the faulting filler instruction.
    fn clean(&mut self, idx: usize) {
        self.cache.buffer_mut(idx).fill(invalid_instr()[0]);
    }

    /// Clears the buffer, arranges a fresh randomized layout and relocates it.
    fn generate(&mut self, idx: usize, rng: &mut StdRng) -> Result<()> {
        self.clean(idx);
        let inputs = LayoutInputs {
            fixed: &self.templates.fixed,
            movable: &self.templates.movable,
            switch_jumps: &self.templates.switch_jumps,
            cc_offset: self.cc_offset,
        };
        let buf = self.cache.buffer_mut(idx);
        let arranged = layout::arrange(buf, &inputs, rng)?;
        let ctx = GenContext {
            x_load_base: self.x_load_base,
            cc_load_base: self.cc_load_base,
            block_sites: &arranged.block_sites,
        };
        relocate::relocate(buf, &arranged, &self.templates, &ctx)?;
        self.slots[idx] = arranged;
        debug!(module = %self.name, buffer = idx, "generated code variant");
        Ok(())
    }

    /// Drops the layout and site maps of a consumed buffer.
    fn clear(&mut self, idx: usize) {
        self.slots[idx] = LayoutResult::default();
    }

    /// Cache-relative offset of a process address inside the cache window.
    fn cache_rel(&self, p_addr: u64) -> Option<u64> {
        let rel = p_addr.checked_sub(self.cc_load_base)?;
        (rel < self.cache.buffer_size() as u64).then_some(rel)
    }

    /// Finds the block enclosing a cache-relative address, following
    /// trampoline chains. Returns the block's original offset, its placement
    /// address, and the intra-block offset of the query (zero after a hop).
    fn find_block(&self, idx: usize, rel: u64) -> Option<(u64, u64, u64)> {
        let arranged = &self.slots[idx];
        let mut addr = rel;
        let mut direct = true;
        for _ in 0..MAX_TRAMP_HOPS {
            let (start, _, placement) = arranged.layout.covering(addr)?;
            match placement {
                Placement::Boundary | Placement::InvalidFiller => return None,
                Placement::Trampoline8 { dest } | Placement::OverlapTrampoline32 { dest } => {
                    addr = dest;
                    direct = false;
                }
                Placement::Trampoline32 { target } => {
                    addr = arranged.block_sites.get(&target).copied()?;
                    direct = false;
                }
                Placement::Block { offset } => {
                    let internal = if direct { addr - start } else { 0 };
                    return Some((offset, start, internal));
                }
            }
        }
        None
    }

    /// Maps an address in the retiring buffer to the same point in the fresh
    /// one: locate the enclosing block, keep the intra-block offset, rebase.
    fn new_pc_for_old(&self, old_pc: u64, new_idx: usize) -> Option<u64> {
        let rel = self.cache_rel(old_pc)?;
        let (offset, _, internal) = self.find_block(1 - new_idx, rel)?;
        let new_site = self.slots[new_idx].block_sites.get(&offset).copied()?;
        Some(self.cc_load_base + new_site + internal)
    }

    /// Maps an address in the original executable mapping to the block entry
    /// now serving it in the given buffer.
    fn cache_pc_for_original(&self, p_addr: u64, idx: usize) -> Option<u64> {
        let off = p_addr.checked_sub(self.x_load_base)?;
        if off >= self.x_load_size {
            return None;
        }
        let site = self.slots[idx].block_sites.get(&off).copied()?;
        Some(self.cc_load_base + site)
    }
}

struct Shared {
    modules: Mutex<Vec<ModuleVariant>>,
    rng: Mutex<StdRng>,
    shadow_stack: Mutex<Option<CacheRegion>>,
    ready: [AtomicBool; 2],
    generating: [AtomicBool; 2],
    /// 0 = none, 1 = first, 2 = second.
    active: AtomicUsize,
    stop: AtomicBool,
}

impl Shared {
    fn generate_into(&self, idx: usize) -> Result<()> {
        self.generating[idx].store(true, Ordering::Release);
        let result = {
            let mut modules = self.modules.lock().unwrap();
            let mut rng = self.rng.lock().unwrap();
            modules.iter_mut().try_for_each(|m| m.generate(idx, &mut rng))
        };
        self.generating[idx].store(false, Ordering::Release);
        result?;
        self.ready[idx].store(true, Ordering::Release);
        Ok(())
    }
}

/// Orchestrates the buffer pair across every protected module.
pub struct VariantManager {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl VariantManager {
    pub fn new(seed: Seed) -> Self {
        Self {
            shared: Arc::new(Shared {
                modules: Mutex::new(Vec::new()),
                rng: Mutex::new(seed.layout_rng()),
                shadow_stack: Mutex::new(None),
                ready: [AtomicBool::new(false), AtomicBool::new(false)],
                generating: [AtomicBool::new(false), AtomicBool::new(false)],
                active: AtomicUsize::new(0),
                stop: AtomicBool::new(false),
            }),
            worker: None,
        }
    }

    pub fn add_module(&self, module: ModuleVariant) {
        self.shared.modules.lock().unwrap().push(module);
    }

    pub fn module_count(&self) -> usize {
        self.shared.modules.lock().unwrap().len()
    }

    /// Installs the mapped shadow-stack region.
    pub fn set_shadow_stack(&self, region: CacheRegion) {
        *self.shared.shadow_stack.lock().unwrap() = Some(region);
    }

    pub fn clear_shadow_stack(&self) {
        *self.shared.shadow_stack.lock().unwrap() = None;
    }

    /// Generates one buffer across all modules and marks it ready.
    pub fn generate(&self, epoch: Epoch) -> Result<()> {
        self.shared.generate_into(epoch.index())
    }

    pub fn is_ready(&self, epoch: Epoch) -> bool {
        self.shared.ready[epoch.index()].load(Ordering::Acquire)
    }

    /// Current lifecycle state of a buffer.
    pub fn state(&self, epoch: Epoch) -> BufferState {
        let idx = epoch.index();
        if self.shared.active.load(Ordering::Acquire) == idx + 1 {
            BufferState::Active
        } else if self.shared.ready[idx].load(Ordering::Acquire) {
            BufferState::Ready
        } else if self.shared.generating[idx].load(Ordering::Acquire) {
            BufferState::Generating
        } else {
            BufferState::Stale
        }
    }

    /// Yielding busy-poll until the buffer is ready; the spin budget bounds
    /// a wedged worker instead of hanging the controller.
    pub fn wait_ready(&self, epoch: Epoch, max_spins: u64) -> Result<u64> {
        let idx = epoch.index();
        let mut spins = 0u64;
        while !self.shared.ready[idx].load(Ordering::Acquire) {
            if spins >= max_spins {
                return Err(Error::SpinBoundExceeded {
                    buffer: idx,
                    spins,
                });
            }
            spins += 1;
            thread::yield_now();
        }
        Ok(spins)
    }

    /// Marks a ready buffer as the one executing in the protected process.
    pub fn activate(&self, epoch: Epoch) -> Result<()> {
        let idx = epoch.index();
        if !self.shared.ready[idx].load(Ordering::Acquire) {
            return Err(Error::NotReady(idx));
        }
        self.shared.active.store(idx + 1, Ordering::Release);
        Ok(())
    }

    /// Retires a consumed buffer: drops its layout and site maps and resets
    /// its ready flag so the worker starts the next cycle from a clean slate.
    pub fn consume(&self, epoch: Epoch) -> Result<()> {
        let idx = epoch.index();
        if !self.shared.ready[idx].load(Ordering::Acquire) {
            return Err(Error::NotReady(idx));
        }
        {
            let mut modules = self.shared.modules.lock().unwrap();
            for m in modules.iter_mut() {
                m.clear(idx);
            }
        }
        if self.shared.active.load(Ordering::Acquire) == idx + 1 {
            self.shared.active.store(0, Ordering::Release);
        }
        self.shared.ready[idx].store(false, Ordering::Release);
        debug!(buffer = idx, "consumed code variant");
        Ok(())
    }

    /// Translates an address in the retiring buffer into the fresh one.
    /// Requires both buffers ready, as during a swap window.
    pub fn new_pc_for_old(&self, old_pc: u64, new_epoch: Epoch) -> Option<u64> {
        if !self.is_ready(Epoch::First) || !self.is_ready(Epoch::Second) {
            warn!(old_pc, "translation requested outside a swap window");
            return None;
        }
        let modules = self.shared.modules.lock().unwrap();
        modules
            .iter()
            .find_map(|m| m.new_pc_for_old(old_pc, new_epoch.index()))
    }

    /// Translates an original-text address to its serving block entry.
    pub fn cache_pc_for_original(&self, p_addr: u64, epoch: Epoch) -> Option<u64> {
        let modules = self.shared.modules.lock().unwrap();
        modules
            .iter()
            .find_map(|m| m.cache_pc_for_original(p_addr, epoch.index()))
    }

    /// Rewrites every live return address on the shadow stack to the fresh
    /// buffer. Walks top-down; entries that do not point into any cache are
    /// left untouched. Returns how many entries were patched.
    pub fn patch_shadow_stack(&self, new_epoch: Epoch) -> Result<usize> {
        if !self.is_ready(Epoch::First) || !self.is_ready(Epoch::Second) {
            return Err(Error::NotReady(new_epoch.other().index()));
        }
        let modules = self.shared.modules.lock().unwrap();
        let mut ss = self.shared.shadow_stack.lock().unwrap();
        let Some(region) = ss.as_mut() else {
            return Ok(0);
        };
        let mut patched = 0usize;
        for chunk in region.as_mut_slice().chunks_exact_mut(8).rev() {
            let old = u64::from_le_bytes(chunk.try_into().unwrap());
            if old == 0 {
                continue;
            }
            if let Some(new) = modules
                .iter()
                .find_map(|m| m.new_pc_for_old(old, new_epoch.index()))
            {
                chunk.copy_from_slice(&new.to_le_bytes());
                patched += 1;
            }
        }
        debug!(patched, "patched shadow-stack return addresses");
        Ok(patched)
    }

    /// Runs a closure over the raw shadow-stack bytes, for diagnostics.
    pub fn with_shadow_stack_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let ss = self.shared.shadow_stack.lock().unwrap();
        ss.as_ref().map(|region| f(region.as_slice()))
    }

    /// Starts the background regeneration worker. Idempotent.
    pub fn start_worker(&mut self) {
        if self.worker.is_some() {
            return;
        }
        self.shared.stop.store(false, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        self.worker = Some(thread::spawn(move || worker_loop(&shared)));
        debug!("started variant worker");
    }

    /// Stops and joins the worker; it can be started again afterwards.
    pub fn stop_worker(&mut self) {
        let Some(handle) = self.worker.take() else {
            return;
        };
        self.shared.stop.store(true, Ordering::Release);
        if handle.join().is_err() {
            error!("variant worker panicked");
        }
        self.shared.stop.store(false, Ordering::Release);
        debug!("stopped variant worker");
    }
}

impl Drop for VariantManager {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

/// Continuously regenerates whichever buffer is not ready until stopped. On a
/// generation failure the loop stops; every failure in that path is a fatal
/// invariant violation, not a transient.
fn worker_loop(shared: &Shared) {
    while !shared.stop.load(Ordering::Acquire) {
        for idx in 0..2 {
            if shared.stop.load(Ordering::Acquire) {
                return;
            }
            if !shared.ready[idx].load(Ordering::Acquire) {
                if let Err(e) = shared.generate_into(idx) {
                    error!(buffer = idx, error = %e, "variant generation failed; worker stopping");
                    shared.stop.store(true, Ordering::Release);
                    return;
                }
            }
        }
        thread::yield_now();
    }
}
