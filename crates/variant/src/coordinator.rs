//! Event loop binding kernel notifications to the variant manager.
//!
//! The kernel-resident interceptor pauses the protected process and sends one
//! notification per event; this loop services each one and answers with the
//! translated program counter the process resumes at. The transport itself is
//! a collaborator behind [`Transport`].

use crate::cache::{CachePair, CacheRegion};
use crate::channel::{MessageKind, Notification, Transport, MAX_STOPS};
use crate::manager::{Epoch, ModuleVariant, VariantManager, DEFAULT_SPIN_BOUND};
use crate::maps;
use crate::rbbl::BlockTemplates;
use crate::result::{Error, Result};
use tracing::{debug, info, warn};

/// A module analyzed ahead of attach: its name and lowered templates.
pub struct PreparedModule {
    pub name: String,
    pub templates: BlockTemplates,
}

/// Drives the manager from the kernel notification stream.
pub struct Coordinator<T: Transport> {
    transport: T,
    manager: VariantManager,
    prepared: Vec<PreparedModule>,
    active: Option<Epoch>,
    pid: Option<i32>,
    spin_bound: u64,
}

impl<T: Transport> Coordinator<T> {
    pub fn new(transport: T, manager: VariantManager, prepared: Vec<PreparedModule>) -> Self {
        Self {
            transport,
            manager,
            prepared,
            active: None,
            pid: None,
            spin_bound: DEFAULT_SPIN_BOUND,
        }
    }

    /// Resumes coordination over an already-attached manager, as after a
    /// controller restart while the protected process keeps running.
    pub fn resume(
        transport: T,
        manager: VariantManager,
        active: Option<Epoch>,
        pid: Option<i32>,
    ) -> Self {
        Self {
            transport,
            manager,
            prepared: Vec::new(),
            active,
            pid,
            spin_bound: DEFAULT_SPIN_BOUND,
        }
    }

    /// Receives and dispatches notifications until the protected process
    /// exits or the kernel side disconnects.
    pub fn run(&mut self) -> Result<()> {
        loop {
            let n = self.transport.recv()?;
            debug!(kind = ?n.kind, pid = n.pid, "notification");
            match n.kind {
                MessageKind::ProcessIn => self.handle_process_in(&n)?,
                MessageKind::NeedVariant1 => self.handle_swap(Epoch::First, &n)?,
                MessageKind::NeedVariant2 => self.handle_swap(Epoch::Second, &n)?,
                MessageKind::SigactionDetected => self.handle_sigaction(&n)?,
                MessageKind::CreateShadowStack => self.handle_create_shadow_stack(&n)?,
                MessageKind::FreeShadowStack => {
                    self.manager.clear_shadow_stack();
                    self.reply(MessageKind::ShadowStackHandled, &n, n.new_ip, "shadow stack freed")?;
                }
                MessageKind::Dlopen | MessageKind::Dlclose => {
                    // Module hot-add runs through the analysis collaborator;
                    // acknowledge so the process resumes.
                    warn!(kind = ?n.kind, "module set changed; static analysis is stale");
                    self.reply(MessageKind::DlOperationHandled, &n, n.new_ip, "dl operation noted")?;
                }
                MessageKind::ProcessOut | MessageKind::Disconnect => {
                    info!(pid = n.pid, "protected process left; stopping worker");
                    self.manager.stop_worker();
                    return Ok(());
                }
                MessageKind::WrongApp => {
                    self.manager.stop_worker();
                    return Err(Error::WrongApp(n.app_name));
                }
                other => warn!(kind = ?other, "unexpected message kind ignored"),
            }
        }
    }

    /// Attach: map the kernel-created cache and shadow-stack objects, start
    /// the worker, and answer with the entry point translated into variant 1.
    fn handle_process_in(&mut self, n: &Notification) -> Result<()> {
        let pid = n.pid;
        self.pid = Some(pid);
        debug!(
            app = %n.app_name,
            ss_mode = ?n.ss_mode,
            cc_offset = n.cc_offset,
            ss_offset = n.ss_offset,
            gs_base = n.gs_base,
            "attaching to protected process"
        );
        let layout = maps::inspect(pid)?;

        for prep in self.prepared.drain(..) {
            let cache = layout.cache_of(&prep.name)?;
            let image = layout
                .images
                .get(&prep.name)
                .copied()
                .ok_or_else(|| Error::MissingImageMapping(prep.name.clone()))?;
            let shm_name = format!("/{pid}-{}.cc", prep.name);
            let pair = CachePair::open_shm(&shm_name, cache.size as usize)?;
            self.manager.add_module(ModuleVariant::new(
                prep.name,
                prep.templates,
                pair,
                image.base,
                image.size,
                cache.base,
            ));
        }
        if let (Some(region), Some(name)) = (layout.shadow_stack, &layout.shadow_stack_name) {
            let ss = CacheRegion::open_shm(&format!("/{name}"), region.size as usize)?;
            self.manager.set_shadow_stack(ss);
        }

        self.manager.start_worker();
        let spins = self.manager.wait_ready(Epoch::First, self.spin_bound)?;
        debug!(spins, "first variant ready");
        self.manager.activate(Epoch::First)?;
        self.active = Some(Epoch::First);

        let new_ip = self
            .manager
            .cache_pc_for_original(n.new_ip, Epoch::First)
            .unwrap_or(0);
        let mut stops = [0u64; MAX_STOPS];
        for (slot, &ip) in stops.iter_mut().zip(n.stop_ips.iter()) {
            if ip != 0 {
                *slot = self
                    .manager
                    .cache_pc_for_original(ip, Epoch::First)
                    .unwrap_or(0);
            }
        }
        self.transport.send(&Notification::reply(
            MessageKind::Variant1Ready,
            pid,
            new_ip,
            stops,
            "code variant generated",
        ))
    }

    /// Swap: wait for the fresh buffer, translate the paused pc and every
    /// pending stop address, patch the shadow stack, retire the old buffer.
    fn handle_swap(&mut self, fresh: Epoch, n: &Notification) -> Result<()> {
        let retiring = fresh.other();
        let spins = self.manager.wait_ready(fresh, self.spin_bound)?;
        debug!(spins, fresh = fresh.index(), "swap window open");

        let new_ip = self.manager.new_pc_for_old(n.new_ip, fresh).unwrap_or(0);
        let mut stops = [0u64; MAX_STOPS];
        for (slot, &ip) in stops.iter_mut().zip(n.stop_ips.iter()) {
            if ip != 0 {
                *slot = self.manager.new_pc_for_old(ip, fresh).unwrap_or(ip);
            }
        }
        let patched = self.manager.patch_shadow_stack(fresh)?;
        debug!(patched, "return addresses rewritten");

        self.manager.activate(fresh)?;
        self.active = Some(fresh);
        self.manager.consume(retiring)?;

        let kind = match fresh {
            Epoch::First => MessageKind::Variant1Ready,
            Epoch::Second => MessageKind::Variant2Ready,
        };
        self.transport
            .send(&Notification::reply(kind, n.pid, new_ip, stops, "switched code variant"))
    }

    /// A handler was installed at an original-text address; hand back where
    /// it lives in the active variant.
    fn handle_sigaction(&mut self, n: &Notification) -> Result<()> {
        let epoch = self.active.unwrap_or(Epoch::First);
        let new_ip = self
            .manager
            .cache_pc_for_original(n.new_ip, epoch)
            .unwrap_or(0);
        self.reply(MessageKind::SigactionHandled, n, new_ip, "signal handler translated")
    }

    fn handle_create_shadow_stack(&mut self, n: &Notification) -> Result<()> {
        if let Some(pid) = self.pid {
            let layout = maps::inspect(pid)?;
            if let (Some(region), Some(name)) = (layout.shadow_stack, &layout.shadow_stack_name) {
                let ss = CacheRegion::open_shm(&format!("/{name}"), region.size as usize)?;
                self.manager.set_shadow_stack(ss);
            }
        }
        self.reply(MessageKind::ShadowStackHandled, n, n.new_ip, "shadow stack mapped")
    }

    fn reply(
        &mut self,
        kind: MessageKind,
        n: &Notification,
        new_ip: u64,
        message: &str,
    ) -> Result<()> {
        self.transport
            .send(&Notification::reply(kind, n.pid, new_ip, [0; MAX_STOPS], message))
    }

    /// The manager, for inspection after `run` returns.
    pub fn manager(&self) -> &VariantManager {
        &self.manager
    }
}
