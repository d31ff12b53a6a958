//! Coordinator flow over a scripted transport: swap handling and teardown.

use crate::common::{init_tracing, sample_module};
use rondel_core::seed::Seed;
use rondel_variant::cache::CachePair;
use rondel_variant::channel::{MessageKind, Notification, Transport};
use rondel_variant::coordinator::Coordinator;
use rondel_variant::manager::{Epoch, ModuleVariant, VariantManager};
use rondel_variant::rbbl;
use rondel_variant::{Error, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

const X_BASE: u64 = 0x40_0000;
const CC_BASE: u64 = X_BASE + (1 << 30);

/// Feeds a fixed script of notifications and records every reply.
struct ScriptedTransport {
    incoming: VecDeque<Notification>,
    sent: Arc<Mutex<Vec<Notification>>>,
}

impl Transport for ScriptedTransport {
    fn send(&mut self, notification: &Notification) -> Result<()> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }

    fn recv(&mut self) -> Result<Notification> {
        self.incoming
            .pop_front()
            .ok_or_else(|| Error::Transport("script exhausted".into()))
    }
}

fn swap_ready_manager() -> VariantManager {
    let module = sample_module();
    let templates = rbbl::build_templates(&module).unwrap();
    let cache = CachePair::anonymous(0x1000).unwrap();
    let manager = VariantManager::new(Seed::from_hex(&"99".repeat(32)).unwrap());
    manager.add_module(ModuleVariant::new(
        "prot", templates, cache, X_BASE, 0x40, CC_BASE,
    ));
    manager.generate(Epoch::First).unwrap();
    manager.generate(Epoch::Second).unwrap();
    manager.activate(Epoch::First).unwrap();
    manager
}

#[test]
fn swap_request_is_answered_with_translated_pc() {
    init_tracing();
    let manager = swap_ready_manager();
    let paused_at = manager
        .cache_pc_for_original(X_BASE + 0x19, Epoch::First)
        .unwrap();
    let expected = manager.new_pc_for_old(paused_at, Epoch::Second).unwrap();

    let mut swap = Notification::new(MessageKind::NeedVariant2, 4242);
    swap.new_ip = paused_at;
    swap.stop_ips[0] = paused_at;

    let sent = Arc::new(Mutex::new(Vec::new()));
    let transport = ScriptedTransport {
        incoming: VecDeque::from([swap, Notification::new(MessageKind::ProcessOut, 4242)]),
        sent: Arc::clone(&sent),
    };
    let mut coordinator =
        Coordinator::resume(transport, manager, Some(Epoch::First), Some(4242));
    coordinator.run().unwrap();

    let sent = sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, MessageKind::Variant2Ready);
    assert_eq!(sent[0].new_ip, expected);
    assert_eq!(sent[0].stop_ips[0], expected);

    // The retired buffer was consumed, the fresh one is active.
    let manager = coordinator.manager();
    assert!(!manager.is_ready(Epoch::First));
    assert_eq!(
        manager.state(Epoch::Second),
        rondel_variant::manager::BufferState::Active
    );
}

#[test]
fn wrong_app_aborts_the_loop() {
    init_tracing();
    let manager = swap_ready_manager();
    let mut bad = Notification::new(MessageKind::WrongApp, 4242);
    bad.app_name = "intruder".into();

    let transport = ScriptedTransport {
        incoming: VecDeque::from([bad]),
        sent: Arc::new(Mutex::new(Vec::new())),
    };
    let mut coordinator = Coordinator::resume(transport, manager, Some(Epoch::First), None);
    assert!(matches!(
        coordinator.run(),
        Err(Error::WrongApp(name)) if name == "intruder"
    ));
}
