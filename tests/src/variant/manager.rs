//! Manager scenarios: double buffering, address translation and shadow-stack
//! patching over the analyzed sample program.

use crate::common::{init_tracing, sample_module};
use rondel_core::seed::Seed;
use rondel_variant::cache::{CachePair, CacheRegion};
use rondel_variant::manager::{BufferState, Epoch, ModuleVariant, VariantManager};
use rondel_variant::rbbl;
use rondel_variant::Error;

const X_BASE: u64 = 0x40_0000;
const CC_BASE: u64 = X_BASE + (1 << 30);

fn attached_manager() -> VariantManager {
    let module = sample_module();
    let templates = rbbl::build_templates(&module).unwrap();
    let cache = CachePair::anonymous(0x1000).unwrap();
    let manager = VariantManager::new(Seed::from_hex(&"88".repeat(32)).unwrap());
    manager.add_module(ModuleVariant::new(
        "prot", templates, cache, X_BASE, 0x40, CC_BASE,
    ));
    manager
}

#[test]
fn translation_round_trip_is_byte_exact() {
    init_tracing();
    let manager = attached_manager();
    manager.generate(Epoch::First).unwrap();
    manager.generate(Epoch::Second).unwrap();

    // Addresses inside the block at original offset 0x14 (size 10 after
    // re-encoding), probed at several intra-block offsets.
    let entry = manager
        .cache_pc_for_original(X_BASE + 0x14, Epoch::First)
        .unwrap();
    for internal in [0u64, 1, 4, 9] {
        let old = entry + internal;
        let new = manager.new_pc_for_old(old, Epoch::Second).unwrap();
        let back = manager.new_pc_for_old(new, Epoch::First).unwrap();
        assert_eq!(back, old, "round trip drifted at +{internal}");
    }
}

#[test]
fn translation_requires_both_buffers_ready() {
    init_tracing();
    let manager = attached_manager();
    manager.generate(Epoch::First).unwrap();
    assert!(manager
        .new_pc_for_old(CC_BASE + 0x100, Epoch::Second)
        .is_none());
}

#[test]
fn shadow_stack_entries_are_rewritten_on_swap() {
    init_tracing();
    let manager = attached_manager();
    manager.generate(Epoch::First).unwrap();
    manager.generate(Epoch::Second).unwrap();

    let ra1 = manager
        .cache_pc_for_original(X_BASE + 0x19, Epoch::First)
        .unwrap();
    let ra2 = manager
        .cache_pc_for_original(X_BASE + 0x30, Epoch::First)
        .unwrap()
        + 2;
    let foreign = 0x7777_0000u64;

    let mut region = CacheRegion::anonymous(0x40).unwrap();
    let slice = region.as_mut_slice();
    slice[0x00..0x08].copy_from_slice(&ra1.to_le_bytes());
    slice[0x10..0x18].copy_from_slice(&foreign.to_le_bytes());
    slice[0x38..0x40].copy_from_slice(&ra2.to_le_bytes());
    manager.set_shadow_stack(region);

    let patched = manager.patch_shadow_stack(Epoch::Second).unwrap();
    assert_eq!(patched, 2);

    let expect1 = manager.new_pc_for_old(ra1, Epoch::Second).unwrap();
    let expect2 = manager.new_pc_for_old(ra2, Epoch::Second).unwrap();
    // Re-read through a fresh translation: entries now point into buffer 2,
    // foreign values and empty slots are untouched.
    manager
        .with_shadow_stack_bytes(|bytes| {
            assert_eq!(bytes[0x00..0x08], expect1.to_le_bytes());
            assert_eq!(bytes[0x10..0x18], foreign.to_le_bytes());
            assert_eq!(bytes[0x38..0x40], expect2.to_le_bytes());
        })
        .unwrap();
}

#[test]
fn regeneration_without_consumption_keeps_state_consistent() {
    init_tracing();
    let manager = attached_manager();
    manager.generate(Epoch::First).unwrap();
    let first_site = manager
        .cache_pc_for_original(X_BASE + 0x20, Epoch::First)
        .unwrap();

    // Generating again without consuming replaces the layout wholesale.
    manager.generate(Epoch::First).unwrap();
    assert!(manager.is_ready(Epoch::First));
    let second_site = manager
        .cache_pc_for_original(X_BASE + 0x20, Epoch::First)
        .unwrap();
    assert!(second_site >= CC_BASE);

    // Consuming clears the maps and resets the flag before the next cycle.
    manager.consume(Epoch::First).unwrap();
    assert!(!manager.is_ready(Epoch::First));
    assert!(manager
        .cache_pc_for_original(X_BASE + 0x20, Epoch::First)
        .is_none());
    assert_eq!(manager.state(Epoch::First), BufferState::Stale);

    manager.generate(Epoch::First).unwrap();
    assert!(manager.is_ready(Epoch::First));
    let _ = (first_site, second_site);
}

#[test]
fn worker_is_restartable_across_cycles() {
    init_tracing();
    let mut manager = attached_manager();
    manager.start_worker();
    // Starting twice is a no-op.
    manager.start_worker();
    let spins = manager
        .wait_ready(Epoch::First, rondel_variant::manager::DEFAULT_SPIN_BOUND)
        .unwrap();
    assert!(spins < rondel_variant::manager::DEFAULT_SPIN_BOUND);
    manager
        .wait_ready(Epoch::Second, rondel_variant::manager::DEFAULT_SPIN_BOUND)
        .unwrap();
    manager.stop_worker();

    manager.consume(Epoch::First).unwrap();
    manager.start_worker();
    manager
        .wait_ready(Epoch::First, rondel_variant::manager::DEFAULT_SPIN_BOUND)
        .unwrap();
    manager.stop_worker();
}

#[test]
fn swap_protocol_rejects_unready_buffers() {
    init_tracing();
    let manager = attached_manager();
    assert!(matches!(
        manager.activate(Epoch::First),
        Err(Error::NotReady(0))
    ));
    assert!(matches!(
        manager.consume(Epoch::Second),
        Err(Error::NotReady(1))
    ));
    assert!(matches!(
        manager.patch_shadow_stack(Epoch::Second),
        Err(Error::NotReady(_))
    ));
}
