// Copyright (c) The lmk Authors.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::*;
use lmk_core::GateVerdict;
use lmk_core::IdleReason;
use lmk_core::LmkConfig;
use lmk_core::ShrinkControl;
use lmk_core::TriggerError;

fn config() -> LmkConfig {
    let mut config = LmkConfig::default();
    config.soft_reclaim.min_freeswap = 1000;
    config
}

fn reclaim_calls(world: &World) -> usize {
    world.reclaim.calls.load(Ordering::SeqCst)
}

/// The wake interval counts from construction; step past it.
fn settle(world: &World) {
    world.clock.advance(Duration::from_secs(5));
}

#[test]
fn trigger_validates_proof() {
    let world = World::new();
    let lmk = world.lmk(&config());

    assert_eq!(lmk.trigger("4,16"), Err(TriggerError::BadProof));
    assert_eq!(lmk.trigger("garbage"), Err(TriggerError::Malformed));
    assert!(!lmk.stats().reclaim_requested);
    assert_eq!(lmk.on_idle(IdleReason::Enter), GateVerdict::NotRequested);

    lmk.trigger("4,15").unwrap();
    assert!(lmk.stats().reclaim_requested);
}

#[test]
fn idle_wakes_worker_and_reclaims() {
    let world = World::new();
    world.reclaim.pages.store(500, Ordering::SeqCst);
    let lmk = world.lmk(&config());
    settle(&world);

    lmk.need_soft_reclaim();
    assert_eq!(lmk.on_idle(IdleReason::Enter), GateVerdict::Open);
    assert!(wait_for(|| reclaim_calls(&world) == 1 && !lmk.soft_reclaim_status()));
    assert_eq!(world.reclaim.requested.load(Ordering::SeqCst), 2048);

    // Effective attempt: request stays raised, but the interval applies.
    assert!(lmk.stats().reclaim_requested);
    world.clock.advance(Duration::from_secs(4));
    assert_eq!(lmk.on_idle(IdleReason::Enter), GateVerdict::TooSoon);
    world.clock.advance(Duration::from_secs(1));
    assert_eq!(lmk.on_idle(IdleReason::Exit), GateVerdict::Open);
    assert!(wait_for(|| reclaim_calls(&world) == 2 && !lmk.soft_reclaim_status()));

    let stats = lmk.stats();
    assert_eq!(stats.nr_reclaim_wakeups, 2);
    assert_eq!(stats.nr_reclaim_pages, 1000);
}

#[test]
fn ineffective_reclaim_cancels_request() {
    let world = World::new();
    world.reclaim.pages.store(10, Ordering::SeqCst);
    let lmk = world.lmk(&config());
    settle(&world);

    lmk.trigger("2,3").unwrap();
    assert_eq!(lmk.on_idle(IdleReason::Enter), GateVerdict::Open);
    assert!(wait_for(|| !lmk.soft_reclaim_status() && !lmk.stats().reclaim_requested));

    world.clock.advance(Duration::from_secs(60));
    assert_eq!(lmk.on_idle(IdleReason::Enter), GateVerdict::NotRequested);
    assert_eq!(reclaim_calls(&world), 1);
    assert_eq!(lmk.stats().nr_reclaim_cancelled, 1);

    // Raised again explicitly: the next idle event tries once more.
    lmk.trigger("2,3").unwrap();
    assert_eq!(lmk.on_idle(IdleReason::Enter), GateVerdict::Open);
    assert!(wait_for(|| reclaim_calls(&world) == 2));
}

#[test]
fn first_wake_waits_for_interval_after_start() {
    let world = World::new();
    world.reclaim.pages.store(500, Ordering::SeqCst);
    let lmk = world.lmk(&config());
    lmk.need_soft_reclaim();

    assert_eq!(lmk.on_idle(IdleReason::Enter), GateVerdict::TooSoon);
    world.clock.advance(Duration::from_millis(4999));
    assert_eq!(lmk.on_idle(IdleReason::Enter), GateVerdict::TooSoon);
    assert_eq!(lmk.stats().nr_reclaim_wakeups, 0);

    world.clock.advance(Duration::from_millis(1));
    assert_eq!(lmk.on_idle(IdleReason::Enter), GateVerdict::Open);
    assert!(wait_for(|| reclaim_calls(&world) == 1));
}

#[test]
fn gate_respects_system_activity() {
    let world = World::new();
    let lmk = world.lmk(&config());
    lmk.need_soft_reclaim();
    settle(&world);

    world.activity.kswapd.store(true, Ordering::SeqCst);
    assert_eq!(lmk.on_idle(IdleReason::Enter), GateVerdict::Busy);
    world.activity.kswapd.store(false, Ordering::SeqCst);

    world.activity.free_swap.store(999, Ordering::SeqCst);
    assert_eq!(lmk.on_idle(IdleReason::Enter), GateVerdict::LowSwap);
    world.activity.free_swap.store(1000, Ordering::SeqCst);

    world.activity.idle.store(false, Ordering::SeqCst);
    assert_eq!(lmk.on_idle(IdleReason::Enter), GateVerdict::NotIdle);
    world.activity.idle.store(true, Ordering::SeqCst);

    world.activity.load.store(3, Ordering::SeqCst);
    assert_eq!(lmk.on_idle(IdleReason::Other(7)), GateVerdict::NotIdle);
    world.activity.load.store(0, Ordering::SeqCst);

    assert_eq!(reclaim_calls(&world), 0);
    assert_eq!(lmk.on_idle(IdleReason::Enter), GateVerdict::Open);
}

#[test]
fn cancel_and_freeze() {
    let world = World::new();
    let lmk = world.lmk(&config());
    settle(&world);

    lmk.need_soft_reclaim();
    lmk.cancel_soft_reclaim();
    assert_eq!(lmk.on_idle(IdleReason::Enter), GateVerdict::NotRequested);

    lmk.need_soft_reclaim();
    lmk.freeze();
    assert!(lmk.stats().frozen);
    assert_eq!(lmk.on_idle(IdleReason::Enter), GateVerdict::Frozen);
    lmk.thaw();
    assert_eq!(lmk.on_idle(IdleReason::Enter), GateVerdict::Open);
}

#[test]
fn disabled_soft_reclaim_never_wakes() {
    let world = World::new();
    let lmk = world.lmk(&lmk_only());
    lmk.trigger("4,15").unwrap();
    assert_eq!(lmk.on_idle(IdleReason::Enter), GateVerdict::Disabled);
    assert_eq!(reclaim_calls(&world), 0);
}

#[test]
fn tunables_apply_to_worker() {
    let world = World::new();
    world.reclaim.pages.store(100, Ordering::SeqCst);
    let lmk = world.lmk(&config());

    lmk.params().set("nr_reclaim", "64").unwrap();
    lmk.params().set("min_reclaim", "100").unwrap();
    lmk.params().set("min_interval", "0").unwrap();

    lmk.need_soft_reclaim();
    assert_eq!(lmk.on_idle(IdleReason::Enter), GateVerdict::Open);
    assert!(wait_for(|| reclaim_calls(&world) == 1 && !lmk.soft_reclaim_status()));
    assert_eq!(world.reclaim.requested.load(Ordering::SeqCst), 64);
    // 100 >= 100: still requested, and no interval to wait for.
    assert!(lmk.stats().reclaim_requested);
    assert_eq!(lmk.on_idle(IdleReason::Enter), GateVerdict::Open);
}

#[test]
fn shutdown_stops_worker() {
    let world = World::new();
    let lmk = world.lmk(&config());
    lmk.need_soft_reclaim();
    lmk.shutdown();

    let stats = lmk.stats();
    assert!(!stats.reclaim_requested);
    assert!(!stats.reclaim_running);
    assert_eq!(lmk.on_idle(IdleReason::Enter), GateVerdict::Disabled);
    assert_eq!(lmk.on_pressure(ShrinkControl::scan(128)), 0);
}

#[test]
fn shutdown_with_wake_queued() {
    let world = World::new();
    world.reclaim.pages.store(500, Ordering::SeqCst);
    let lmk = world.lmk(&config());
    settle(&world);

    lmk.need_soft_reclaim();
    assert_eq!(lmk.on_idle(IdleReason::Enter), GateVerdict::Open);
    lmk.shutdown();

    // The worker has been joined. It either finished the wake before stop
    // landed or dropped it.
    let calls = reclaim_calls(&world);
    assert!(calls <= 1);
    let stats = lmk.stats();
    assert!(!stats.reclaim_running);
    assert!(!stats.reclaim_requested);

    world.clock.advance(Duration::from_secs(60));
    lmk.need_soft_reclaim();
    assert_eq!(lmk.on_idle(IdleReason::Enter), GateVerdict::Disabled);
    assert_eq!(reclaim_calls(&world), calls);
}
