//! Literal end-to-end scenarios exercising the full device → region →
//! monitor → action/rule pipeline through the public [`PhySim`] facade.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use physim::{AccessContext, DeviceConfig, DeviceHandle, DeviceOps, Permissions, PhyResult, PhySim, WatchpointKind};

struct NoopDevice;
impl DeviceOps for NoopDevice {
    fn create(&self, _device: &DeviceHandle, _config: &DeviceConfig) -> PhyResult<()> {
        Ok(())
    }
}

fn counting_action(sim: &PhySim, counter: Arc<AtomicU32>) -> u32 {
    let id = sim.actions.create_callback(
        Arc::new(move |_ctx, _data| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
        None,
    );
    id
}

#[test]
fn scenario_1_region_read_write_roundtrip() {
    let sim = PhySim::init();
    sim.devices.register_class("tmp", Arc::new(NoopDevice), None).unwrap();
    let device = sim.devices.create_instance("tmp", "room", &DeviceConfig::new()).unwrap();
    let region = sim
        .regions
        .create(&device, "reg", 0x1000, 0x10, Permissions::READ | Permissions::WRITE)
        .unwrap();
    sim.regions.write_u32(&region, 0x1000, 0x41820000).unwrap();
    assert_eq!(sim.regions.read_u32(&region, 0x1000).unwrap(), 0x41820000);
}

#[test]
fn scenario_2_watchpoint_enable_disable_toggles_dispatch() {
    let sim = PhySim::init();
    sim.devices.register_class("tmp", Arc::new(NoopDevice), None).unwrap();
    let device = sim.devices.create_instance("tmp", "room", &DeviceConfig::new()).unwrap();
    let region = sim
        .regions
        .create(&device, "reg", 0x1000, 0x10, Permissions::READ | Permissions::WRITE)
        .unwrap();

    let counter = Arc::new(AtomicU32::new(0));
    let action_id = counting_action(&sim, Arc::clone(&counter));
    let wp_id = sim.monitor.add_watchpoint(&region, 0x1000, 4, WatchpointKind::Write).unwrap();
    sim.monitor.bind_action(wp_id, action_id).unwrap();

    sim.regions.write_u32(&region, 0x1000, 1).unwrap();
    sim.regions.write_u32(&region, 0x1000, 2).unwrap();
    sim.regions.write_u32(&region, 0x1000, 3).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 3);

    sim.monitor.disable_watchpoint(wp_id).unwrap();
    sim.regions.write_u32(&region, 0x1000, 4).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 3);

    sim.monitor.enable_watchpoint(wp_id).unwrap();
    sim.regions.write_u32(&region, 0x1000, 5).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 4);
}

#[test]
fn scenario_3_value_write_fires_only_on_target_value() {
    let sim = PhySim::init();
    sim.devices.register_class("tmp", Arc::new(NoopDevice), None).unwrap();
    let device = sim.devices.create_instance("tmp", "room", &DeviceConfig::new()).unwrap();
    let region = sim
        .regions
        .create(&device, "reg", 0x1000, 0x10, Permissions::READ | Permissions::WRITE)
        .unwrap();

    let counter = Arc::new(AtomicU32::new(0));
    let action_id = counting_action(&sim, Arc::clone(&counter));
    let wp_id = sim
        .monitor
        .add_watchpoint(&region, 0x1000, 4, WatchpointKind::ValueWrite(0x42280000))
        .unwrap();
    sim.monitor.bind_action(wp_id, action_id).unwrap();

    sim.regions.write_u32(&region, 0x1000, 0x41200000).unwrap();
    sim.regions.write_u32(&region, 0x1000, 0x42280000).unwrap();
    sim.regions.write_u32(&region, 0x1000, 0x42880000).unwrap();

    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn scenario_4_rule_evaluates_predicate_over_contexts() {
    let sim = PhySim::init();
    sim.devices.register_class("tmp", Arc::new(NoopDevice), None).unwrap();
    let device = sim.devices.create_instance("tmp", "room", &DeviceConfig::new()).unwrap();
    let region = sim
        .regions
        .create(&device, "reg", 0x1000, 0x10, Permissions::READ | Permissions::WRITE)
        .unwrap();

    let counter = Arc::new(AtomicU32::new(0));
    let action_id = counting_action(&sim, Arc::clone(&counter));

    let rule_id = sim.rules.create("high").unwrap();
    sim.rules.set_condition(rule_id, Arc::new(|ctx: &AccessContext, _| ctx.value > 30), None).unwrap();
    sim.rules.add_action(rule_id, action_id).unwrap();
    sim.rules.enable(rule_id).unwrap();

    for value in [25u64, 31, 29, 40] {
        let ctx = AccessContext {
            region: region.clone(),
            address: 0x1000,
            size: 4,
            value,
            kind: physim::AccessKind::Write,
        };
        sim.rules.evaluate(rule_id, &ctx).unwrap();
    }

    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn scenario_5_watchpoint_added_mid_callback_does_not_fire_for_in_flight_access() {
    let sim = Arc::new(PhySim::init());
    sim.devices.register_class("tmp", Arc::new(NoopDevice), None).unwrap();
    let device = sim.devices.create_instance("tmp", "room", &DeviceConfig::new()).unwrap();
    let region = sim
        .regions
        .create(&device, "reg", 0x1000, 0x10, Permissions::READ | Permissions::WRITE)
        .unwrap();

    let second_fired = Arc::new(AtomicU32::new(0));
    let second_region = region.clone();
    let second_fired_for_closure = Arc::clone(&second_fired);
    let sim_for_closure = Arc::clone(&sim);

    let spawn_second_action = sim.actions.create_callback(
        Arc::new(move |_ctx, _data| {
            sim_for_closure
                .monitor
                .add_watchpoint(&second_region, 0x1004, 4, WatchpointKind::Write)
                .map(|new_id| {
                    let second_fired = Arc::clone(&second_fired_for_closure);
                    let action_id = sim_for_closure.actions.create_callback(
                        Arc::new(move |_ctx, _data| {
                            second_fired.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }),
                        None,
                    );
                    sim_for_closure.monitor.bind_action(new_id, action_id).unwrap();
                })
                .unwrap();
            Ok(())
        }),
        None,
    );

    let wp_id = sim.monitor.add_watchpoint(&region, 0x1000, 4, WatchpointKind::Write).unwrap();
    sim.monitor.bind_action(wp_id, spawn_second_action).unwrap();

    // Triggers wp_id's callback, which adds a new watchpoint on 0x1004.
    sim.regions.write_u32(&region, 0x1000, 1).unwrap();
    assert_eq!(second_fired.load(Ordering::SeqCst), 0, "new watchpoint must not fire for the access already in flight");

    // A fresh access to the newly watched address now fires it.
    sim.regions.write_u32(&region, 0x1004, 2).unwrap();
    assert_eq!(second_fired.load(Ordering::SeqCst), 1);
}

#[test]
fn scenario_6_concurrent_creates_yield_exactly_1000_distinct_instances() {
    let sim = Arc::new(PhySim::init());
    sim.devices.register_class("tmp", Arc::new(NoopDevice), None).unwrap();

    let mut handles = Vec::new();
    for t in 0..2 {
        let sim = Arc::clone(&sim);
        handles.push(std::thread::spawn(move || {
            for i in 0..500 {
                let name = format!("dev-{t}-{i}");
                sim.devices.create_instance("tmp", &name, &DeviceConfig::new()).unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let mut found = 0;
    for t in 0..2 {
        for i in 0..500 {
            if sim.devices.find_by_name(&format!("dev-{t}-{i}")).is_some() {
                found += 1;
            }
        }
    }
    assert_eq!(found, 1000);
}
