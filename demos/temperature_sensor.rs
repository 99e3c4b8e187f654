//! Runs a simulated temperature sensor through the full life cycle: device
//! class registration, region creation, a write watchpoint bound to an
//! alarm callback, and a rule that separately evaluates "too hot" against
//! the same access stream.

use std::any::Any;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use physim::{
    AccessContext, DeviceConfig, DeviceHandle, DeviceOps, Permissions, PhyError, PhyResult,
    PhySim, SaveStateOutcome, WatchpointKind,
};

const REG_CURRENT: u64 = 0x1000;
const REG_SIZE: u64 = 16;

struct TempSensorState {
    current: AtomicU32,
    min: AtomicU32,
    max: AtomicU32,
}

impl TempSensorState {
    fn new() -> Self {
        Self {
            current: AtomicU32::new(25.0f32.to_bits()),
            min: AtomicU32::new(0.0f32.to_bits()),
            max: AtomicU32::new(100.0f32.to_bits()),
        }
    }
}

struct TempSensorOps;

impl DeviceOps for TempSensorOps {
    fn create(&self, device: &DeviceHandle, _config: &DeviceConfig) -> PhyResult<()> {
        device.set_user_data(Some(Arc::new(TempSensorState::new())));
        Ok(())
    }

    fn reset(&self, device: &DeviceHandle) -> PhyResult<()> {
        let state = state_of(device)?;
        state.current.store(25.0f32.to_bits(), Ordering::SeqCst);
        Ok(())
    }

    fn save_state(&self, device: &DeviceHandle, buffer: Option<&mut [u8]>) -> PhyResult<SaveStateOutcome> {
        let state = state_of(device)?;
        const LEN: usize = 12;
        match buffer {
            None => Ok(SaveStateOutcome::SizeRequired(LEN)),
            Some(buf) if buf.len() < LEN => Ok(SaveStateOutcome::SizeRequired(LEN)),
            Some(buf) => {
                buf[0..4].copy_from_slice(&state.current.load(Ordering::SeqCst).to_le_bytes());
                buf[4..8].copy_from_slice(&state.min.load(Ordering::SeqCst).to_le_bytes());
                buf[8..12].copy_from_slice(&state.max.load(Ordering::SeqCst).to_le_bytes());
                Ok(SaveStateOutcome::Written(LEN))
            }
        }
    }

    fn ioctl(&self, device: &DeviceHandle, _cmd: i32, _arg: &mut dyn Any) -> PhyResult<()> {
        let _ = state_of(device)?;
        Err(PhyError::NotSupported)
    }
}

fn state_of(device: &DeviceHandle) -> PhyResult<Arc<TempSensorState>> {
    device
        .user_data()
        .and_then(|d| d.downcast::<TempSensorState>().ok())
        .ok_or(PhyError::DeviceNotFound)
}

fn temperature_alarm(ctx: &AccessContext, _user_data: Option<&physim::UserData>) -> PhyResult<()> {
    let temp = f32::from_bits(ctx.value as u32);
    println!(
        "temperature alarm: device '{}' region '{}' reads {temp:.1}C",
        ctx.region.device().name(),
        ctx.region.name()
    );
    Ok(())
}

fn main() {
    env_logger::init();
    println!("temperature sensor demo");

    let sim = PhySim::init();

    sim.devices.register_class("temperature_sensor", Arc::new(TempSensorOps), None).unwrap();
    let device = sim
        .devices
        .create_instance("temperature_sensor", "room_temp", &DeviceConfig::new())
        .unwrap();

    let region = sim
        .regions
        .create(&device, "reg", REG_CURRENT, REG_SIZE, Permissions::READ | Permissions::WRITE)
        .unwrap();

    sim.regions.write_u32(&region, REG_CURRENT, 25.0f32.to_bits()).unwrap();

    let wp_id = sim
        .monitor
        .add_watchpoint(&region, REG_CURRENT, 4, WatchpointKind::Write)
        .unwrap();

    let action_id = sim.actions.create_callback(Arc::new(temperature_alarm), None);
    sim.monitor.bind_action(wp_id, action_id).unwrap();

    let rule_id = sim.rules.create("high_temp_rule").unwrap();
    sim.rules
        .set_condition(rule_id, Arc::new(|ctx: &AccessContext, _| f32::from_bits(ctx.value as u32) > 30.0), None)
        .unwrap();
    sim.rules.add_action(rule_id, action_id).unwrap();
    sim.rules.enable(rule_id).unwrap();

    println!("simulation starting");

    let mut temp = 25.0f32;
    for _ in 0..10 {
        temp += 2.0;
        println!("setting temperature to {temp:.1}C");

        sim.regions.write_u32(&region, REG_CURRENT, temp.to_bits()).unwrap();

        let ctx = AccessContext {
            region: region.clone(),
            address: REG_CURRENT,
            size: 4,
            value: temp.to_bits() as u64,
            kind: physim::AccessKind::Write,
        };
        if let Err(e) = sim.rules.evaluate(rule_id, &ctx) {
            eprintln!("rule evaluation failed: {e}");
        }

        sim.process_events().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    let mut state_size = match sim.devices.save_state(&device, None).unwrap() {
        SaveStateOutcome::SizeRequired(n) => n,
        SaveStateOutcome::Written(n) => n,
    };
    let mut buf = vec![0u8; state_size];
    if let SaveStateOutcome::Written(n) = sim.devices.save_state(&device, Some(&mut buf)).unwrap() {
        state_size = n;
        println!("device state saved, {state_size} bytes");
    }

    sim.cleanup();
    println!("demo finished");
}
