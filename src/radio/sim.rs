//! Simulated radio driver.
//!
//! Fabricates a small fleet of virtual heart-rate monitors so the full
//! manager can run end to end without an ANT stick. Each virtual device
//! broadcasts a slowly drifting sinusoidal heart rate with a little jitter;
//! devices bound to a dedicated channel are delivered there as plain data
//! pages, and the wildcard channel hears one device per cycle, round-robin,
//! in extended form. Useful for demos and for exercising promotion, eviction
//! and rearm behavior against realistic timing.

use rand::Rng;
use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::ant;
use crate::config::SimConfig;
use crate::radio::{BroadcastHandler, RadioChannel, RadioError, RadioNode};

/// Device numbers for the virtual fleet start here.
pub const FIRST_DEVICE_ID: u16 = 10_000;

#[derive(Default)]
struct ChannelSlot {
    device_id: Option<u16>,
    open: bool,
    assigned: bool,
    handler: Option<BroadcastHandler>,
}

pub struct SimRadio {
    config: SimConfig,
    hardware_channels: usize,
    slots: Arc<Mutex<Vec<ChannelSlot>>>,
    stop: Arc<AtomicBool>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

struct SimChannel {
    index: usize,
    slots: Arc<Mutex<Vec<ChannelSlot>>>,
}

impl SimRadio {
    pub fn new(config: SimConfig, hardware_channels: usize) -> Self {
        Self {
            config,
            hardware_channels,
            slots: Arc::new(Mutex::new(Vec::new())),
            stop: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }
}

impl RadioNode for SimRadio {
    fn set_network_key(&self, network_number: u8, _key: &[u8; 8]) -> Result<(), RadioError> {
        debug!("simulated radio: network key set (network {})", network_number);
        Ok(())
    }

    fn new_channel(&self) -> Result<Box<dyn RadioChannel>, RadioError> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let assigned = slots.iter().filter(|s| s.assigned).count();
        if assigned >= self.hardware_channels {
            return Err(RadioError::NoFreeChannel);
        }
        // reuse a released slot so the vector stays bounded by the hardware
        // channel count, no matter how much promote/evict churn goes through
        let index = match slots.iter().position(|s| !s.assigned) {
            Some(index) => {
                slots[index] = ChannelSlot {
                    assigned: true,
                    ..ChannelSlot::default()
                };
                index
            }
            None => {
                slots.push(ChannelSlot {
                    assigned: true,
                    ..ChannelSlot::default()
                });
                slots.len() - 1
            }
        };
        Ok(Box::new(SimChannel {
            index,
            slots: Arc::clone(&self.slots),
        }))
    }

    fn start(&self) -> Result<(), RadioError> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return Ok(());
        }

        let slots = Arc::clone(&self.slots);
        let config = self.config.clone();
        let stop = Arc::clone(&self.stop);
        let period = Duration::from_secs_f64(1.0 / config.update_hz.max(0.5));

        *worker = Some(thread::spawn(move || {
            info!(
                "simulated radio running, {} virtual monitors at {:.1} Hz",
                config.devices, config.update_hz
            );
            let started = Instant::now();
            let mut cursor = 0usize;
            while !stop.load(Ordering::Relaxed) {
                thread::sleep(period);
                let t = started.elapsed().as_secs_f64();
                broadcast_cycle(&slots, &config, t, &mut cursor);
            }
            debug!("simulated radio worker stopped");
        }));
        Ok(())
    }

    fn stop(&self) -> Result<(), RadioError> {
        self.stop.store(true, Ordering::Relaxed);
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl RadioChannel for SimChannel {
    fn set_rf_freq(&mut self, _: u8) -> Result<(), RadioError> {
        Ok(())
    }

    fn set_period(&mut self, _: u16) -> Result<(), RadioError> {
        Ok(())
    }

    fn set_id(
        &mut self,
        device_id: u16,
        _device_type: u8,
        _transmission_type: u8,
    ) -> Result<(), RadioError> {
        self.slot(|s| s.device_id = Some(device_id));
        Ok(())
    }

    fn enable_extended_messages(&mut self, _: bool) -> Result<(), RadioError> {
        Ok(())
    }

    fn set_search_timeout(&mut self, _: u8) -> Result<(), RadioError> {
        Ok(())
    }

    fn set_broadcast_handler(&mut self, handler: BroadcastHandler) {
        self.slot(|s| s.handler = Some(handler));
    }

    fn clear_broadcast_handler(&mut self) {
        self.slot(|s| s.handler = None);
    }

    fn open(&mut self) -> Result<(), RadioError> {
        self.try_slot(|s| {
            if s.open {
                return Err(RadioError::WrongState);
            }
            s.open = true;
            Ok(())
        })
    }

    fn close(&mut self) -> Result<(), RadioError> {
        self.try_slot(|s| {
            if !s.open {
                return Err(RadioError::WrongState);
            }
            s.open = false;
            Ok(())
        })
    }

    fn unassign(&mut self) -> Result<(), RadioError> {
        self.try_slot(|s| {
            if s.open {
                return Err(RadioError::WrongState);
            }
            s.assigned = false;
            s.handler = None;
            s.device_id = None;
            Ok(())
        })
    }
}

impl SimChannel {
    fn slot(&self, f: impl FnOnce(&mut ChannelSlot)) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut slots[self.index]);
    }

    fn try_slot(
        &self,
        f: impl FnOnce(&mut ChannelSlot) -> Result<(), RadioError>,
    ) -> Result<(), RadioError> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut slots[self.index])
    }
}

/// One broadcast interval: dedicated channels hear their device's data page,
/// the wildcard hears one device (round-robin) in extended form.
fn broadcast_cycle(
    slots: &Mutex<Vec<ChannelSlot>>,
    config: &SimConfig,
    t: f64,
    cursor: &mut usize,
) {
    if config.devices == 0 {
        return;
    }
    let mut rng = rand::thread_rng();
    let slots = slots.lock().unwrap_or_else(PoisonError::into_inner);

    for i in 0..config.devices {
        let device_id = FIRST_DEVICE_ID + i as u16;
        let slot = slots
            .iter()
            .find(|s| s.open && s.assigned && s.device_id == Some(device_id));
        if let Some(slot) = slot {
            if let Some(handler) = &slot.handler {
                let mut page = [0u8; 8];
                page[7] = heart_rate_at(config, t, i, &mut rng);
                handler(&page);
            }
        }
    }

    let wildcard = slots
        .iter()
        .find(|s| s.open && s.assigned && s.device_id == Some(ant::WILDCARD_DEVICE_ID));
    if let Some(slot) = wildcard {
        if let Some(handler) = &slot.handler {
            let i = *cursor % config.devices;
            *cursor += 1;
            let device_id = FIRST_DEVICE_ID + i as u16;
            let heart_rate = heart_rate_at(config, t, i, &mut rng);
            handler(&ant::encode_extended(device_id, heart_rate));
        }
    }
}

fn heart_rate_at(config: &SimConfig, t: f64, index: usize, rng: &mut impl Rng) -> u8 {
    let phase = t + index as f64 * 0.1;
    let hr = config.base_hr
        + config.amplitude * (TAU * 0.05 * phase).sin()
        + rng.gen_range(-config.noise..=config.noise);
    hr.round().clamp(40.0, 200.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture() -> (BroadcastHandler, Arc<Mutex<Vec<Vec<u8>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: BroadcastHandler = Box::new(move |payload| {
            sink.lock().unwrap().push(payload.to_vec());
        });
        (handler, seen)
    }

    #[test]
    fn test_channel_state_machine() {
        let radio = SimRadio::new(SimConfig::default(), 2);
        let mut ch = radio.new_channel().unwrap();

        assert!(matches!(ch.close(), Err(RadioError::WrongState)));
        ch.open().unwrap();
        assert!(matches!(ch.open(), Err(RadioError::WrongState)));
        assert!(matches!(ch.unassign(), Err(RadioError::WrongState)));
        ch.close().unwrap();
        ch.unassign().unwrap();
    }

    #[test]
    fn test_hardware_channel_limit() {
        let radio = SimRadio::new(SimConfig::default(), 2);
        let _a = radio.new_channel().unwrap();
        let mut b = radio.new_channel().unwrap();
        assert!(matches!(
            radio.new_channel(),
            Err(RadioError::NoFreeChannel)
        ));

        // releasing a slot frees it up again
        b.unassign().unwrap();
        assert!(radio.new_channel().is_ok());
    }

    #[test]
    fn test_channel_churn_does_not_grow_slot_table() {
        let radio = SimRadio::new(SimConfig::default(), 2);

        // repeated assign/release churn, as promote/evict cycles produce
        for _ in 0..5 {
            let mut a = radio.new_channel().unwrap();
            let mut b = radio.new_channel().unwrap();
            a.unassign().unwrap();
            b.unassign().unwrap();
        }

        assert_eq!(radio.slots.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_wildcard_hears_fleet_round_robin() {
        let config = SimConfig {
            devices: 3,
            noise: 0.0,
            ..SimConfig::default()
        };
        let radio = SimRadio::new(config.clone(), 8);

        let mut wildcard = radio.new_channel().unwrap();
        wildcard
            .set_id(ant::WILDCARD_DEVICE_ID, ant::DEVICE_TYPE_HRM, 0)
            .unwrap();
        let (handler, seen) = capture();
        wildcard.set_broadcast_handler(handler);
        wildcard.open().unwrap();

        let mut cursor = 0;
        for _ in 0..3 {
            broadcast_cycle(&radio.slots, &config, 1.0, &mut cursor);
        }

        let payloads = seen.lock().unwrap();
        let ids: Vec<u16> = payloads
            .iter()
            .map(|p| ant::decode_extended(p).unwrap().device_id)
            .collect();
        assert_eq!(
            ids,
            vec![FIRST_DEVICE_ID, FIRST_DEVICE_ID + 1, FIRST_DEVICE_ID + 2]
        );
    }

    #[test]
    fn test_dedicated_channel_hears_only_its_device() {
        let config = SimConfig {
            devices: 2,
            noise: 0.0,
            ..SimConfig::default()
        };
        let radio = SimRadio::new(config.clone(), 8);

        let mut ch = radio.new_channel().unwrap();
        ch.set_id(FIRST_DEVICE_ID + 1, ant::DEVICE_TYPE_HRM, 0).unwrap();
        let (handler, seen) = capture();
        ch.set_broadcast_handler(handler);
        ch.open().unwrap();

        let mut cursor = 0;
        broadcast_cycle(&radio.slots, &config, 2.0, &mut cursor);

        let payloads = seen.lock().unwrap();
        assert_eq!(payloads.len(), 1);
        // plain data page, not extended
        assert_eq!(payloads[0].len(), 8);
        assert!(payloads[0][7] >= 40);
    }

    #[test]
    fn test_heart_rate_stays_in_range() {
        let config = SimConfig {
            base_hr: 190.0,
            amplitude: 40.0,
            noise: 5.0,
            ..SimConfig::default()
        };
        let mut rng = rand::thread_rng();
        for step in 0..200 {
            let hr = heart_rate_at(&config, step as f64 * 0.25, 0, &mut rng);
            assert!((40..=200).contains(&hr));
        }
    }
}
