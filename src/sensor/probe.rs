//! Sensor detection on the control bus
//!
//! The reset and power-down polarities of the attached chip are unknown
//! until it answers on the bus, so detection walks a fixed ladder of line
//! states and scans after each one.

use std::time::Duration;

use tracing::{debug, info, warn};

use super::Polarity;
use crate::error::SensorError;

/// Control bus (I2C/SCCB) used to talk to the sensor
pub trait RegisterBus: Send {
    /// Returns the first slave address that acknowledges, if any.
    fn scan(&mut self) -> Option<u8>;

    fn read(&mut self, slave: u8, reg: u16) -> Result<u8, SensorError>;

    fn write(&mut self, slave: u8, reg: u16, value: u8) -> Result<(), SensorError>;
}

/// Reset and power-down lines of the sensor
pub trait SensorGpio: Send {
    fn set_reset_line(&mut self, high: bool);

    fn set_power_down_line(&mut self, high: bool);
}

/// Blocking delay used for reset/settle sequences
pub trait Delay: Send {
    fn delay_ms(&mut self, ms: u32);
}

/// Delay backed by `std::thread::sleep`
#[derive(Debug, Default, Clone, Copy)]
pub struct StdDelay;

impl Delay for StdDelay {
    fn delay_ms(&mut self, ms: u32) {
        std::thread::sleep(Duration::from_millis(u64::from(ms)));
    }
}

/// Chips the engine knows how to identify
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChipId {
    Ov7725,
    Ov2640,
    Ov9650,
    Ov5640,
    Mt9v034,
    Lepton,
    /// Software sensor used for host-side runs
    Simulated,
}

enum IdRegister {
    Byte(u16),
    /// Chip without an id register
    Fixed(u8),
}

struct KnownChip {
    slave_addr: u8,
    id_reg: IdRegister,
    ids: &'static [(u8, ChipId)],
}

const KNOWN_CHIPS: &[KnownChip] = &[
    KnownChip {
        slave_addr: 0x21,
        id_reg: IdRegister::Byte(0x0A),
        ids: &[(0x77, ChipId::Ov7725)],
    },
    // OV2640 and OV9650 share a slave address
    KnownChip {
        slave_addr: 0x30,
        id_reg: IdRegister::Byte(0x0A),
        ids: &[(0x26, ChipId::Ov2640), (0x96, ChipId::Ov9650)],
    },
    KnownChip {
        slave_addr: 0x3C,
        id_reg: IdRegister::Byte(0x300A),
        ids: &[(0x56, ChipId::Ov5640)],
    },
    KnownChip {
        slave_addr: 0x5C,
        id_reg: IdRegister::Byte(0x00),
        ids: &[(0x13, ChipId::Mt9v034)],
    },
    KnownChip {
        slave_addr: 0x2A,
        id_reg: IdRegister::Fixed(0x54),
        ids: &[(0x54, ChipId::Lepton)],
    },
];

/// Outcome of a successful probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub slave_addr: u8,
    pub chip: ChipId,
    pub reset_pol: Polarity,
    pub pwdn_pol: Polarity,
}

/// Finds the sensor, its line polarities and its chip id.
///
/// Fallback ladder, one scan per step:
/// 1. reset active-high (pulse high then release low)
/// 2. reset active-low (drive high to release)
/// 3. power-down active-low (drive high to power up)
/// 4. reset active-high again with power-down active-low
pub fn probe(
    bus: &mut dyn RegisterBus,
    gpio: &mut dyn SensorGpio,
    delay: &mut dyn Delay,
    settle_ms: u32,
) -> Result<ProbeResult, SensorError> {
    // Power cycle
    gpio.set_power_down_line(true);
    delay.delay_ms(settle_ms);
    gpio.set_power_down_line(false);
    delay.delay_ms(settle_ms);

    let mut pwdn_pol = Polarity::ActiveHigh;
    let mut reset_pol = Polarity::ActiveHigh;

    gpio.set_reset_line(true);
    delay.delay_ms(settle_ms);
    gpio.set_reset_line(false);
    delay.delay_ms(settle_ms);
    let mut slave = bus.scan();

    if slave.is_none() {
        // Held in reset, so the reset line is active low
        reset_pol = Polarity::ActiveLow;
        debug!("no answer with active-high reset, retrying active-low");
        gpio.set_reset_line(true);
        delay.delay_ms(settle_ms);
        slave = bus.scan();
    }

    if slave.is_none() {
        pwdn_pol = Polarity::ActiveLow;
        debug!("no answer with active-low reset, retrying active-low power-down");
        gpio.set_power_down_line(true);
        delay.delay_ms(settle_ms);
        slave = bus.scan();
    }

    if slave.is_none() {
        reset_pol = Polarity::ActiveHigh;
        debug!("retrying active-high reset with active-low power-down");
        gpio.set_reset_line(false);
        delay.delay_ms(settle_ms);
        slave = bus.scan();
    }

    let Some(slave_addr) = slave else {
        warn!("sensor probe exhausted all line polarities");
        return Err(SensorError::NotDetected);
    };

    let chip = identify(bus, slave_addr)?;
    info!(
        "found {:?} at {:#04x} (reset {:?}, power-down {:?})",
        chip, slave_addr, reset_pol, pwdn_pol
    );

    Ok(ProbeResult {
        slave_addr,
        chip,
        reset_pol,
        pwdn_pol,
    })
}

fn identify(bus: &mut dyn RegisterBus, slave_addr: u8) -> Result<ChipId, SensorError> {
    let known = KNOWN_CHIPS
        .iter()
        .find(|c| c.slave_addr == slave_addr)
        .ok_or(SensorError::InvalidChipId {
            slave_addr,
            chip_id: 0,
        })?;

    let id = match known.id_reg {
        IdRegister::Byte(reg) => bus.read(slave_addr, reg)?,
        IdRegister::Fixed(id) => id,
    };

    known
        .ids
        .iter()
        .find(|(raw, _)| *raw == id)
        .map(|(_, chip)| *chip)
        .ok_or(SensorError::InvalidChipId {
            slave_addr,
            chip_id: u16::from(id),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Lines {
        reset_high: bool,
        pwdn_high: bool,
        scans: usize,
    }

    /// Chip answering only when both lines are in the given "running" state.
    struct Board {
        lines: Arc<Mutex<Lines>>,
        run_reset_high: bool,
        run_pwdn_high: bool,
        slave: u8,
        id: u8,
    }

    struct Gpio(Arc<Mutex<Lines>>);

    impl SensorGpio for Gpio {
        fn set_reset_line(&mut self, high: bool) {
            self.0.lock().unwrap().reset_high = high;
        }

        fn set_power_down_line(&mut self, high: bool) {
            self.0.lock().unwrap().pwdn_high = high;
        }
    }

    impl RegisterBus for Board {
        fn scan(&mut self) -> Option<u8> {
            let mut lines = self.lines.lock().unwrap();
            lines.scans += 1;
            (lines.reset_high == self.run_reset_high && lines.pwdn_high == self.run_pwdn_high)
                .then_some(self.slave)
        }

        fn read(&mut self, _slave: u8, _reg: u16) -> Result<u8, SensorError> {
            Ok(self.id)
        }

        fn write(&mut self, _slave: u8, _reg: u16, _value: u8) -> Result<(), SensorError> {
            Ok(())
        }
    }

    struct NoDelay;

    impl Delay for NoDelay {
        fn delay_ms(&mut self, _ms: u32) {}
    }

    fn run(run_reset_high: bool, run_pwdn_high: bool) -> (Result<ProbeResult, SensorError>, usize) {
        let lines = Arc::new(Mutex::new(Lines::default()));
        let mut board = Board {
            lines: lines.clone(),
            run_reset_high,
            run_pwdn_high,
            slave: 0x21,
            id: 0x77,
        };
        let mut gpio = Gpio(lines.clone());
        let result = probe(&mut board, &mut gpio, &mut NoDelay, 10);
        let scans = lines.lock().unwrap().scans;
        (result, scans)
    }

    #[test]
    fn active_high_reset_found_first() {
        let (result, scans) = run(false, false);
        let found = result.unwrap();
        assert_eq!(found.reset_pol, Polarity::ActiveHigh);
        assert_eq!(found.pwdn_pol, Polarity::ActiveHigh);
        assert_eq!(found.chip, ChipId::Ov7725);
        assert_eq!(scans, 1);
    }

    #[test]
    fn active_low_reset_converges() {
        let (result, scans) = run(true, false);
        let found = result.unwrap();
        assert_eq!(found.reset_pol, Polarity::ActiveLow);
        assert_eq!(found.pwdn_pol, Polarity::ActiveHigh);
        assert_eq!(scans, 2);
    }

    #[test]
    fn active_low_power_down_converges() {
        let (result, _) = run(true, true);
        let found = result.unwrap();
        assert_eq!(found.reset_pol, Polarity::ActiveLow);
        assert_eq!(found.pwdn_pol, Polarity::ActiveLow);

        let (result, scans) = run(false, true);
        let found = result.unwrap();
        assert_eq!(found.reset_pol, Polarity::ActiveHigh);
        assert_eq!(found.pwdn_pol, Polarity::ActiveLow);
        assert_eq!(scans, 4);
    }

    #[test]
    fn gives_up_after_four_scans() {
        let lines = Arc::new(Mutex::new(Lines::default()));
        struct Silent(Arc<Mutex<Lines>>);
        impl RegisterBus for Silent {
            fn scan(&mut self) -> Option<u8> {
                self.0.lock().unwrap().scans += 1;
                None
            }
            fn read(&mut self, _: u8, reg: u16) -> Result<u8, SensorError> {
                Err(SensorError::IoFailure { register: reg })
            }
            fn write(&mut self, _: u8, reg: u16, _: u8) -> Result<(), SensorError> {
                Err(SensorError::IoFailure { register: reg })
            }
        }
        let mut bus = Silent(lines.clone());
        let mut gpio = Gpio(lines.clone());
        let result = probe(&mut bus, &mut gpio, &mut NoDelay, 10);
        assert_eq!(result, Err(SensorError::NotDetected));
        assert_eq!(lines.lock().unwrap().scans, 4);
    }

    #[test]
    fn unknown_id_rejected() {
        let lines = Arc::new(Mutex::new(Lines::default()));
        let mut board = Board {
            lines: lines.clone(),
            run_reset_high: false,
            run_pwdn_high: false,
            slave: 0x30,
            id: 0x42,
        };
        let mut gpio = Gpio(lines);
        let result = probe(&mut board, &mut gpio, &mut NoDelay, 10);
        assert_eq!(
            result,
            Err(SensorError::InvalidChipId {
                slave_addr: 0x30,
                chip_id: 0x42
            })
        );
    }
}
