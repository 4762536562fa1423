use std::sync::{Arc, Mutex};

use framegrab::sensor::{probe, ChipId, Delay, Polarity, ProbeResult, RegisterBus, SensorGpio};
use framegrab::SensorError;

#[derive(Debug, Default)]
struct Lines {
    reset: bool,
    pwdn: bool,
    delays: Vec<u32>,
    reads: Vec<(u8, u16)>,
}

/// A chip that only answers while the lines sit in one state.
struct Chip {
    lines: Arc<Mutex<Lines>>,
    slave: u8,
    awake: (bool, bool),
    registers: Vec<(u16, u8)>,
}

struct Gpio(Arc<Mutex<Lines>>);

struct Clock(Arc<Mutex<Lines>>);

impl RegisterBus for Chip {
    fn scan(&mut self) -> Option<u8> {
        let lines = self.lines.lock().unwrap();
        ((lines.reset, lines.pwdn) == self.awake).then_some(self.slave)
    }

    fn read(&mut self, slave: u8, reg: u16) -> Result<u8, SensorError> {
        self.lines.lock().unwrap().reads.push((slave, reg));
        self.registers
            .iter()
            .find(|(r, _)| *r == reg)
            .map(|(_, v)| *v)
            .ok_or(SensorError::IoFailure { register: reg })
    }

    fn write(&mut self, _slave: u8, _reg: u16, _value: u8) -> Result<(), SensorError> {
        Ok(())
    }
}

impl SensorGpio for Gpio {
    fn set_reset_line(&mut self, high: bool) {
        self.0.lock().unwrap().reset = high;
    }

    fn set_power_down_line(&mut self, high: bool) {
        self.0.lock().unwrap().pwdn = high;
    }
}

impl Delay for Clock {
    fn delay_ms(&mut self, ms: u32) {
        self.0.lock().unwrap().delays.push(ms);
    }
}

fn run(
    slave: u8,
    awake: (bool, bool),
    registers: Vec<(u16, u8)>,
) -> (Result<ProbeResult, SensorError>, Arc<Mutex<Lines>>) {
    let lines = Arc::new(Mutex::new(Lines::default()));
    let mut chip = Chip {
        lines: lines.clone(),
        slave,
        awake,
        registers,
    };
    let mut gpio = Gpio(lines.clone());
    let mut clock = Clock(lines.clone());
    let result = probe(&mut chip, &mut gpio, &mut clock, 5);
    (result, lines)
}

#[test]
fn active_low_lines_found_on_third_step() {
    let (result, lines) = run(0x30, (true, true), vec![(0x0A, 0x26)]);
    assert_eq!(
        result.unwrap(),
        ProbeResult {
            slave_addr: 0x30,
            chip: ChipId::Ov2640,
            reset_pol: Polarity::ActiveLow,
            pwdn_pol: Polarity::ActiveLow,
        }
    );
    let lines = lines.lock().unwrap();
    assert_eq!(lines.delays, vec![5; 6]);
    assert_eq!(lines.reads, vec![(0x30, 0x0A)]);
}

#[test]
fn last_step_reads_wide_id_register() {
    let (result, lines) = run(0x3C, (false, true), vec![(0x300A, 0x56)]);
    let found = result.unwrap();
    assert_eq!(found.chip, ChipId::Ov5640);
    assert_eq!(found.reset_pol, Polarity::ActiveHigh);
    assert_eq!(found.pwdn_pol, Polarity::ActiveLow);
    assert_eq!(lines.lock().unwrap().reads, vec![(0x3C, 0x300A)]);
}

#[test]
fn fixed_id_chip_is_not_read() {
    let (result, lines) = run(0x2A, (false, false), Vec::new());
    assert_eq!(result.unwrap().chip, ChipId::Lepton);
    assert!(lines.lock().unwrap().reads.is_empty());
}

#[test]
fn unknown_answers_are_reported() {
    let (result, _) = run(0x42, (false, false), Vec::new());
    assert_eq!(
        result.unwrap_err(),
        SensorError::InvalidChipId {
            slave_addr: 0x42,
            chip_id: 0
        }
    );

    let (result, _) = run(0x21, (false, false), vec![(0x0A, 0x99)]);
    assert!(matches!(
        result,
        Err(SensorError::InvalidChipId {
            slave_addr: 0x21,
            chip_id: 0x99
        })
    ));

    let (result, _) = run(0x5C, (false, false), Vec::new());
    assert_eq!(
        result.unwrap_err(),
        SensorError::IoFailure { register: 0x00 }
    );
}

#[test]
fn ladder_stops_at_first_answer() {
    let (result, lines) = run(0x21, (true, false), vec![(0x0A, 0x77)]);
    let found = result.unwrap();
    assert_eq!(found.chip, ChipId::Ov7725);
    assert_eq!(found.reset_pol, Polarity::ActiveLow);
    assert_eq!(found.pwdn_pol, Polarity::ActiveHigh);
    assert_eq!(lines.lock().unwrap().delays.len(), 5);
}

#[test]
fn silent_bus_exhausts_ladder() {
    let lines = Arc::new(Mutex::new(Lines::default()));
    let mut gpio = Gpio(lines.clone());
    let mut clock = Clock(lines.clone());
    assert_eq!(
        probe(&mut NeverAnswers, &mut gpio, &mut clock, 1).unwrap_err(),
        SensorError::NotDetected
    );
    let lines = lines.lock().unwrap();
    assert_eq!(lines.delays, vec![1; 7]);
    assert_eq!((lines.reset, lines.pwdn), (false, true));
}

struct NeverAnswers;

impl RegisterBus for NeverAnswers {
    fn scan(&mut self) -> Option<u8> {
        None
    }

    fn read(&mut self, _slave: u8, reg: u16) -> Result<u8, SensorError> {
        Err(SensorError::IoFailure { register: reg })
    }

    fn write(&mut self, _slave: u8, reg: u16, _value: u8) -> Result<(), SensorError> {
        Err(SensorError::IoFailure { register: reg })
    }
}
