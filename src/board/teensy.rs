use crate::board::{CardBus, HostBus};
use crate::config::*;
use core::arch::asm;
use core::fmt::Write;
use teensycore::prelude::*;

pub struct TeensyBoard {
    settle_ns: u64,
}

impl TeensyBoard {
    pub fn new() -> Self {
        let output_config: PadConfig = PadConfig {
            hysterisis: false,
            resistance: PullUpDown::PullUp100k,
            pull_keep: PullKeep::Pull,
            pull_keep_en: false,
            open_drain: false,
            speed: PinSpeed::Max200MHz,
            drive_strength: DriveStrength::Max,
            fast_slew_rate: true,
        };

        pin_pad_config(CARD_CS_PIN, output_config.clone());
        pin_pad_config(CARD_DI_PIN, output_config.clone());
        pin_pad_config(CARD_CLK_PIN, output_config.clone());
        pin_pad_config(READ_PULSE_PIN, output_config.clone());
        pin_pad_config(WRITE_PROTECT_PIN, output_config.clone());
        pin_pad_config(LED_PIN, output_config.clone());

        pin_mode(CARD_CS_PIN, Mode::Output);
        pin_mode(CARD_DI_PIN, Mode::Output);
        pin_mode(CARD_CLK_PIN, Mode::Output);
        pin_mode(READ_PULSE_PIN, Mode::Output);
        pin_mode(WRITE_PROTECT_PIN, Mode::Output);
        pin_mode(LED_PIN, Mode::Output);

        pin_out(CARD_CS_PIN, Power::High);
        pin_out(CARD_DI_PIN, Power::High);
        pin_out(CARD_CLK_PIN, Power::Low);
        pin_out(READ_PULSE_PIN, Power::Low);
        pin_out(WRITE_PROTECT_PIN, Power::Low);
        pin_out(LED_PIN, Power::Low);

        // Every input idles high: the card detect switch and the host lines are open collector.
        let pullup_config: PadConfig = PadConfig {
            hysterisis: false,
            resistance: PullUpDown::PullUp22k,
            pull_keep: PullKeep::Pull,
            pull_keep_en: true,
            open_drain: true,
            speed: PinSpeed::Max200MHz,
            drive_strength: DriveStrength::MaxDiv3,
            fast_slew_rate: true,
        };

        for pin in [
            CARD_DO_PIN,
            CARD_DETECT_PIN,
            WRITE_REQUEST_PIN,
            PHASE0_PIN,
            PHASE1_PIN,
            PHASE2_PIN,
            PHASE3_PIN,
            DRIVE_ENABLE_PIN,
            WRITE_DATA_PIN,
        ] {
            pin_pad_config(pin, pullup_config.clone());
            pin_mode(pin, Mode::Input);
        }

        return TeensyBoard {
            settle_ns: SLOW_SETTLE_NS as u64,
        };
    }
}

fn level(high: bool) -> Power {
    return if high { Power::High } else { Power::Low };
}

impl CardBus for TeensyBoard {
    fn select(&mut self, selected: bool) {
        // CS is active low
        pin_out(CARD_CS_PIN, level(!selected));
    }

    fn drive(&mut self, clock: bool, data: bool) {
        pin_out(CARD_DI_PIN, level(data));
        pin_out(CARD_CLK_PIN, level(clock));
    }

    fn sample(&mut self) -> bool {
        return pin_read_fast!(CARD_DO_PIN) > 0;
    }

    fn card_present(&self) -> bool {
        return pin_read_fast!(CARD_DETECT_PIN) == 0;
    }

    fn settle(&mut self) {
        wait_exact_ns(self.settle_ns);
    }
}

impl HostBus for TeensyBoard {
    fn phases(&self) -> u8 {
        let mut phases = 0u8;
        if pin_read_fast!(PHASE0_PIN) > 0 {
            phases |= 0b0001;
        }
        if pin_read_fast!(PHASE1_PIN) > 0 {
            phases |= 0b0010;
        }
        if pin_read_fast!(PHASE2_PIN) > 0 {
            phases |= 0b0100;
        }
        if pin_read_fast!(PHASE3_PIN) > 0 {
            phases |= 0b1000;
        }
        return phases;
    }

    fn drive_enabled(&self) -> bool {
        return pin_read_fast!(DRIVE_ENABLE_PIN) == 0;
    }

    fn write_request(&self) -> bool {
        return pin_read_fast!(WRITE_REQUEST_PIN) == 0;
    }

    fn write_data(&self) -> bool {
        return pin_read_fast!(WRITE_DATA_PIN) > 0;
    }

    fn set_read_pulse(&mut self, high: bool) {
        pin_out(READ_PULSE_PIN, level(high));
    }

    fn set_write_protect(&mut self, protect: bool) {
        pin_out(WRITE_PROTECT_PIN, level(protect));
    }

    fn set_activity(&mut self, on: bool) {
        pin_out(LED_PIN, level(on));
    }

    fn mask_interrupts(&mut self) {
        assembly!("cpsid i");
    }

    fn unmask_interrupts(&mut self) {
        assembly!("cpsie i");
    }
}

/// Log lines formatted into a fixed buffer and sent out the debug serial port.
pub struct SerialLogger;

struct LineBuffer {
    bytes: [u8; 128],
    len: usize,
}

impl Write for LineBuffer {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for &b in s.as_bytes() {
            // Long lines are cut short
            if self.len == self.bytes.len() {
                return Ok(());
            }
            self.bytes[self.len] = b;
            self.len += 1;
        }
        return Ok(());
    }
}

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        return metadata.level() <= log::max_level();
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut line = LineBuffer { bytes: [0; 128], len: 0 };
        let _ = write!(line, "[{}] {}", record.level(), record.args());
        debug_str(&line.bytes[..line.len]);
    }

    fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger;

pub fn init_logger(level: log::LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
