#![allow(internal_features)]
#![feature(lang_items)]
#![no_std]
#![no_main]

use core::arch::asm;
use sdisk2::board::teensy::{init_logger, TeensyBoard};
use sdisk2::config::BIT_CELL_NS;
use sdisk2::timing::TickPacer;
use sdisk2::Emulator;
use teensycore::prelude::*;

teensycore::main!({
    init_logger(log::LevelFilter::Info);
    debug_str(b"sdisk2 starting");

    let mut emulator = Emulator::new(TeensyBoard::new());
    let mut pacer = TickPacer::new(nanos(), BIT_CELL_NS);

    loop {
        // The bit cell wins over everything else the foreground does.
        if pacer.due(nanos()) {
            emulator.service_tick();
            continue;
        }
        emulator.poll();
        assembly!("nop");
    }
});
