#[cfg(feature = "teensy")]
pub mod teensy;

/**
The bit-banged card lines: clock and data-in toward the card, data-out
back from it, an active-low chip select and the eject switch.
*/
pub trait CardBus {
    fn select(&mut self, selected: bool);
    /// Drive clock and data-in in one port write.
    fn drive(&mut self, clock: bool, data: bool);
    fn sample(&mut self) -> bool;
    fn card_present(&self) -> bool;
    /// Half-bit delay of the slow profile.
    fn settle(&mut self);
}

pub trait HostBus {
    /// Stepper phases 0-3 in bits 0-3.
    fn phases(&self) -> u8;
    fn drive_enabled(&self) -> bool;
    fn write_request(&self) -> bool;
    fn write_data(&self) -> bool;
    fn set_read_pulse(&mut self, high: bool);
    fn set_write_protect(&mut self, protect: bool);
    fn set_activity(&mut self, on: bool);
    fn mask_interrupts(&mut self);
    fn unmask_interrupts(&mut self);
}

pub trait Board: CardBus + HostBus {}

impl<T: CardBus + HostBus> Board for T {}
