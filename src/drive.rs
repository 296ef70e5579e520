use crate::buffers::{BufferPool, SectorTag};
use crate::config::{SECTORS_PER_TRACK, TRACKS};
use crate::nibble::{SectorDecoder, ADDRESS_FIELD_LEN, DATA_FIELD_LEN, STREAM_BYTES};
use crate::sd::{Block, BLOCK_WIRE_BYTES};
use log::{trace, warn};

/*
 The head moves in quarter tracks. Energizing a single phase pulls the
 rotor toward that phase; how far (and which way) depends on where the
 rotor sits now. Each entry packs two signed 4-bit steps, indexed by
 (phase offset + position) mod 8.
*/
const STEPPER_TABLE: [u8; 4] = [0x0F, 0xED, 0x03, 0x21];

/// Innermost reachable position (track 34, last quarter).
pub const MAX_PHASE_TRACK: u8 = (TRACKS - 1) * 4 + 3;
/// Positions above this wrapped below zero and snap back to track 0.
const UNDERFLOW_GUARD: u8 = 196;

/// Bits of a prepared block that are shifted out to the host.
pub const STREAM_BITS: u16 = (STREAM_BYTES * 8) as u16;
/// Bits of a whole block read, payload plus checksum.
pub const BLOCK_BITS: u16 = (BLOCK_WIRE_BYTES * 8) as u16;

fn phase_offset(phases: u8) -> Option<u8> {
    return match phases {
        0b1000 => Some(2),
        0b0100 => Some(4),
        0b0010 => Some(6),
        0b0001 => Some(0),
        _ => None,
    };
}

/// Signed step for energizing `phases` with the head at `phase_track`.
pub fn stepper_delta(phase_track: u8, phases: u8) -> i8 {
    let offset = match phase_offset(phases) {
        Some(offset) => (offset + phase_track) & 7,
        None => return 0,
    };
    let packed = STEPPER_TABLE[(offset >> 1) as usize];
    let nibble = if offset & 1 != 0 { packed & 0x0F } else { packed >> 4 };
    // sign extend
    return ((nibble << 4) as i8) >> 4;
}

/// Sector the host writes next after finishing `sector`.
pub fn skew_after_write(sector: u8) -> u8 {
    let next = if sector == 15 || sector == 13 { sector + 2 } else { sector + 1 };
    return next & (SECTORS_PER_TRACK - 1);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Head {
    phase_track: u8,
    phases: u8,
    sector: u8,
}

impl Head {
    pub const fn new() -> Self {
        return Head {
            phase_track: 0,
            phases: 0,
            sector: 0,
        };
    }

    pub fn reset(&mut self) {
        self.phase_track = 0;
        self.sector = 0;
    }

    pub fn phase_track(&self) -> u8 {
        return self.phase_track;
    }

    pub fn track(&self) -> u8 {
        return self.phase_track >> 2;
    }

    pub fn sector(&self) -> u8 {
        return self.sector;
    }

    pub fn set_sector(&mut self, sector: u8) {
        self.sector = sector & (SECTORS_PER_TRACK - 1);
    }

    pub fn advance(&mut self) -> u8 {
        self.sector = (self.sector + 1) & (SECTORS_PER_TRACK - 1);
        return self.sector;
    }

    /**
    Feed the current phase lines. Only a change to exactly one energized
    phase moves the head. Returns true when the position changed.
    */
    pub fn on_stepper_change(&mut self, phases: u8) -> bool {
        let phases = phases & 0x0F;
        if phases == self.phases {
            return false;
        }
        self.phases = phases;

        let delta = stepper_delta(self.phase_track, phases);
        if delta == 0 {
            return false;
        }
        let before = self.phase_track;
        self.phase_track = self.phase_track.wrapping_add(delta as u8);
        if self.phase_track > UNDERFLOW_GUARD {
            self.phase_track = 0;
        }
        if self.phase_track > MAX_PHASE_TRACK {
            self.phase_track = MAX_PHASE_TRACK;
        }
        trace!("head {} -> {}", before, self.phase_track);
        return self.phase_track != before;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum FieldKind {
    Address,
    Data,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FieldEvent {
    /// A data field is complete in the current pool slot.
    Data { checksum_ok: bool },
    /// An address field, carrying its 4-and-4 sector number.
    Address { sector: u8 },
}

/**
Reassembles host write bits into disk bytes and picks address and data
fields out of the byte stream.

Bytes follow the Disk II latch rule: bits shift in until the top bit is
set. A field starts at `D5 AA` followed by `96` (address) or `AD` (data).
*/
pub struct Capture {
    shift: u8,
    history: u16,
    field: Option<FieldKind>,
    len: usize,
    address: [u8; ADDRESS_FIELD_LEN],
    decoder: SectorDecoder,
    checksum_ok: bool,
}

impl Capture {
    pub const fn new() -> Self {
        return Capture {
            shift: 0,
            history: 0,
            field: None,
            len: 0,
            address: [0; ADDRESS_FIELD_LEN],
            decoder: SectorDecoder::new(),
            checksum_ok: false,
        };
    }

    pub fn reset(&mut self) {
        self.shift = 0;
        self.history = 0;
        self.field = None;
        self.len = 0;
        self.decoder.reset();
    }

    pub fn latch(&mut self, bit: bool) -> Option<u8> {
        self.shift = (self.shift << 1) | bit as u8;
        if self.shift & 0x80 == 0 {
            return None;
        }
        let byte = self.shift;
        self.shift = 0;
        return Some(byte);
    }

    /// Take one disk byte. Data fields are written into `slot`.
    pub fn accept(&mut self, byte: u8, slot: &mut Block) -> Option<FieldEvent> {
        let previous = self.history;
        self.history = (self.history << 8) | byte as u16;

        let kind = match self.field {
            Some(kind) => kind,
            None => {
                if previous != 0xD5AA {
                    return None;
                }
                let kind = match byte {
                    0xAD => FieldKind::Data,
                    0x96 => FieldKind::Address,
                    _ => return None,
                };
                self.field = Some(kind);
                self.len = 3;
                match kind {
                    FieldKind::Data => {
                        slot[0..3].copy_from_slice(&[0xD5, 0xAA, byte]);
                        self.decoder.reset();
                        self.checksum_ok = false;
                    }
                    FieldKind::Address => {
                        self.address[0..3].copy_from_slice(&[0xD5, 0xAA, byte]);
                    }
                }
                return None;
            }
        };

        match kind {
            FieldKind::Data => {
                slot[self.len] = byte;
                self.len += 1;
                if let Some(verdict) = self.decoder.push(byte) {
                    self.checksum_ok = verdict.is_ok();
                }
                if self.len < DATA_FIELD_LEN {
                    return None;
                }
                self.field = None;
                return Some(FieldEvent::Data {
                    checksum_ok: self.checksum_ok,
                });
            }
            FieldKind::Address => {
                self.address[self.len] = byte;
                self.len += 1;
                if self.len < ADDRESS_FIELD_LEN {
                    return None;
                }
                self.field = None;
                let sector = ((self.address[7] & 0x55) << 1) | (self.address[8] & 0x55);
                return Some(FieldEvent::Address { sector });
            }
        }
    }
}

/// What the engine must do with the card after a captured field.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WriteAction {
    None,
    /// Pool is full: stop the read, flush all slots and prepare again.
    Flush,
    /// Formatting finished a track: stop the read and prepare again.
    Restart,
}

/**
The card-independent half of the drive: head, read cursor and capture
state. Everything here is shared between the foreground loop and the
bit-cell tick.
*/
pub struct Drive {
    pub head: Head,
    pub capture: Capture,
    /// Bit index into the block being streamed. `STREAM_BITS` or more
    /// means no read is left open on the card.
    pub cursor: u16,
    /// Set when the next sector must be primed by the foreground loop.
    pub prepare: bool,
    pub formatting: bool,
    pub format_sector: u8,
    pub protected: bool,
    pub enabled: bool,
}

impl Drive {
    pub const fn new() -> Self {
        return Drive {
            head: Head::new(),
            capture: Capture::new(),
            cursor: STREAM_BITS,
            prepare: true,
            formatting: false,
            format_sector: 0,
            protected: false,
            enabled: false,
        };
    }

    pub fn reset(&mut self) {
        self.head.reset();
        self.capture.reset();
        self.cursor = STREAM_BITS;
        self.prepare = true;
        self.formatting = false;
        self.format_sector = 0;
    }

    /// Bits of the open block read that still have to be clocked out
    /// before the card takes another command.
    pub fn pending_read_bits(&self) -> u16 {
        if self.cursor < STREAM_BITS {
            return BLOCK_BITS - self.cursor;
        }
        return 0;
    }

    pub fn on_field(&mut self, event: FieldEvent, pool: &mut BufferPool) -> WriteAction {
        match event {
            FieldEvent::Address { sector } => {
                self.format_sector = sector;
                self.formatting = true;
                return WriteAction::None;
            }
            FieldEvent::Data { checksum_ok } => {
                if !checksum_ok {
                    warn!("bad data field checksum on track {} sector {}", self.head.track(), self.head.sector());
                }
                if self.formatting {
                    self.head.set_sector(self.format_sector);
                    self.formatting = false;
                    if self.format_sector == SECTORS_PER_TRACK - 1 {
                        return WriteAction::Restart;
                    }
                    return WriteAction::None;
                }

                let tag = SectorTag {
                    track: self.head.track(),
                    sector: self.head.sector(),
                };
                self.head.set_sector(skew_after_write(tag.sector));
                if pool.commit(tag) {
                    return WriteAction::Flush;
                }
                return WriteAction::None;
            }
        }
    }
}
