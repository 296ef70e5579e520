use crate::board::CardBus;
use crate::config::{SECTORS_PER_TRACK, TRACKS, VOLUME};
use crate::error::{DiskError, Result};
use crate::fat16::{ImageChain, Volume};
use crate::sd::{Block, SdCard, BLOCK_SIZE};
use log::{debug, info};

pub const RAW_SECTOR_SIZE: usize = 256;
pub const AUX_NIBBLES: usize = 86;
/// Auxiliary plus primary nibbles plus the trailing checksum nibble.
pub const DATA_NIBBLES: usize = AUX_NIBBLES + RAW_SECTOR_SIZE + 1;

/*
 Working image block layout. Every block holds one physical sector exactly
 as the drive head would see it:

 0x000  22 x FF self-sync
 0x016  12 byte sync pattern
 0x022  D5 AA 96, volume/track/sector/checksum in 4-and-4, DE AA EB
 0x030  5 x FF
 0x035  D5 AA AD, 86 aux nibbles, 256 primary nibbles, checksum nibble
 0x18F  DE AA EB
 0x192  14 x FF
 0x1A0  zero padding
*/
pub const SYNC_LEN: usize = 22;
pub const SYNC_PATTERN_OFFSET: usize = 0x16;
pub const ADDRESS_FIELD: usize = 0x22;
pub const ADDRESS_EPILOGUE: usize = 0x2D;
pub const DATA_FIELD: usize = 0x35;
pub const DATA_BODY: usize = 0x38;
pub const DATA_EPILOGUE: usize = 0x18F;
pub const GAP3: usize = 0x192;
pub const PADDING: usize = 0x1A0;

/// Bytes of a block that are actually streamed to the host.
pub const STREAM_BYTES: usize = GAP3;

/// A captured data field: prologue, nibbles and checksum.
pub const DATA_FIELD_LEN: usize = 3 + DATA_NIBBLES;
/// A captured address field up to the end of its sector pair.
pub const ADDRESS_FIELD_LEN: usize = 9;

pub const ADDRESS_PROLOGUE: [u8; 3] = [0xD5, 0xAA, 0x96];
pub const DATA_PROLOGUE: [u8; 3] = [0xD5, 0xAA, 0xAD];
pub const EPILOGUE: [u8; 3] = [0xDE, 0xAA, 0xEB];

const SYNC_PATTERN: [u8; 12] = [0x03, 0xFC, 0xFF, 0x3F, 0xCF, 0xF3, 0xFC, 0xFF, 0x3F, 0xCF, 0xF3, 0xFC];

pub const ENC_TABLE: [u8; 64] = [
    0x96, 0x97, 0x9A, 0x9B, 0x9D, 0x9E, 0x9F, 0xA6, 0xA7, 0xAB, 0xAC, 0xAD, 0xAE, 0xAF, 0xB2, 0xB3, 0xB4, 0xB5,
    0xB6, 0xB7, 0xB9, 0xBA, 0xBB, 0xBC, 0xBD, 0xBE, 0xBF, 0xCB, 0xCD, 0xCE, 0xCF, 0xD3, 0xD6, 0xD7, 0xD9, 0xDA,
    0xDB, 0xDC, 0xDD, 0xDE, 0xDF, 0xE5, 0xE6, 0xE7, 0xE9, 0xEA, 0xEB, 0xEC, 0xED, 0xEE, 0xEF, 0xF2, 0xF3, 0xF4,
    0xF5, 0xF6, 0xF7, 0xF9, 0xFA, 0xFB, 0xFC, 0xFD, 0xFE, 0xFF,
];

const INVALID: u8 = 0xFF;

/// Disk byte back to 6-bit value, `INVALID` for bytes outside the table.
pub const DEC_TABLE: [u8; 256] = build_decode_table();

const fn build_decode_table() -> [u8; 256] {
    let mut table = [INVALID; 256];
    let mut i = 0;
    while i < ENC_TABLE.len() {
        table[ENC_TABLE[i] as usize] = i as u8;
        i += 1;
    }
    return table;
}

/// Physical sector that holds logical (DOS 3.3) sector `n` of a track.
pub const PHYSICAL_SECTOR: [u8; 16] = [0, 13, 11, 9, 7, 5, 3, 1, 14, 12, 10, 8, 6, 4, 2, 15];

// Low two bits, swapped, placed at bits 0, 2 and 4 of an aux nibble.
const FLIP_BIT1: [u8; 4] = [0, 2, 1, 3];
const FLIP_BIT2: [u8; 4] = [0, 8, 4, 12];
const FLIP_BIT3: [u8; 4] = [0, 32, 16, 48];

/// Odd-even ("4-and-4") split of a byte. Both halves have every odd bit set.
pub fn encode_44(value: u8) -> [u8; 2] {
    return [(value >> 1) | 0xAA, value | 0xAA];
}

pub fn decode_44(odd: u8, even: u8) -> u8 {
    return ((odd & 0x55) << 1) | (even & 0x55);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AddressField {
    pub volume: u8,
    pub track: u8,
    pub sector: u8,
}

impl AddressField {
    pub fn checksum(&self) -> u8 {
        return self.volume ^ self.track ^ self.sector;
    }

    /// The eight bytes between the prologue and the epilogue.
    pub fn encode(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0..2].copy_from_slice(&encode_44(self.volume));
        out[2..4].copy_from_slice(&encode_44(self.track));
        out[4..6].copy_from_slice(&encode_44(self.sector));
        out[6..8].copy_from_slice(&encode_44(self.checksum()));
        return out;
    }

    /// Inverse of `encode`. Fails when the checksum pair does not match.
    pub fn decode(raw: &[u8]) -> Result<AddressField> {
        if raw.len() < 8 {
            return Err(DiskError::BadField);
        }
        let field = AddressField {
            volume: decode_44(raw[0], raw[1]),
            track: decode_44(raw[2], raw[3]),
            sector: decode_44(raw[4], raw[5]),
        };
        if decode_44(raw[6], raw[7]) != field.checksum() {
            return Err(DiskError::BadField);
        }
        return Ok(field);
    }
}

/// Everything in front of the data field prologue for one sector.
pub fn sector_header(field: AddressField) -> [u8; DATA_FIELD] {
    let mut out = [0xFFu8; DATA_FIELD];
    out[SYNC_PATTERN_OFFSET..ADDRESS_FIELD].copy_from_slice(&SYNC_PATTERN);
    out[ADDRESS_FIELD..ADDRESS_FIELD + 3].copy_from_slice(&ADDRESS_PROLOGUE);
    out[ADDRESS_FIELD + 3..ADDRESS_EPILOGUE].copy_from_slice(&field.encode());
    out[ADDRESS_EPILOGUE..ADDRESS_EPILOGUE + 3].copy_from_slice(&EPILOGUE);
    return out;
}

/// Lay down the parts of a working image block that are the same for
/// every sector: sync runs, prologues, epilogues and padding.
pub fn write_frame(dst: &mut Block) {
    dst[..SYNC_LEN].fill(0xFF);
    dst[SYNC_PATTERN_OFFSET..ADDRESS_FIELD].copy_from_slice(&SYNC_PATTERN);
    dst[ADDRESS_FIELD..ADDRESS_FIELD + 3].copy_from_slice(&ADDRESS_PROLOGUE);
    dst[ADDRESS_EPILOGUE..ADDRESS_EPILOGUE + 3].copy_from_slice(&EPILOGUE);
    dst[ADDRESS_EPILOGUE + 3..DATA_FIELD].fill(0xFF);
    dst[DATA_FIELD..DATA_BODY].copy_from_slice(&DATA_PROLOGUE);
    dst[DATA_EPILOGUE..GAP3].copy_from_slice(&EPILOGUE);
    dst[GAP3..PADDING].fill(0xFF);
    dst[PADDING..].fill(0);
}

pub fn write_address(dst: &mut Block, field: AddressField) {
    dst[ADDRESS_FIELD + 3..ADDRESS_EPILOGUE].copy_from_slice(&field.encode());
}

/**
6-and-2 encode 256 bytes of `src` into the first `DATA_NIBBLES` bytes of
`out`. Every 6-bit value is XORed with the previous value before the
table lookup; the last value alone forms the checksum nibble.
*/
pub fn encode_data(src: &[u8], out: &mut [u8]) {
    let mut previous = 0u8;
    for i in 0..AUX_NIBBLES {
        let mut x = FLIP_BIT1[(src[i] & 3) as usize] | FLIP_BIT2[(src[i + AUX_NIBBLES] & 3) as usize];
        if i + 2 * AUX_NIBBLES < RAW_SECTOR_SIZE {
            x |= FLIP_BIT3[(src[i + 2 * AUX_NIBBLES] & 3) as usize];
        }
        out[i] = ENC_TABLE[(x ^ previous) as usize];
        previous = x;
    }
    for i in 0..RAW_SECTOR_SIZE {
        let x = src[i] >> 2;
        out[AUX_NIBBLES + i] = ENC_TABLE[(x ^ previous) as usize];
        previous = x;
    }
    out[DATA_NIBBLES - 1] = ENC_TABLE[previous as usize];
}

pub fn encode_sector(src: &[u8], field: AddressField, dst: &mut Block) {
    write_frame(dst);
    write_address(dst, field);
    encode_data(src, &mut dst[DATA_BODY..DATA_EPILOGUE]);
}

/**
Incremental 6-and-2 decoder. Feed it the data field nibbles one at a time
as they arrive; once the checksum nibble is in, `sector` rebuilds the
256 source bytes.
*/
pub struct SectorDecoder {
    values: [u8; DATA_NIBBLES - 1],
    count: usize,
    previous: u8,
    invalid: bool,
}

impl SectorDecoder {
    pub const fn new() -> Self {
        return SectorDecoder {
            values: [0; DATA_NIBBLES - 1],
            count: 0,
            previous: 0,
            invalid: false,
        };
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.previous = 0;
        self.invalid = false;
    }

    /// Returns `None` while more nibbles are needed, then the verdict.
    pub fn push(&mut self, nibble: u8) -> Option<Result<()>> {
        if self.count >= DATA_NIBBLES {
            return Some(Err(DiskError::BadField));
        }
        let value = DEC_TABLE[nibble as usize];
        if value == INVALID {
            self.invalid = true;
        }

        if self.count == DATA_NIBBLES - 1 {
            self.count += 1;
            if self.invalid || value != self.previous {
                return Some(Err(DiskError::BadField));
            }
            return Some(Ok(()));
        }

        let x = (value ^ self.previous) & 0x3F;
        self.values[self.count] = x;
        self.previous = x;
        self.count += 1;
        return None;
    }

    pub fn sector(&self, out: &mut [u8]) {
        for i in 0..RAW_SECTOR_SIZE {
            let aux = self.values[i % AUX_NIBBLES] >> ((i / AUX_NIBBLES) * 2);
            out[i] = (self.values[AUX_NIBBLES + i] << 2) | FLIP_BIT1[(aux & 3) as usize];
        }
    }
}

impl Default for SectorDecoder {
    fn default() -> Self {
        return Self::new();
    }
}

pub fn decode_sector(block: &[u8]) -> Result<(AddressField, [u8; RAW_SECTOR_SIZE])> {
    if block.len() < GAP3
        || block[ADDRESS_FIELD..ADDRESS_FIELD + 3] != ADDRESS_PROLOGUE
        || block[DATA_FIELD..DATA_BODY] != DATA_PROLOGUE
    {
        return Err(DiskError::BadField);
    }
    let field = AddressField::decode(&block[ADDRESS_FIELD + 3..ADDRESS_EPILOGUE])?;

    let mut decoder = SectorDecoder::new();
    let mut verdict = None;
    for &nibble in &block[DATA_BODY..DATA_BODY + DATA_NIBBLES] {
        verdict = decoder.push(nibble);
    }
    match verdict {
        Some(Ok(())) => {}
        Some(Err(err)) => return Err(err),
        None => return Err(DiskError::BadField),
    }

    let mut sector = [0u8; RAW_SECTOR_SIZE];
    decoder.sector(&mut sector);
    return Ok((field, sector));
}

/**
Convert the raw image into the working image, one track at a time.

Raw blocks are read once per pair of logical sectors. Each logical sector
is stored at the block of its physical sector. `on_track` runs before
each track with the card handed back, so the caller can reach the board
(the firmware blinks the activity light from it).
*/
pub fn materialize<B: CardBus, const D: usize, const N: usize>(
    sd: &mut SdCard<B>,
    volume: &Volume,
    raw_image: &mut ImageChain<D>,
    working_image: &mut ImageChain<N>,
    raw: &mut Block,
    dst: &mut Block,
    mut on_track: impl FnMut(&mut SdCard<B>, u8),
) -> Result<()> {
    info!("building working image");
    write_frame(dst);
    sd.set_block_len(BLOCK_SIZE as u16)?;

    for track in 0..TRACKS {
        on_track(sd, track);
        for logical in 0..SECTORS_PER_TRACK as usize {
            if !sd.is_present() {
                return Err(DiskError::CardRemoved);
            }
            if logical & 1 == 0 {
                let block = track as u16 * (SECTORS_PER_TRACK as u16 / 2) + (logical / 2) as u16;
                let address = raw_image.block_addr(sd, volume, block)?;
                sd.read_block(address, raw)?;
            }

            let physical = PHYSICAL_SECTOR[logical];
            let half = (logical & 1) * RAW_SECTOR_SIZE;
            write_address(
                dst,
                AddressField {
                    volume: VOLUME,
                    track,
                    sector: physical,
                },
            );
            encode_data(&raw[half..half + RAW_SECTOR_SIZE], &mut dst[DATA_BODY..DATA_EPILOGUE]);

            let block = track as u16 * SECTORS_PER_TRACK as u16 + physical as u16;
            let address = working_image.block_addr(sd, volume, block)?;
            sd.write_block(address, &dst[..])?;
        }
        debug!("track {} converted", track);
    }
    return Ok(());
}
