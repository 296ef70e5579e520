use crate::board::CardBus;
use crate::config::CARD_WAKE_CLOCKS;
use crate::error::{DiskError, Result};
use crate::timing::Timing;
use log::{debug, trace};

pub const BLOCK_SIZE: usize = 512;

/// Payload plus the two trailing checksum bytes of a block read.
pub const BLOCK_WIRE_BYTES: usize = BLOCK_SIZE + 2;

pub type Block = [u8; BLOCK_SIZE];

const CMD_GO_IDLE: u8 = 0;
const CMD_SET_BLOCKLEN: u8 = 16;
const CMD_READ_SINGLE: u8 = 17;
const CMD_WRITE_SINGLE: u8 = 24;
const ACMD_SEND_OP_COND: u8 = 41;
const CMD_APP: u8 = 55;

const R1_IDLE: u8 = 0x01;
const DATA_TOKEN: u8 = 0xFE;
const NOT_BUSY: u8 = 0xFF;

// The card ignores the checksum outside of CMD0, which wants exactly this.
const PLACEHOLDER_CRC: u8 = 0x95;

/**
Command/response/block primitives over a bit-banged card bus.

Every loop re-checks the card-present input and bails out with
`DiskError::CardRemoved` once the card is gone. The busy and acceptance
polls have no timeout otherwise.
*/
pub struct SdCard<B: CardBus> {
    bus: B,
    block_len: u16,
}

impl<B: CardBus> SdCard<B> {
    pub fn new(bus: B) -> Self {
        return SdCard { bus, block_len: 0 };
    }

    pub fn bus(&mut self) -> &mut B {
        return &mut self.bus;
    }

    pub fn bus_ref(&self) -> &B {
        return &self.bus;
    }

    pub fn is_present(&self) -> bool {
        return self.bus.card_present();
    }

    fn check(&self) -> Result<()> {
        if self.bus.card_present() {
            return Ok(());
        }
        return Err(DiskError::CardRemoved);
    }

    pub fn send_byte(&mut self, value: u8, timing: Timing) {
        let mut mask = 0x80;
        while mask > 0 {
            let bit = value & mask != 0;
            self.bus.drive(false, bit);
            if timing == Timing::Slow {
                self.bus.settle();
            }
            self.bus.drive(true, bit);
            if timing == Timing::Slow {
                self.bus.settle();
            }
            mask >>= 1;
        }
        self.bus.drive(false, false);
    }

    pub fn read_byte(&mut self, timing: Timing) -> u8 {
        let mut value = 0u8;
        self.bus.drive(false, true);
        if timing == Timing::Slow {
            self.bus.settle();
        }
        for _ in 0..8 {
            self.bus.drive(true, true);
            if timing == Timing::Slow {
                self.bus.settle();
            }
            value = (value << 1) | self.bus.sample() as u8;
            self.bus.drive(false, true);
            if timing == Timing::Slow {
                self.bus.settle();
            }
        }
        return value;
    }

    /// Clock in a single bit of an open block read.
    pub fn read_bit(&mut self) -> bool {
        self.bus.drive(true, true);
        let bit = self.bus.sample();
        self.bus.drive(false, true);
        return bit;
    }

    pub fn send_run(&mut self, high: bool, count: usize) {
        for _ in 0..count {
            self.bus.drive(false, high);
            self.bus.drive(true, high);
        }
        self.bus.drive(false, false);
    }

    /// Pulse chip select, which closes whatever the card was doing.
    pub fn cycle_select(&mut self) {
        self.bus.select(false);
        self.bus.select(true);
    }

    fn send_frame(&mut self, index: u8, argument: u32, timing: Timing) {
        self.send_byte(0xFF, timing);
        self.send_byte(0x40 + index, timing);
        for b in argument.to_be_bytes() {
            self.send_byte(b, timing);
        }
        self.send_byte(PLACEHOLDER_CRC, timing);
        self.send_byte(0xFF, timing);
    }

    /// Bring-up form: emits the frame and collects nothing.
    pub fn issue_command_slow(&mut self, index: u8, argument: u32) {
        self.send_frame(index, argument, Timing::Slow);
    }

    /// Re-issue the command until the card accepts it with a zero response.
    pub fn issue_command(&mut self, index: u8, argument: u32) -> Result<()> {
        loop {
            self.check()?;
            self.send_frame(index, argument, Timing::Fast);
            let response = self.read_response(Timing::Fast)?;
            if response == 0 {
                return Ok(());
            }
            trace!("cmd{} answered {:#04x}, retrying", index, response);
        }
    }

    /// Poll until a byte with bit 7 clear shows up.
    pub fn read_response(&mut self, timing: Timing) -> Result<u8> {
        loop {
            let ch = self.read_byte(timing);
            self.check()?;
            if ch & 0x80 == 0 {
                return Ok(ch);
            }
        }
    }

    pub fn set_block_len(&mut self, len: u16) -> Result<()> {
        if self.block_len == len {
            return Ok(());
        }
        self.issue_command(CMD_SET_BLOCKLEN, len as u32)?;
        self.block_len = len;
        return Ok(());
    }

    /// Issue a single block read and wait for the start token. The caller
    /// clocks out the block length plus two checksum bytes.
    pub fn read_block_start(&mut self, address: u32) -> Result<()> {
        self.issue_command(CMD_READ_SINGLE, address)?;
        loop {
            let ch = self.read_byte(Timing::Fast);
            self.check()?;
            if ch == DATA_TOKEN {
                return Ok(());
            }
        }
    }

    pub fn begin_stream(&mut self, address: u32) -> Result<()> {
        self.set_block_len(BLOCK_SIZE as u16)?;
        return self.read_block_start(address);
    }

    pub fn skip_bytes(&mut self, count: usize) -> Result<()> {
        for _ in 0..count {
            self.check()?;
            self.read_byte(Timing::Fast);
        }
        return Ok(());
    }

    /// Byte-addressed read of `out.len()` bytes, which must not cross a block.
    pub fn read_bytes(&mut self, address: u32, out: &mut [u8]) -> Result<()> {
        self.set_block_len(out.len() as u16)?;
        self.read_block_start(address)?;
        for b in out.iter_mut() {
            *b = self.read_byte(Timing::Fast);
        }
        self.read_byte(Timing::Fast);
        self.read_byte(Timing::Fast);
        return self.check();
    }

    pub fn read_u16(&mut self, address: u32) -> Result<u16> {
        let mut raw = [0u8; 2];
        self.read_bytes(address, &mut raw)?;
        return Ok(u16::from_le_bytes(raw));
    }

    pub fn read_block(&mut self, address: u32, out: &mut Block) -> Result<()> {
        return self.read_bytes(address, out);
    }

    /// Write one block. Short `data` is zero padded, long `data` truncated.
    /// No checksum is sent, two placeholder bytes stand in for it.
    pub fn write_block(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.check()?;
        self.cycle_select();
        self.issue_command(CMD_WRITE_SINGLE, address)?;
        self.send_byte(0xFF, Timing::Fast);
        self.send_byte(DATA_TOKEN, Timing::Fast);
        for i in 0..BLOCK_SIZE {
            self.check()?;
            let b = if i < data.len() { data[i] } else { 0 };
            self.send_byte(b, Timing::Fast);
        }
        self.finish_write()?;
        self.cycle_select();
        return Ok(());
    }

    /// Open a block write and leave the payload to the caller, who must send
    /// exactly one block before `finish_write`.
    pub fn write_block_start(&mut self, address: u32) -> Result<()> {
        self.check()?;
        self.cycle_select();
        self.issue_command(CMD_WRITE_SINGLE, address)?;
        self.send_byte(0xFF, Timing::Fast);
        self.send_byte(DATA_TOKEN, Timing::Fast);
        return Ok(());
    }

    pub fn send_bytes(&mut self, data: &[u8]) -> Result<()> {
        for &b in data {
            self.check()?;
            self.send_byte(b, Timing::Fast);
        }
        return Ok(());
    }

    pub fn finish_write(&mut self) -> Result<()> {
        self.send_byte(0xFF, Timing::Fast);
        self.send_byte(0xFF, Timing::Fast);
        // Data response token. Not checked.
        self.read_byte(Timing::Fast);
        return self.wait_not_busy();
    }

    pub fn wait_not_busy(&mut self) -> Result<()> {
        loop {
            let ch = self.read_byte(Timing::Fast);
            self.check()?;
            if ch == NOT_BUSY {
                return Ok(());
            }
        }
    }

    /// Reset the card into SPI mode and wait for it to leave idle state.
    pub fn initialize(&mut self) -> Result<()> {
        self.block_len = 0;

        self.bus.select(false);
        self.bus.drive(false, true);
        for _ in 0..CARD_WAKE_CLOCKS {
            self.bus.drive(true, true);
            self.bus.settle();
            self.bus.drive(false, true);
            self.bus.settle();
        }
        self.bus.select(true);
        self.bus.drive(false, false);

        self.issue_command_slow(CMD_GO_IDLE, 0);
        loop {
            self.check()?;
            if self.read_byte(Timing::Slow) == R1_IDLE {
                break;
            }
        }

        self.bus.select(false);
        loop {
            self.check()?;
            self.bus.select(true);
            self.issue_command_slow(CMD_APP, 0);
            let ch = self.read_response(Timing::Slow)?;
            if ch & 0xFE != 0 {
                continue;
            }
            self.cycle_select();
            self.issue_command_slow(ACMD_SEND_OP_COND, 0);
            if self.read_response(Timing::Slow)? == 0 {
                break;
            }
            self.bus.select(false);
        }

        debug!("card ready");
        return Ok(());
    }
}

#[cfg(test)]
mod test_sd {
    use super::*;
    use crate::sim::SimCard;

    fn ready_card(image: std::vec::Vec<u8>) -> SdCard<SimCard> {
        let mut card = SdCard::new(SimCard::new(image));
        card.initialize().unwrap();
        return card;
    }

    #[test]
    pub fn test_initialize_walks_bring_up_sequence() {
        let card = ready_card(std::vec![0; 4 * BLOCK_SIZE]);
        let cmds: std::vec::Vec<u8> = card.bus_ref().commands().iter().map(|c| c.0).collect();
        assert_eq!(cmds[0], 0);
        assert_eq!(cmds[1], 55);
        assert_eq!(cmds[2], 41);
        assert_eq!(*cmds.last().unwrap(), 41);
        assert!(card.bus_ref().is_ready());
    }

    #[test]
    pub fn test_partial_read_uses_block_length() {
        let mut image = std::vec![0u8; 4 * BLOCK_SIZE];
        image[0x236..0x23B].copy_from_slice(b"FAT16");
        let mut card = ready_card(image);

        let mut out = [0u8; 5];
        card.read_bytes(0x236, &mut out).unwrap();
        assert_eq!(&out, b"FAT16");

        // Same length again must not re-issue CMD16.
        let before = card.bus_ref().commands().iter().filter(|c| c.0 == 16).count();
        card.read_bytes(0x236, &mut out).unwrap();
        let after = card.bus_ref().commands().iter().filter(|c| c.0 == 16).count();
        assert_eq!(before, after);
    }

    #[test]
    pub fn test_write_block_then_read_back() {
        let mut card = ready_card(std::vec![0; 4 * BLOCK_SIZE]);
        let mut data = [0u8; BLOCK_SIZE];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i * 7) as u8;
        }
        card.write_block(2 * BLOCK_SIZE as u32, &data).unwrap();

        let mut back = [0u8; BLOCK_SIZE];
        card.read_block(2 * BLOCK_SIZE as u32, &mut back).unwrap();
        assert_eq!(back, data);
        assert_eq!(card.bus_ref().block(2), &data[..]);
    }

    #[test]
    pub fn test_short_write_is_zero_padded() {
        let mut image = std::vec![0xAAu8; 2 * BLOCK_SIZE];
        image[..BLOCK_SIZE].fill(0x11);
        let mut card = ready_card(image);
        card.write_block(0, &[1, 2, 3]).unwrap();
        let block = card.bus_ref().block(0);
        assert_eq!(&block[..3], &[1, 2, 3]);
        assert!(block[3..].iter().all(|&b| b == 0));
    }

    #[test]
    pub fn test_removal_aborts_write() {
        let mut card = ready_card(std::vec![0; 4 * BLOCK_SIZE]);
        card.bus().eject_after(100);
        let result = card.write_block(0, &[0x55; BLOCK_SIZE]);
        assert_eq!(result, Err(DiskError::CardRemoved));
    }

    #[test]
    pub fn test_removed_card_fails_bring_up() {
        let mut sim = SimCard::new(std::vec![0; BLOCK_SIZE]);
        sim.set_present(false);
        let mut card = SdCard::new(sim);
        assert_eq!(card.initialize(), Err(DiskError::CardRemoved));
    }

    #[test]
    pub fn test_stream_bits_match_block() {
        let mut image = std::vec![0u8; 2 * BLOCK_SIZE];
        image[BLOCK_SIZE] = 0xD5;
        image[BLOCK_SIZE + 1] = 0x0F;
        let mut card = ready_card(image);
        card.begin_stream(BLOCK_SIZE as u32).unwrap();
        let mut byte = 0u16;
        for _ in 0..16 {
            byte = (byte << 1) | card.read_bit() as u16;
        }
        assert_eq!(byte, 0xD50F);
    }
}
