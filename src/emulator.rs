use crate::board::Board;
use crate::buffers::{BufferPool, SectorTag};
use crate::config::{
    BTF_EXT, DSK_BLOCKS, DSK_EXT, FAT_DSK_ELEMS, FAT_NIC_ELEMS, HOTPLUG_DEBOUNCE_POLLS, NIC_BLOCKS, NIC_EXT,
    SECTORS_PER_TRACK, VOLUME,
};
use crate::drive::{Drive, WriteAction, STREAM_BITS};
use crate::error::{DiskError, Result};
use crate::fat16::{ImageChain, Volume};
use crate::nibble::{self, AddressField, DATA_FIELD_LEN, EPILOGUE, STREAM_BYTES};
use crate::sd::{Block, SdCard, BLOCK_SIZE, BLOCK_WIRE_BYTES};
use crate::timing::Timing;
use log::{debug, info, warn};

/// Bytes of a write-back block after the epilogue: gap then padding.
const WRITE_BACK_GAP: usize = 14;

fn printable(name: &[u8; 8]) -> &str {
    return match core::str::from_utf8(name) {
        Ok(text) => text.trim_end(),
        Err(_) => "?",
    };
}

/**
The whole drive: card, mounted volume, both image chain caches, the
buffer pool and the head. One of these is created at boot and handed to
both the foreground loop (`poll`) and the bit-cell tick (`service_tick`).
*/
pub struct Emulator<B: Board> {
    sd: SdCard<B>,
    volume: Option<Volume>,
    raw_image: ImageChain<FAT_DSK_ELEMS>,
    working_image: ImageChain<FAT_NIC_ELEMS>,
    pool: BufferPool,
    drive: Drive,
    name: [u8; 8],
    inited: bool,
    card_loaded: bool,
    debounce: u32,
    debounce_polls: u32,
    write_level: bool,
}

impl<B: Board> Emulator<B> {
    pub fn new(board: B) -> Self {
        return Emulator {
            sd: SdCard::new(board),
            volume: None,
            raw_image: ImageChain::new(),
            working_image: ImageChain::new(),
            pool: BufferPool::new(),
            drive: Drive::new(),
            name: [b' '; 8],
            inited: false,
            card_loaded: false,
            debounce: 0,
            debounce_polls: HOTPLUG_DEBOUNCE_POLLS,
            write_level: false,
        };
    }

    pub fn board(&self) -> &B {
        return self.sd.bus_ref();
    }

    pub fn board_mut(&mut self) -> &mut B {
        return self.sd.bus();
    }

    pub fn volume(&self) -> Option<&Volume> {
        return self.volume.as_ref();
    }

    pub fn drive(&self) -> &Drive {
        return &self.drive;
    }

    pub fn pool(&self) -> &BufferPool {
        return &self.pool;
    }

    pub fn file_name(&self) -> &[u8; 8] {
        return &self.name;
    }

    pub fn is_ready(&self) -> bool {
        return self.inited;
    }

    pub fn set_debounce_polls(&mut self, polls: u32) {
        self.debounce_polls = polls;
    }

    pub fn is_enabled(&self) -> bool {
        return self.drive.enabled;
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled != self.drive.enabled {
            self.drive.enabled = enabled;
            self.sd.bus().set_activity(enabled);
        }
    }

    /// Run `f` with the tick and card-detect sources masked.
    fn critical<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.sd.bus().mask_interrupts();
        let result = f(self);
        self.sd.bus().unmask_interrupts();
        return result;
    }

    /**
    Mount the card from scratch and pick the working image.

    The newest bookmark names the image unless `selection` overrides it.
    A missing working image is created and converted from the raw image
    of the same name (or the newest raw image when there is no bookmark).
    */
    pub fn reload(&mut self, selection: Option<[u8; 8]>) -> Result<()> {
        let result = self.critical(|emu| emu.mount(selection));
        if let Err(err) = result {
            warn!("mount failed: {}", err);
        }
        return result;
    }

    fn mount(&mut self, selection: Option<[u8; 8]>) -> Result<()> {
        self.inited = false;
        self.volume = None;
        self.pool.clear();

        self.sd.initialize()?;
        let volume = Volume::mount(&mut self.sd)?;
        self.volume = Some(volume);

        let bookmark = volume.find_file(&mut self.sd, BTF_EXT, None)?;
        let chosen = selection.is_some();
        let by_name = bookmark.is_some() || chosen;
        let mut name = match (selection, bookmark) {
            (Some(picked), _) => picked,
            (None, Some(found)) => found.name,
            (None, None) => [b' '; 8],
        };

        let wanted = if by_name { Some(&name) } else { None };
        let working = match volume.find_file(&mut self.sd, NIC_EXT, wanted)? {
            Some(found) => {
                name = found.name;
                found
            }
            None => {
                let wanted = if by_name { Some(&name) } else { None };
                let raw = volume.find_file(&mut self.sd, DSK_EXT, wanted)?.ok_or(DiskError::NotFound)?;
                name = raw.name;
                info!("creating {}.NIC", printable(&name));

                let (scratch, _) = self.pool.scratch_pair();
                volume.create_file(&mut self.sd, &name, NIC_EXT, NIC_BLOCKS, scratch)?;
                let created = volume
                    .find_file(&mut self.sd, NIC_EXT, Some(&name))?
                    .ok_or(DiskError::NotFound)?;

                self.raw_image.open(&volume, raw.slot, DSK_BLOCKS);
                self.working_image.open(&volume, created.slot, NIC_BLOCKS);
                let (raw_block, nic_block) = self.pool.scratch_pair();
                nibble::materialize(
                    &mut self.sd,
                    &volume,
                    &mut self.raw_image,
                    &mut self.working_image,
                    raw_block,
                    nic_block,
                    |sd, track| sd.bus().set_activity(track & 1 == 0),
                )?;
                created
            }
        };
        self.working_image.open(&volume, working.slot, NIC_BLOCKS);
        self.drive.protected = working.read_only;
        self.sd.bus().set_write_protect(working.read_only);

        let (scratch, _) = self.pool.scratch_pair();
        match bookmark {
            None => match volume.create_file(&mut self.sd, &name, BTF_EXT, 0, scratch) {
                Ok(_) => {}
                Err(DiskError::CardRemoved) => return Err(DiskError::CardRemoved),
                Err(err) => warn!("no bookmark written: {}", err),
            },
            Some(found) => {
                if chosen || found.name != name {
                    volume.patch_directory_name(&mut self.sd, found.slot, &name, scratch)?;
                }
            }
        }

        self.drive.reset();
        let enabled = self.sd.bus_ref().drive_enabled();
        self.drive.enabled = enabled;
        self.sd.bus().set_activity(enabled);
        self.write_level = self.sd.bus_ref().write_data();
        self.sd.set_block_len(BLOCK_SIZE as u16)?;
        self.pool.clear();
        self.name = name;
        self.card_loaded = true;
        self.inited = true;
        info!("mounted {}.NIC{}", printable(&name), if working.read_only { " (protected)" } else { "" });
        return Ok(());
    }

    fn on_removed(&mut self) {
        warn!("card removed");
        self.inited = false;
        self.drive.prepare = false;
        self.volume = None;
        self.raw_image.invalidate();
        self.working_image.invalidate();
    }

    /// Debounced card-detect. A change is trusted once it has been seen on
    /// `debounce_polls` consecutive polls.
    fn check_card(&mut self) {
        let present = self.sd.is_present();
        if present == self.card_loaded {
            self.debounce = 0;
            return;
        }
        self.debounce += 1;
        if self.debounce < self.debounce_polls {
            return;
        }
        self.debounce = 0;
        self.card_loaded = present;

        if present {
            info!("card inserted");
            // A failed mount leaves the drive not ready until the next insertion.
            let _ = self.reload(None);
        } else {
            self.critical(|emu| emu.on_removed());
        }
    }

    pub fn poll(&mut self) {
        self.check_card();

        let enabled = self.sd.bus_ref().drive_enabled();
        self.set_enabled(enabled);
        if !enabled {
            return;
        }

        let phases = self.sd.bus_ref().phases();
        self.on_stepper_change(phases);

        if self.inited && self.drive.prepare {
            if let Err(err) = self.critical(|emu| emu.prepare_sector()) {
                debug!("prepare aborted: {}", err);
            }
        }
    }

    pub fn on_stepper_change(&mut self, phases: u8) {
        self.drive.head.on_stepper_change(phases);
    }

    fn prepare_sector(&mut self) -> Result<()> {
        let volume = self.volume.ok_or(DiskError::NotMounted)?;
        let sector = self.drive.head.advance();
        let track = self.drive.head.track();

        if self.pool.collides(track, sector) {
            self.flush()?;
        }

        let block = track as u16 * SECTORS_PER_TRACK as u16 + sector as u16;
        let address = self.working_image.block_addr(&mut self.sd, &volume, block)?;
        self.sd.begin_stream(address)?;
        self.drive.cursor = 0;
        self.drive.prepare = false;
        return Ok(());
    }

    /**
    Next bit for the host. The first `STREAM_BYTES` of the primed block go
    out one bit per tick; the rest of the block is then drained and the
    foreground loop is asked for the next sector. Until it delivers, the
    host sees 1-bits.
    */
    pub fn on_tick(&mut self) -> bool {
        if !self.inited || self.drive.prepare || self.drive.cursor >= STREAM_BITS {
            return true;
        }

        let bit = self.sd.read_bit();
        self.drive.cursor += 1;
        if self.drive.cursor == STREAM_BITS {
            if let Err(err) = self.sd.skip_bytes(BLOCK_WIRE_BYTES - STREAM_BYTES) {
                debug!("stream drain aborted: {}", err);
            }
            self.drive.prepare = true;
        }
        return bit;
    }

    /// Close an unfinished block read so the card accepts a new command.
    fn cancel_read(&mut self) {
        let pending = self.drive.pending_read_bits();
        for _ in 0..pending {
            if !self.sd.is_present() {
                return;
            }
            self.sd.read_bit();
        }
        self.drive.cursor = STREAM_BITS;
    }

    /// One write bit from the host (true for a flux transition).
    pub fn on_write_bit(&mut self, bit: bool) {
        if !self.inited || self.drive.protected {
            return;
        }
        let byte = match self.drive.capture.latch(bit) {
            Some(byte) => byte,
            None => return,
        };
        let event = match self.drive.capture.accept(byte, self.pool.capture_buffer()) {
            Some(event) => event,
            None => return,
        };

        match self.drive.on_field(event, &mut self.pool) {
            WriteAction::None => {}
            WriteAction::Flush => {
                self.cancel_read();
                if let Err(err) = self.flush() {
                    warn!("write back failed: {}", err);
                }
                self.drive.prepare = true;
            }
            WriteAction::Restart => {
                self.cancel_read();
                self.drive.prepare = true;
            }
        }
    }

    /**
    Timer tick. While the host holds write request the write data line is
    sampled and a level change is a 1-bit; otherwise the next stream bit
    drives the read pulse.
    */
    pub fn service_tick(&mut self) {
        if !self.inited || !self.drive.enabled {
            return;
        }

        if self.sd.bus_ref().write_request() {
            let level = self.sd.bus_ref().write_data();
            let bit = level != self.write_level;
            self.write_level = level;
            self.sd.bus().set_read_pulse(false);
            self.on_write_bit(bit);
        } else {
            let bit = self.on_tick();
            self.sd.bus().set_read_pulse(bit);
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        if self.pool.is_empty() {
            return Ok(());
        }
        let volume = self.volume.ok_or(DiskError::NotMounted)?;
        if !self.sd.is_present() {
            return Err(DiskError::CardRemoved);
        }

        for (data, tag) in self.pool.staged() {
            write_back(&mut self.sd, &volume, &mut self.working_image, tag, data)?;
        }
        debug!("flushed {} sectors", self.pool.staged().count());
        self.pool.release();
        return Ok(());
    }
}

/// Write one captured data field as a complete working image block.
fn write_back<B: Board>(
    sd: &mut SdCard<B>,
    volume: &Volume,
    working_image: &mut ImageChain<FAT_NIC_ELEMS>,
    tag: SectorTag,
    data: &Block,
) -> Result<()> {
    let block = tag.track as u16 * SECTORS_PER_TRACK as u16 + tag.sector as u16;
    let address = working_image.block_addr(sd, volume, block)?;

    let header = nibble::sector_header(AddressField {
        volume: VOLUME,
        track: tag.track,
        sector: tag.sector,
    });
    sd.write_block_start(address)?;
    sd.send_bytes(&header)?;
    sd.send_bytes(&data[..DATA_FIELD_LEN])?;
    sd.send_bytes(&EPILOGUE)?;
    for _ in 0..WRITE_BACK_GAP {
        sd.send_byte(0xFF, Timing::Fast);
    }
    let written = header.len() + DATA_FIELD_LEN + EPILOGUE.len() + WRITE_BACK_GAP;
    for _ in written..BLOCK_SIZE {
        sd.send_byte(0x00, Timing::Fast);
    }
    sd.finish_write()?;
    sd.cycle_select();
    return Ok(());
}
