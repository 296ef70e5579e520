//! In-memory stand-ins for the card and the Disk II host, used by the tests.

use crate::board::{CardBus, HostBus};
use crate::sd::BLOCK_SIZE;
use std::collections::VecDeque;
use std::vec;
use std::vec::Vec;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum CardState {
    Command,
    WriteToken,
    WriteData,
    WriteCrc(u8),
}

/**
Bit-level model of an SD card in SPI mode.

The card samples data-in and shifts its next data-out bit on every rising
clock edge while selected. Responses are queued one byte late (NCR of one
filler byte), block reads honour the CMD16 block length and accept any byte
address, block writes always take 512 bytes and end in a short busy phase.
*/
pub struct SimCard {
    image: Vec<u8>,
    present: bool,
    selected: bool,
    clock: bool,
    data_out: bool,
    rx: u8,
    rx_bits: u8,
    tx_byte: u8,
    tx: VecDeque<u8>,
    state: CardState,
    frame: [u8; 6],
    frame_len: usize,
    block_len: usize,
    app_cmd: bool,
    idle: bool,
    op_cond_polls: u8,
    write_addr: usize,
    write_buf: Vec<u8>,
    writes: usize,
    commands: Vec<(u8, u32)>,
    eject_countdown: Option<usize>,
}

impl SimCard {
    pub fn new(image: Vec<u8>) -> Self {
        return SimCard {
            image,
            present: true,
            selected: false,
            clock: false,
            data_out: true,
            rx: 0,
            rx_bits: 0,
            tx_byte: 0xFF,
            tx: VecDeque::new(),
            state: CardState::Command,
            frame: [0; 6],
            frame_len: 0,
            block_len: BLOCK_SIZE,
            app_cmd: false,
            idle: true,
            op_cond_polls: 0,
            write_addr: 0,
            write_buf: Vec::new(),
            writes: 0,
            commands: Vec::new(),
            eject_countdown: None,
        };
    }

    pub fn image(&self) -> &[u8] {
        return &self.image;
    }

    pub fn image_mut(&mut self) -> &mut [u8] {
        return &mut self.image;
    }

    pub fn block(&self, index: usize) -> &[u8] {
        return &self.image[index * BLOCK_SIZE..(index + 1) * BLOCK_SIZE];
    }

    pub fn commands(&self) -> &[(u8, u32)] {
        return &self.commands;
    }

    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    pub fn writes(&self) -> usize {
        return self.writes;
    }

    pub fn is_ready(&self) -> bool {
        return !self.idle;
    }

    pub fn set_present(&mut self, present: bool) {
        self.present = present;
        if !present {
            self.idle = true;
            self.op_cond_polls = 0;
            self.tx.clear();
            self.state = CardState::Command;
        }
    }

    /// Pull the card after `bytes` more bytes have crossed the bus.
    pub fn eject_after(&mut self, bytes: usize) {
        self.eject_countdown = Some(bytes);
    }

    fn respond(&mut self, r1: u8) {
        self.tx.push_back(0xFF);
        self.tx.push_back(r1);
    }

    fn execute(&mut self) {
        let index = self.frame[0] & 0x3F;
        let arg = u32::from_be_bytes([self.frame[1], self.frame[2], self.frame[3], self.frame[4]]);
        self.commands.push((index, arg));

        let app = self.app_cmd;
        self.app_cmd = false;
        let r1 = if self.idle { 0x01 } else { 0x00 };

        match index {
            0 => {
                self.idle = true;
                self.op_cond_polls = 0;
                self.respond(0x01);
            }
            55 => {
                self.app_cmd = true;
                self.respond(r1);
            }
            41 if app => {
                self.op_cond_polls += 1;
                if self.op_cond_polls >= 3 {
                    self.idle = false;
                }
                let r1 = if self.idle { 0x01 } else { 0x00 };
                self.respond(r1);
            }
            16 => {
                if !self.idle {
                    self.block_len = arg as usize;
                }
                self.respond(r1);
            }
            17 => {
                self.respond(r1);
                if !self.idle {
                    self.tx.push_back(0xFF);
                    self.tx.push_back(0xFF);
                    self.tx.push_back(0xFE);
                    for i in 0..self.block_len {
                        let b = self.image.get(arg as usize + i).copied().unwrap_or(0);
                        self.tx.push_back(b);
                    }
                    self.tx.push_back(0x5A);
                    self.tx.push_back(0xA5);
                }
            }
            24 => {
                self.respond(r1);
                if !self.idle {
                    self.write_addr = arg as usize;
                    self.state = CardState::WriteToken;
                }
            }
            _ => {
                self.respond(0x04);
            }
        }
    }

    fn on_byte(&mut self, b: u8) {
        match self.state {
            CardState::Command => {
                if self.frame_len == 0 {
                    if b & 0xC0 != 0x40 {
                        return;
                    }
                    self.tx.clear();
                }
                self.frame[self.frame_len] = b;
                self.frame_len += 1;
                if self.frame_len == self.frame.len() {
                    self.frame_len = 0;
                    self.execute();
                }
            }
            CardState::WriteToken => {
                if b == 0xFE {
                    self.write_buf.clear();
                    self.state = CardState::WriteData;
                }
            }
            CardState::WriteData => {
                self.write_buf.push(b);
                if self.write_buf.len() == BLOCK_SIZE {
                    self.state = CardState::WriteCrc(2);
                }
            }
            CardState::WriteCrc(left) => {
                if left > 1 {
                    self.state = CardState::WriteCrc(left - 1);
                    return;
                }
                let end = self.write_addr + BLOCK_SIZE;
                if end <= self.image.len() {
                    self.image[self.write_addr..end].copy_from_slice(&self.write_buf);
                }
                self.writes += 1;
                self.tx.push_back(0x05);
                self.tx.push_back(0x00);
                self.tx.push_back(0x00);
                self.state = CardState::Command;
            }
        }
    }

    fn rising_edge(&mut self, data: bool) {
        if self.rx_bits == 0 {
            self.tx_byte = self.tx.pop_front().unwrap_or(0xFF);
        }
        self.data_out = self.tx_byte & (0x80 >> self.rx_bits) != 0;
        self.rx = (self.rx << 1) | data as u8;
        self.rx_bits += 1;
        if self.rx_bits == 8 {
            self.rx_bits = 0;
            let b = self.rx;
            self.on_byte(b);
            if let Some(left) = self.eject_countdown {
                if left <= 1 {
                    self.eject_countdown = None;
                    self.set_present(false);
                } else {
                    self.eject_countdown = Some(left - 1);
                }
            }
        }
    }
}

impl CardBus for SimCard {
    fn select(&mut self, selected: bool) {
        if selected == self.selected {
            return;
        }
        self.selected = selected;
        self.rx_bits = 0;
        self.frame_len = 0;
        self.data_out = true;
        if !selected {
            self.tx.clear();
            if self.state != CardState::Command {
                self.state = CardState::Command;
            }
        }
    }

    fn drive(&mut self, clock: bool, data: bool) {
        if clock && !self.clock && self.selected && self.present {
            self.rising_edge(data);
        }
        if !self.selected || !self.present {
            self.data_out = true;
        }
        self.clock = clock;
    }

    fn sample(&mut self) -> bool {
        return self.data_out;
    }

    fn card_present(&self) -> bool {
        return self.present;
    }

    fn settle(&mut self) {}
}

pub struct SimBoard {
    pub card: SimCard,
    pub phases: u8,
    pub enabled: bool,
    pub write_request: bool,
    pub write_level: bool,
    pub read_pulse: bool,
    pub write_protect: bool,
    pub activity: bool,
    pub mask_depth: i32,
    pub mask_count: usize,
}

impl SimBoard {
    pub fn new(card: SimCard) -> Self {
        return SimBoard {
            card,
            phases: 0,
            enabled: true,
            write_request: false,
            write_level: false,
            read_pulse: false,
            write_protect: false,
            activity: false,
            mask_depth: 0,
            mask_count: 0,
        };
    }
}

impl CardBus for SimBoard {
    fn select(&mut self, selected: bool) {
        self.card.select(selected);
    }

    fn drive(&mut self, clock: bool, data: bool) {
        self.card.drive(clock, data);
    }

    fn sample(&mut self) -> bool {
        return self.card.sample();
    }

    fn card_present(&self) -> bool {
        return self.card.card_present();
    }

    fn settle(&mut self) {}
}

impl HostBus for SimBoard {
    fn phases(&self) -> u8 {
        return self.phases;
    }

    fn drive_enabled(&self) -> bool {
        return self.enabled;
    }

    fn write_request(&self) -> bool {
        return self.write_request;
    }

    fn write_data(&self) -> bool {
        return self.write_level;
    }

    fn set_read_pulse(&mut self, high: bool) {
        self.read_pulse = high;
    }

    fn set_write_protect(&mut self, protect: bool) {
        self.write_protect = protect;
    }

    fn set_activity(&mut self, on: bool) {
        self.activity = on;
    }

    fn mask_interrupts(&mut self) {
        self.mask_depth += 1;
        self.mask_count += 1;
    }

    fn unmask_interrupts(&mut self) {
        self.mask_depth -= 1;
    }
}

pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_HIDDEN: u8 = 0x02;
pub const ATTR_ARCHIVE: u8 = 0x20;

/**
Formats a FAT16 volume into a byte vector, optionally behind an MBR.

The root directory always has 512 slots.
*/
pub struct Fat16Builder {
    partition_lba: u32,
    sectors_per_cluster: u8,
    reserved_sectors: u16,
    data_clusters: u32,
}

impl Fat16Builder {
    pub fn new(data_clusters: u32, sectors_per_cluster: u8) -> Self {
        return Fat16Builder {
            partition_lba: 0,
            sectors_per_cluster,
            reserved_sectors: 1,
            data_clusters,
        };
    }

    pub fn partitioned(mut self, lba: u32) -> Self {
        self.partition_lba = lba;
        return self;
    }

    pub fn reserved(mut self, sectors: u16) -> Self {
        self.reserved_sectors = sectors;
        return self;
    }

    pub fn build(self) -> SimVolume {
        let sectors_per_fat = ((self.data_clusters + 2) * 2).div_ceil(BLOCK_SIZE as u32) as u16;
        let base = self.partition_lba as usize * BLOCK_SIZE;
        let fat = base + self.reserved_sectors as usize * BLOCK_SIZE;
        let root = fat + sectors_per_fat as usize * 2 * BLOCK_SIZE;
        let user = root + 32 * BLOCK_SIZE;
        let cluster_bytes = self.sectors_per_cluster as usize * BLOCK_SIZE;
        let total = user + self.data_clusters as usize * cluster_bytes;

        let mut image = vec![0u8; total];
        if self.partition_lba != 0 {
            image[0x1BE] = 0x00;
            image[0x1C2] = 0x06;
            image[0x1C6..0x1CA].copy_from_slice(&self.partition_lba.to_le_bytes());
            image[0x1FE] = 0x55;
            image[0x1FF] = 0xAA;
        }

        let boot = &mut image[base..base + BLOCK_SIZE];
        boot[0] = 0xEB;
        boot[1] = 0x3C;
        boot[2] = 0x90;
        boot[3..11].copy_from_slice(b"MSDOS5.0");
        boot[0x0B..0x0D].copy_from_slice(&(BLOCK_SIZE as u16).to_le_bytes());
        boot[0x0D] = self.sectors_per_cluster;
        boot[0x0E..0x10].copy_from_slice(&self.reserved_sectors.to_le_bytes());
        boot[0x10] = 2;
        boot[0x11..0x13].copy_from_slice(&512u16.to_le_bytes());
        let total_sectors = ((total - base) / BLOCK_SIZE) as u32;
        if total_sectors < 0x10000 {
            boot[0x13..0x15].copy_from_slice(&(total_sectors as u16).to_le_bytes());
        } else {
            boot[0x20..0x24].copy_from_slice(&total_sectors.to_le_bytes());
        }
        boot[0x15] = 0xF8;
        boot[0x16..0x18].copy_from_slice(&sectors_per_fat.to_le_bytes());
        boot[0x26] = 0x29;
        boot[0x2B..0x36].copy_from_slice(b"SDISK2     ");
        boot[0x36..0x3E].copy_from_slice(b"FAT16   ");
        boot[0x1FE] = 0x55;
        boot[0x1FF] = 0xAA;

        let mut volume = SimVolume {
            image,
            fat,
            sectors_per_fat,
            root,
            user,
            cluster_bytes,
            data_clusters: self.data_clusters,
            next_cluster: 2,
        };
        volume.set_fat(0, 0xFFF8);
        volume.set_fat(1, 0xFFFF);
        return volume;
    }
}

pub struct SimVolume {
    image: Vec<u8>,
    fat: usize,
    sectors_per_fat: u16,
    root: usize,
    user: usize,
    cluster_bytes: usize,
    data_clusters: u32,
    next_cluster: u16,
}

impl SimVolume {
    pub fn layout(&self) -> SimLayout {
        return SimLayout {
            fat: self.fat,
            fat_bytes: self.fat_bytes(),
            root: self.root,
            user: self.user,
            cluster_bytes: self.cluster_bytes,
        };
    }

    pub fn fat_bytes(&self) -> usize {
        return self.sectors_per_fat as usize * BLOCK_SIZE;
    }

    /// Write an entry into both FAT copies.
    pub fn set_fat(&mut self, cluster: u16, value: u16) {
        let off = self.fat + cluster as usize * 2;
        self.image[off..off + 2].copy_from_slice(&value.to_le_bytes());
        let off = off + self.fat_bytes();
        self.image[off..off + 2].copy_from_slice(&value.to_le_bytes());
    }

    pub fn cluster_addr(&self, cluster: u16) -> usize {
        return self.user + (cluster as usize - 2) * self.cluster_bytes;
    }

    pub fn write_entry(
        &mut self,
        slot: u16,
        name: &[u8; 8],
        ext: &[u8; 3],
        attr: u8,
        start: u16,
        size: u32,
        date: u16,
        time: u16,
    ) {
        let off = self.root + slot as usize * 32;
        let entry = &mut self.image[off..off + 32];
        entry.fill(0);
        entry[0..8].copy_from_slice(name);
        entry[8..11].copy_from_slice(ext);
        entry[11] = attr;
        entry[22..24].copy_from_slice(&time.to_le_bytes());
        entry[24..26].copy_from_slice(&date.to_le_bytes());
        entry[26..28].copy_from_slice(&start.to_le_bytes());
        entry[28..32].copy_from_slice(&size.to_le_bytes());
    }

    pub fn raw_entry_mut(&mut self, slot: u16) -> &mut [u8] {
        let off = self.root + slot as usize * 32;
        return &mut self.image[off..off + 32];
    }

    /// Store `data` in freshly allocated clusters following `chain` order.
    pub fn write_chain(&mut self, chain: &[u16], data: &[u8]) {
        for (i, &cluster) in chain.iter().enumerate() {
            let next = if i + 1 < chain.len() { chain[i + 1] } else { 0xFFFF };
            self.set_fat(cluster, next);
            let start = i * self.cluster_bytes;
            if start < data.len() {
                let end = (start + self.cluster_bytes).min(data.len());
                let addr = self.cluster_addr(cluster);
                self.image[addr..addr + end - start].copy_from_slice(&data[start..end]);
            }
            if cluster >= self.next_cluster {
                self.next_cluster = cluster + 1;
            }
        }
    }

    /// Add a file in the given slot using contiguous clusters.
    pub fn add_file(
        &mut self,
        slot: u16,
        name: &[u8; 8],
        ext: &[u8; 3],
        attr: u8,
        data: &[u8],
        date: u16,
        time: u16,
    ) -> u16 {
        let count = data.len().div_ceil(self.cluster_bytes) as u16;
        let start = if count == 0 { 0 } else { self.next_cluster };
        assert!((start + count) as u32 <= self.data_clusters + 2, "volume full");
        let chain: Vec<u16> = (start..start + count).collect();
        self.write_chain(&chain, data);
        self.write_entry(slot, name, ext, attr, start, data.len() as u32, date, time);
        return start;
    }

    pub fn into_image(self) -> Vec<u8> {
        return self.image;
    }
}

/// Where things live on a volume built by `Fat16Builder`.
#[derive(Copy, Clone, Debug)]
pub struct SimLayout {
    pub fat: usize,
    pub fat_bytes: usize,
    pub root: usize,
    pub user: usize,
    pub cluster_bytes: usize,
}

impl SimLayout {
    pub fn entry<'a>(&self, image: &'a [u8], slot: u16) -> &'a [u8] {
        let off = self.root + slot as usize * 32;
        return &image[off..off + 32];
    }

    pub fn fat_entry(&self, image: &[u8], cluster: u16) -> u16 {
        let off = self.fat + cluster as usize * 2;
        return u16::from_le_bytes([image[off], image[off + 1]]);
    }

    pub fn chain(&self, image: &[u8], slot: u16) -> Vec<u16> {
        let entry = self.entry(image, slot);
        let mut cluster = u16::from_le_bytes([entry[26], entry[27]]);
        let mut out = Vec::new();
        while (2..0xFFF6).contains(&cluster) {
            out.push(cluster);
            cluster = self.fat_entry(image, cluster);
        }
        return out;
    }

    pub fn read_file(&self, image: &[u8], slot: u16) -> Vec<u8> {
        let entry = self.entry(image, slot);
        let size = u32::from_le_bytes([entry[28], entry[29], entry[30], entry[31]]) as usize;
        let mut out = Vec::with_capacity(size);
        for cluster in self.chain(image, slot) {
            if out.len() >= size {
                break;
            }
            let addr = self.user + (cluster as usize - 2) * self.cluster_bytes;
            let take = self.cluster_bytes.min(size - out.len());
            out.extend_from_slice(&image[addr..addr + take]);
        }
        return out;
    }
}
