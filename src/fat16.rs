use crate::board::CardBus;
use crate::config::DIR_SLOTS;
use crate::error::{DiskError, Result};
use crate::sd::{Block, SdCard, BLOCK_SIZE};
use log::{debug, info, trace};

const DIR_ENTRY_SIZE: u32 = 32;
const ROOT_DIR_SECTORS: u32 = 32;

const BPB_SIGNATURE_OFFSET: u32 = 0x36;
const MBR_PARTITION_LBA: u32 = 0x1C6;
const BPB_SECTORS_PER_CLUSTER: u32 = 0x0D;
const BPB_TOTAL_SECTORS_16: u32 = 0x13;
const BPB_SECTORS_PER_FAT: u32 = 0x16;
const BPB_TOTAL_SECTORS_32: u32 = 0x20;

const ENTRY_ATTR: u32 = 11;
const ENTRY_TIME: u32 = 22;
const ENTRY_START_CLUSTER: u32 = 26;

const ENTRY_FREE: u8 = 0x00;
const ENTRY_KANJI_E5: u8 = 0x05;
const ENTRY_DOT: u8 = 0x2E;
const ENTRY_DELETED: u8 = 0xE5;

const ATTR_READ_ONLY: u8 = 0x01;
// hidden, system, volume label, directory
const ATTR_SKIP_MASK: u8 = 0x1E;
const ATTR_LONG_NAME: u8 = 0x0F;

pub const FIRST_CLUSTER: u16 = 2;
/// Anything above this ends a chain (reserved, bad cluster or end-of-chain).
pub const LAST_VALID_CLUSTER: u16 = 0xFFF5;
pub const END_OF_CHAIN: u16 = 0xFFFF;

pub fn is_chain_link(cluster: u16) -> bool {
    return cluster >= FIRST_CLUSTER && cluster <= LAST_VALID_CLUSTER;
}

/**
Card geometry derived at mount time. All later addressing is relative to
the fat, root and user addresses; nothing here changes until the card is
mounted again.
*/
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Volume {
    pub bpb_addr: u32,
    pub sectors_per_cluster: u8,
    pub cluster_shift: u8,
    pub reserved_sectors: u16,
    pub fat_addr: u32,
    pub root_addr: u32,
    pub user_addr: u32,
    pub sectors_per_fat: u16,
    /// One past the highest cluster number that exists on the volume.
    pub cluster_limit: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DirMatch {
    pub slot: u16,
    pub name: [u8; 8],
    pub read_only: bool,
}

/**
A window of `N` consecutive cluster numbers out of a file's chain.

Window `w` holds chain positions `w*N .. w*N + len`. `len` falls short of
`N` when the chain ends inside the window.
*/
#[derive(Copy, Clone, Debug)]
pub struct ChainWindow<const N: usize> {
    index: Option<u16>,
    clusters: [u16; N],
    len: usize,
}

impl<const N: usize> ChainWindow<N> {
    pub const fn new() -> Self {
        return ChainWindow {
            index: None,
            clusters: [0; N],
            len: 0,
        };
    }

    pub fn index(&self) -> Option<u16> {
        return self.index;
    }

    pub fn clusters(&self) -> &[u16] {
        return &self.clusters[..self.len];
    }

    pub fn invalidate(&mut self) {
        self.index = None;
        self.len = 0;
    }

    pub fn window_of(position: u16) -> u16 {
        return position / N as u16;
    }

    /// Cluster at chain `position`, which must fall in the cached window.
    pub fn cluster_at(&self, position: u16) -> Result<u16> {
        if self.index != Some(Self::window_of(position)) {
            return Err(DiskError::BadChain(position));
        }
        let offset = position as usize % N;
        if offset >= self.len {
            return Err(DiskError::BadChain(position));
        }
        return Ok(self.clusters[offset]);
    }
}

/**
A file opened for block access: its directory slot, its cluster count and
one cached chain window. The window is refreshed only when a block outside
it is requested.
*/
#[derive(Copy, Clone, Debug)]
pub struct ImageChain<const N: usize> {
    slot: u16,
    clusters: u16,
    window: ChainWindow<N>,
}

impl<const N: usize> ImageChain<N> {
    pub const fn new() -> Self {
        return ImageChain {
            slot: 0,
            clusters: 0,
            window: ChainWindow::new(),
        };
    }

    pub fn open(&mut self, volume: &Volume, slot: u16, blocks: u16) {
        self.slot = slot;
        self.clusters = volume.clusters_for(blocks);
        self.window.invalidate();
    }

    pub fn slot(&self) -> u16 {
        return self.slot;
    }

    pub fn window(&self) -> &ChainWindow<N> {
        return &self.window;
    }

    pub fn invalidate(&mut self) {
        self.window.invalidate();
    }

    pub fn block_addr<B: CardBus>(&mut self, sd: &mut SdCard<B>, volume: &Volume, block: u16) -> Result<u32> {
        let position = volume.position_of(block);
        let window = ChainWindow::<N>::window_of(position);
        if self.window.index() != Some(window) {
            volume.chain_window(sd, self.slot, self.clusters, window, &mut self.window)?;
        }
        let cluster = self.window.cluster_at(position)?;
        return Ok(volume.sector_addr(cluster, block));
    }
}

/// Address just past `sectors` blocks starting at `base`, if the card can address it.
fn region_end(base: u32, sectors: u32) -> Result<u32> {
    return sectors
        .checked_mul(BLOCK_SIZE as u32)
        .and_then(|len| base.checked_add(len))
        .ok_or(DiskError::BadField);
}

impl Volume {
    pub fn mount<B: CardBus>(sd: &mut SdCard<B>) -> Result<Volume> {
        let mut signature = [0u8; 5];
        sd.read_bytes(BPB_SIGNATURE_OFFSET, &mut signature)?;
        let bpb_addr = if &signature == b"FAT16" {
            0
        } else {
            let mut lba = [0u8; 4];
            sd.read_bytes(MBR_PARTITION_LBA, &mut lba)?;
            u32::from_le_bytes(lba).checked_mul(BLOCK_SIZE as u32).ok_or(DiskError::BadField)?
        };
        // The whole boot sector must be addressable.
        region_end(bpb_addr, 1)?;

        let mut raw = [0u8; 3];
        sd.read_bytes(bpb_addr + BPB_SECTORS_PER_CLUSTER, &mut raw)?;
        let sectors_per_cluster = raw[0];
        if !sectors_per_cluster.is_power_of_two() {
            return Err(DiskError::BadField);
        }
        let cluster_shift = sectors_per_cluster.trailing_zeros() as u8;
        let reserved_sectors = u16::from_le_bytes([raw[1], raw[2]]);
        let fat_addr = region_end(bpb_addr, reserved_sectors as u32)?;

        let sectors_per_fat = sd.read_u16(bpb_addr + BPB_SECTORS_PER_FAT)?;
        let root_addr = region_end(fat_addr, sectors_per_fat as u32 * 2)?;
        let user_addr = region_end(root_addr, ROOT_DIR_SECTORS)?;

        let mut total_sectors = sd.read_u16(bpb_addr + BPB_TOTAL_SECTORS_16)? as u32;
        if total_sectors == 0 {
            let mut raw = [0u8; 4];
            sd.read_bytes(bpb_addr + BPB_TOTAL_SECTORS_32, &mut raw)?;
            total_sectors = u32::from_le_bytes(raw);
        }
        let system_sectors = (user_addr - bpb_addr) / BLOCK_SIZE as u32;
        let data_clusters = total_sectors.saturating_sub(system_sectors) >> cluster_shift;
        let fat_entries = sectors_per_fat as u32 * (BLOCK_SIZE as u32 / 2);
        let cluster_limit = data_clusters.saturating_add(FIRST_CLUSTER as u32).min(fat_entries);
        if cluster_limit > FIRST_CLUSTER as u32 {
            region_end(user_addr, (cluster_limit - FIRST_CLUSTER as u32) << cluster_shift)?;
        }

        let volume = Volume {
            bpb_addr,
            sectors_per_cluster,
            cluster_shift,
            reserved_sectors,
            fat_addr,
            root_addr,
            user_addr,
            sectors_per_fat,
            cluster_limit,
        };
        info!(
            "fat16 mounted: bpb {:#x} spc {} fat {:#x} root {:#x} data {:#x}",
            bpb_addr, sectors_per_cluster, fat_addr, root_addr, user_addr
        );
        return Ok(volume);
    }

    pub fn entry_addr(&self, slot: u16) -> u32 {
        return self.root_addr + slot as u32 * DIR_ENTRY_SIZE;
    }

    pub fn fat_entry_addr(&self, cluster: u16) -> u32 {
        return self.fat_addr + cluster as u32 * 2;
    }

    pub fn clusters_for(&self, sectors: u16) -> u16 {
        return ((sectors as u32 + self.sectors_per_cluster as u32 - 1) >> self.cluster_shift) as u16;
    }

    pub fn position_of(&self, sector: u16) -> u16 {
        return sector >> self.cluster_shift;
    }

    /// Card address of file-relative block `sector`, which lives in `cluster`.
    pub fn sector_addr(&self, cluster: u16, sector: u16) -> u32 {
        let offset = sector as u32 & (self.sectors_per_cluster as u32 - 1);
        let block = ((cluster as u32 - FIRST_CLUSTER as u32) << self.cluster_shift) + offset;
        return self.user_addr + block * BLOCK_SIZE as u32;
    }

    fn first_byte<B: CardBus>(&self, sd: &mut SdCard<B>, slot: u16, offset: u32) -> Result<u8> {
        let mut b = [0u8; 1];
        sd.read_bytes(self.entry_addr(slot) + offset, &mut b)?;
        return Ok(b[0]);
    }

    pub fn file_name<B: CardBus>(&self, sd: &mut SdCard<B>, slot: u16) -> Result<[u8; 8]> {
        let mut name = [0u8; 8];
        sd.read_bytes(self.entry_addr(slot), &mut name)?;
        return Ok(name);
    }

    /// Cheap filter on the first name byte and the attribute byte.
    fn is_listable<B: CardBus>(&self, sd: &mut SdCard<B>, slot: u16) -> Result<bool> {
        let d = self.first_byte(sd, slot, 0)?;
        if matches!(d, ENTRY_FREE | ENTRY_KANJI_E5 | ENTRY_DOT | ENTRY_DELETED) {
            return Ok(false);
        }
        if !(d.is_ascii_uppercase() || d.is_ascii_digit()) {
            return Ok(false);
        }
        let attr = self.first_byte(sd, slot, ENTRY_ATTR)?;
        if attr & ATTR_SKIP_MASK != 0 || attr == ATTR_LONG_NAME {
            return Ok(false);
        }
        return Ok(true);
    }

    /**
    Find the newest file with extension `ext`, or the newest one named
    `name` when a name is given. Newest is the largest (date, time); on a
    tie the entry scanned later wins.
    */
    pub fn find_file<B: CardBus>(
        &self,
        sd: &mut SdCard<B>,
        ext: &[u8; 3],
        name: Option<&[u8; 8]>,
    ) -> Result<Option<DirMatch>> {
        let mut best: Option<DirMatch> = None;
        let mut max_date = 0u16;
        let mut max_time = 0u16;

        for slot in 0..DIR_SLOTS {
            if !sd.is_present() {
                return Err(DiskError::CardRemoved);
            }
            if !self.is_listable(sd, slot)? {
                continue;
            }

            let mut head = [0u8; 12];
            sd.read_bytes(self.entry_addr(slot), &mut head)?;
            let mut stamp = [0u8; 4];
            sd.read_bytes(self.entry_addr(slot) + ENTRY_TIME, &mut stamp)?;

            if &head[8..11] != ext {
                continue;
            }
            if let Some(wanted) = name {
                if &head[0..8] != wanted {
                    continue;
                }
            }

            let time = u16::from_le_bytes([stamp[0], stamp[1]]);
            let date = u16::from_le_bytes([stamp[2], stamp[3]]);
            if date > max_date || (date == max_date && time >= max_time) {
                max_date = date;
                max_time = time;
                let mut found = [0u8; 8];
                found.copy_from_slice(&head[0..8]);
                best = Some(DirMatch {
                    slot,
                    name: found,
                    read_only: head[11] & ATTR_READ_ONLY != 0,
                });
            }
        }

        match &best {
            Some(m) => trace!("found {:?} in slot {}", ext, m.slot),
            None => trace!("no {:?} file", ext),
        }
        return Ok(best);
    }

    /// Fill `out` with the slots of every file with extension `ext`, sorted
    /// by name. Returns how many were found.
    pub fn list_files<B: CardBus>(&self, sd: &mut SdCard<B>, ext: &[u8; 3], out: &mut [u16]) -> Result<usize> {
        let mut count = 0;
        for slot in 0..DIR_SLOTS {
            if count == out.len() {
                break;
            }
            if !sd.is_present() {
                return Err(DiskError::CardRemoved);
            }
            if !self.is_listable(sd, slot)? {
                continue;
            }
            let mut found = [0u8; 3];
            sd.read_bytes(self.entry_addr(slot) + 8, &mut found)?;
            if &found == ext {
                out[count] = slot;
                count += 1;
            }
        }

        for i in 1..count {
            let key = out[i];
            let key_name = self.file_name(sd, key)?;
            let mut j = i;
            while j > 0 {
                if self.file_name(sd, out[j - 1])? <= key_name {
                    break;
                }
                out[j] = out[j - 1];
                j -= 1;
            }
            out[j] = key;
        }
        return Ok(count);
    }

    pub fn start_cluster<B: CardBus>(&self, sd: &mut SdCard<B>, slot: u16) -> Result<u16> {
        return sd.read_u16(self.entry_addr(slot) + ENTRY_START_CLUSTER);
    }

    /**
    Walk the chain of the file in `slot` from its first cluster and record
    window `window` into `out`. `length` is the file's cluster count and
    bounds the walk. Always starts from the head of the chain.
    */
    pub fn chain_window<B: CardBus, const N: usize>(
        &self,
        sd: &mut SdCard<B>,
        slot: u16,
        length: u16,
        window: u16,
        out: &mut ChainWindow<N>,
    ) -> Result<()> {
        out.invalidate();

        let first = window as usize * N;
        let end = (first + N).min(length as usize);
        let mut len = 0;

        let mut cluster = self.start_cluster(sd, slot)?;
        if is_chain_link(cluster) {
            if window == 0 {
                out.clusters[0] = cluster;
                len = 1;
            }
            for position in 1..end {
                cluster = sd.read_u16(self.fat_entry_addr(cluster))?;
                if !is_chain_link(cluster) {
                    break;
                }
                if position >= first {
                    out.clusters[position - first] = cluster;
                    len += 1;
                }
            }
        }

        out.len = len;
        out.index = Some(window);
        trace!("chain window {} of slot {}: {} clusters", window, slot, len);
        return Ok(());
    }

    /// Patch `data` into the card at `address` with a read-modify-write of
    /// the enclosing block. `data` must not cross a block boundary.
    pub fn write_bytes<B: CardBus>(
        &self,
        sd: &mut SdCard<B>,
        address: u32,
        data: &[u8],
        scratch: &mut Block,
    ) -> Result<()> {
        let base = address & !(BLOCK_SIZE as u32 - 1);
        let offset = (address - base) as usize;
        sd.set_block_len(BLOCK_SIZE as u16)?;
        sd.read_block(base, scratch)?;
        scratch[offset..offset + data.len()].copy_from_slice(data);
        return sd.write_block(base, &scratch[..]);
    }

    pub fn duplicate_fat<B: CardBus>(&self, sd: &mut SdCard<B>, scratch: &mut Block) -> Result<()> {
        sd.set_block_len(BLOCK_SIZE as u16)?;
        let copy_offset = self.sectors_per_fat as u32 * BLOCK_SIZE as u32;
        for i in 0..self.sectors_per_fat as u32 {
            let address = self.fat_addr + i * BLOCK_SIZE as u32;
            sd.read_block(address, scratch)?;
            sd.write_block(address + copy_offset, &scratch[..])?;
        }
        return Ok(());
    }

    fn count_free_clusters<B: CardBus>(&self, sd: &mut SdCard<B>, wanted: u16) -> Result<u16> {
        let mut free = 0;
        let mut cluster = FIRST_CLUSTER as u32;
        while free < wanted && cluster < self.cluster_limit {
            if sd.read_u16(self.fat_entry_addr(cluster as u16))? == 0 {
                free += 1;
            }
            cluster += 1;
        }
        return Ok(free);
    }

    /**
    Create `name.ext` holding `sectors` blocks in the first free root slot.
    The new clusters are the lowest free ones, linked in ascending order.
    The entry carries no timestamp.
    */
    pub fn create_file<B: CardBus>(
        &self,
        sd: &mut SdCard<B>,
        name: &[u8; 8],
        ext: &[u8; 3],
        sectors: u16,
        scratch: &mut Block,
    ) -> Result<u16> {
        let mut slot = DIR_SLOTS;
        for candidate in 0..DIR_SLOTS {
            if !sd.is_present() {
                return Err(DiskError::CardRemoved);
            }
            let first = self.first_byte(sd, candidate, 0)?;
            let attr = self.first_byte(sd, candidate, ENTRY_ATTR)?;
            if (first == ENTRY_DELETED || first == ENTRY_FREE) && attr != ATTR_LONG_NAME {
                slot = candidate;
                break;
            }
        }
        if slot == DIR_SLOTS {
            return Err(DiskError::DirectoryFull);
        }

        let clusters = self.clusters_for(sectors);
        if self.count_free_clusters(sd, clusters)? < clusters {
            return Err(DiskError::NoFreeClusters);
        }

        let mut entry = [0u8; DIR_ENTRY_SIZE as usize];
        entry[0..8].copy_from_slice(name);
        entry[8..11].copy_from_slice(ext);
        entry[28..32].copy_from_slice(&(sectors as u32 * BLOCK_SIZE as u32).to_le_bytes());
        self.write_bytes(sd, self.entry_addr(slot), &entry, scratch)?;

        if sectors == 0 {
            self.duplicate_fat(sd, scratch)?;
            return Ok(slot);
        }

        let mut link = self.entry_addr(slot) + ENTRY_START_CLUSTER;
        let mut allocated = 0;
        let mut cluster = FIRST_CLUSTER;
        while allocated < clusters {
            if sd.read_u16(self.fat_entry_addr(cluster))? == 0 {
                self.write_bytes(sd, link, &cluster.to_le_bytes(), scratch)?;
                link = self.fat_entry_addr(cluster);
                allocated += 1;
            }
            cluster += 1;
        }
        self.write_bytes(sd, link, &END_OF_CHAIN.to_le_bytes(), scratch)?;
        self.duplicate_fat(sd, scratch)?;

        debug!("created file in slot {} with {} clusters", slot, clusters);
        return Ok(slot);
    }

    pub fn patch_directory_name<B: CardBus>(
        &self,
        sd: &mut SdCard<B>,
        slot: u16,
        name: &[u8; 8],
        scratch: &mut Block,
    ) -> Result<()> {
        self.write_bytes(sd, self.entry_addr(slot), name, scratch)?;
        return self.duplicate_fat(sd, scratch);
    }
}

#[cfg(test)]
mod test_fat16 {
    use super::*;
    use crate::sim::{Fat16Builder, SimCard, SimLayout, SimVolume, ATTR_ARCHIVE, ATTR_HIDDEN, ATTR_READ_ONLY};

    fn mount(volume: SimVolume) -> (SdCard<SimCard>, Volume, SimLayout) {
        let layout = volume.layout();
        let mut sd = SdCard::new(SimCard::new(volume.into_image()));
        sd.initialize().unwrap();
        let vol = Volume::mount(&mut sd).unwrap();
        return (sd, vol, layout);
    }

    #[test]
    pub fn test_mount_unpartitioned() {
        let built = Fat16Builder::new(64, 4).reserved(4).build();
        let (_, vol, layout) = mount(built);
        assert_eq!(vol.bpb_addr, 0);
        assert_eq!(vol.sectors_per_cluster, 4);
        assert_eq!(vol.cluster_shift, 2);
        assert_eq!(vol.reserved_sectors, 4);
        assert_eq!(vol.fat_addr as usize, layout.fat);
        assert_eq!(vol.root_addr as usize, layout.root);
        assert_eq!(vol.user_addr as usize, layout.user);
        assert_eq!(vol.cluster_limit, 66);
    }

    #[test]
    pub fn test_mount_behind_partition_table() {
        let built = Fat16Builder::new(32, 2).partitioned(8).build();
        let (_, vol, layout) = mount(built);
        assert_eq!(vol.bpb_addr, 8 * 512);
        assert_eq!(vol.cluster_shift, 1);
        assert_eq!(vol.root_addr as usize, layout.root);
    }

    fn unformatted(partition_lba: [u8; 4]) -> SdCard<SimCard> {
        let mut image = std::vec![0u8; 4 * BLOCK_SIZE];
        image[0x1C6..0x1CA].copy_from_slice(&partition_lba);
        let mut sd = SdCard::new(SimCard::new(image));
        sd.initialize().unwrap();
        return sd;
    }

    #[test]
    pub fn test_mount_rejects_partition_past_card_range() {
        // No FAT16 signature and boot code where the partition start would be.
        let mut sd = unformatted([0xFF, 0xFF, 0xFF, 0x7F]);
        assert_eq!(Volume::mount(&mut sd), Err(DiskError::BadField));

        // Start fits, but the boot sector would run off the end of the address space.
        let mut sd = unformatted([0xFF, 0xFF, 0x7F, 0x00]);
        assert_eq!(Volume::mount(&mut sd), Err(DiskError::BadField));
    }

    #[test]
    pub fn test_mount_rejects_zero_cluster_size() {
        let mut sd = unformatted([0, 0, 0, 0]);
        assert_eq!(Volume::mount(&mut sd), Err(DiskError::BadField));
    }

    #[test]
    pub fn test_find_file_prefers_newest() {
        let mut built = Fat16Builder::new(64, 1).build();
        built.add_file(0, b"OLDER   ", b"DSK", ATTR_ARCHIVE, &[1; 10], 0x4000, 0x0100);
        built.add_file(1, b"NEWER   ", b"DSK", ATTR_ARCHIVE, &[2; 10], 0x4001, 0x0000);
        built.add_file(2, b"OTHER   ", b"NIC", ATTR_ARCHIVE, &[3; 10], 0x5000, 0x0000);
        let (mut sd, vol, _) = mount(built);

        let found = vol.find_file(&mut sd, b"DSK", None).unwrap().unwrap();
        assert_eq!(found.slot, 1);
        assert_eq!(&found.name, b"NEWER   ");

        let named = vol.find_file(&mut sd, b"DSK", Some(b"OLDER   ")).unwrap().unwrap();
        assert_eq!(named.slot, 0);
    }

    #[test]
    pub fn test_find_file_tie_goes_to_later_slot() {
        let mut built = Fat16Builder::new(64, 1).build();
        built.add_file(3, b"FIRST   ", b"BTF", ATTR_ARCHIVE, &[], 0x4321, 0x1234);
        built.add_file(9, b"SECOND  ", b"BTF", ATTR_ARCHIVE, &[], 0x4321, 0x1234);
        let (mut sd, vol, _) = mount(built);

        let found = vol.find_file(&mut sd, b"BTF", None).unwrap().unwrap();
        assert_eq!(found.slot, 9);
        assert_eq!(&found.name, b"SECOND  ");
    }

    #[test]
    pub fn test_find_file_skips_unlisted_entries() {
        let mut built = Fat16Builder::new(64, 1).build();
        built.add_file(0, b"HIDDEN  ", b"NIC", ATTR_HIDDEN, &[], 0x7000, 0);
        built.add_file(1, b"lower   ", b"NIC", ATTR_ARCHIVE, &[], 0x7000, 0);
        built.add_file(2, b"DELETED ", b"NIC", ATTR_ARCHIVE, &[], 0x7000, 0);
        built.raw_entry_mut(2)[0] = 0xE5;
        built.add_file(3, b"LFNPART ", b"NIC", 0x0F, &[], 0x7000, 0);
        built.add_file(5, b"GAME    ", b"NIC", ATTR_READ_ONLY, &[], 0x0001, 0);
        let (mut sd, vol, _) = mount(built);

        let found = vol.find_file(&mut sd, b"NIC", None).unwrap().unwrap();
        assert_eq!(found.slot, 5);
        assert!(found.read_only);
    }

    #[test]
    pub fn test_find_file_not_found() {
        let mut built = Fat16Builder::new(64, 1).build();
        built.add_file(0, b"GAME    ", b"DSK", ATTR_ARCHIVE, &[], 0, 0);
        let (mut sd, vol, _) = mount(built);
        assert_eq!(vol.find_file(&mut sd, b"NIC", None).unwrap(), None);
        assert_eq!(vol.find_file(&mut sd, b"DSK", Some(b"OTHER   ")).unwrap(), None);
    }

    #[test]
    pub fn test_find_file_card_removed() {
        let mut built = Fat16Builder::new(64, 1).build();
        built.add_file(0, b"GAME    ", b"DSK", ATTR_ARCHIVE, &[], 0, 0);
        let (mut sd, vol, _) = mount(built);
        sd.bus().eject_after(400);
        assert_eq!(vol.find_file(&mut sd, b"DSK", None), Err(DiskError::CardRemoved));
    }

    #[test]
    pub fn test_list_files_sorted_by_name() {
        let mut built = Fat16Builder::new(64, 1).build();
        built.add_file(0, b"ZORK    ", b"NIC", ATTR_ARCHIVE, &[], 0, 0);
        built.add_file(1, b"CHOPLIFT", b"NIC", ATTR_ARCHIVE, &[], 0, 0);
        built.add_file(2, b"KARATEKA", b"DSK", ATTR_ARCHIVE, &[], 0, 0);
        built.add_file(3, b"AZTEC   ", b"NIC", ATTR_ARCHIVE, &[], 0, 0);
        let (mut sd, vol, _) = mount(built);

        let mut slots = [0u16; 8];
        let count = vol.list_files(&mut sd, b"NIC", &mut slots).unwrap();
        assert_eq!(&slots[..count], &[3, 1, 0]);
    }

    #[test]
    pub fn test_chain_window_fragmented() {
        let mut built = Fat16Builder::new(64, 1).build();
        // 10 clusters scattered over the FAT.
        let chain = [7u16, 3, 20, 21, 22, 9, 40, 41, 5, 60];
        built.write_chain(&chain, &[]);
        built.write_entry(0, b"FRAG    ", b"NIC", ATTR_ARCHIVE, 7, 10 * 512, 0, 0);
        let (mut sd, vol, _) = mount(built);

        let mut window = ChainWindow::<4>::new();
        vol.chain_window(&mut sd, 0, 10, 0, &mut window).unwrap();
        assert_eq!(window.index(), Some(0));
        assert_eq!(window.clusters(), &[7, 3, 20, 21]);

        vol.chain_window(&mut sd, 0, 10, 1, &mut window).unwrap();
        assert_eq!(window.clusters(), &[22, 9, 40, 41]);
        assert_eq!(window.cluster_at(5).unwrap(), 9);
        assert_eq!(window.cluster_at(2), Err(DiskError::BadChain(2)));

        vol.chain_window(&mut sd, 0, 10, 2, &mut window).unwrap();
        assert_eq!(window.clusters(), &[5, 60]);
    }

    #[test]
    pub fn test_chain_window_stops_at_end_of_chain() {
        let mut built = Fat16Builder::new(64, 1).build();
        built.write_chain(&[2, 3, 4], &[]);
        built.write_entry(0, b"SHORT   ", b"NIC", ATTR_ARCHIVE, 2, 3 * 512, 0, 0);
        let (mut sd, vol, _) = mount(built);

        // Claim more clusters than the chain has.
        let mut window = ChainWindow::<8>::new();
        vol.chain_window(&mut sd, 0, 20, 0, &mut window).unwrap();
        assert_eq!(window.clusters(), &[2, 3, 4]);
        assert_eq!(window.cluster_at(3), Err(DiskError::BadChain(3)));

        vol.chain_window(&mut sd, 0, 20, 1, &mut window).unwrap();
        assert_eq!(window.clusters(), &[] as &[u16]);
    }

    #[test]
    pub fn test_chain_window_stops_at_bad_cluster() {
        let mut built = Fat16Builder::new(64, 1).build();
        built.write_chain(&[2, 3, 4, 5], &[]);
        built.set_fat(3, 0xFFF7);
        built.write_entry(0, b"BAD     ", b"NIC", ATTR_ARCHIVE, 2, 4 * 512, 0, 0);
        let (mut sd, vol, _) = mount(built);

        let mut window = ChainWindow::<8>::new();
        vol.chain_window(&mut sd, 0, 4, 0, &mut window).unwrap();
        assert_eq!(window.clusters(), &[2, 3]);
    }

    #[test]
    pub fn test_chain_window_stops_at_reserved_cluster() {
        let mut built = Fat16Builder::new(64, 1).build();
        built.write_chain(&[2, 3, 4, 5], &[]);
        built.set_fat(4, 0xFFF6);
        built.write_entry(0, b"RESV    ", b"NIC", ATTR_ARCHIVE, 2, 4 * 512, 0, 0);
        let (mut sd, vol, _) = mount(built);

        let mut window = ChainWindow::<8>::new();
        vol.chain_window(&mut sd, 0, 4, 0, &mut window).unwrap();
        assert_eq!(window.clusters(), &[2, 3, 4]);
        assert!(is_chain_link(0xFFF5));
        assert!(!is_chain_link(0xFFF6));
        assert!(!is_chain_link(1));
    }

    #[test]
    pub fn test_create_file_allocates_chain() {
        let mut built = Fat16Builder::new(64, 2).build();
        built.add_file(0, b"GAME    ", b"DSK", ATTR_ARCHIVE, &[0xAB; 3 * 1024], 0, 0);
        // Punch a hole so the new chain is not contiguous.
        built.write_chain(&[9], &[]);
        let (mut sd, vol, layout) = mount(built);

        let mut scratch = [0u8; BLOCK_SIZE];
        let slot = vol.create_file(&mut sd, b"GAME    ", b"NIC", 9, &mut scratch).unwrap();
        assert_eq!(slot, 1);

        let image = sd.bus_ref().image();
        let entry = layout.entry(image, slot);
        assert_eq!(&entry[0..11], b"GAME    NIC");
        assert_eq!(u32::from_le_bytes([entry[28], entry[29], entry[30], entry[31]]), 9 * 512);
        assert_eq!(layout.chain(image, slot), [5u16, 6, 7, 8, 10].to_vec());
        assert_eq!(layout.fat_entry(image, 10), END_OF_CHAIN);

        let fat1 = &image[layout.fat..layout.fat + layout.fat_bytes];
        let fat2 = &image[layout.fat + layout.fat_bytes..layout.fat + 2 * layout.fat_bytes];
        assert_eq!(fat1, fat2);
    }

    #[test]
    pub fn test_create_empty_file() {
        let built = Fat16Builder::new(64, 1).build();
        let (mut sd, vol, layout) = mount(built);
        let mut scratch = [0u8; BLOCK_SIZE];
        let slot = vol.create_file(&mut sd, b"GAME    ", b"BTF", 0, &mut scratch).unwrap();
        assert_eq!(slot, 0);
        let image = sd.bus_ref().image();
        let entry = layout.entry(image, slot);
        assert_eq!(&entry[0..11], b"GAME    BTF");
        assert_eq!(&entry[26..32], &[0; 6]);

        let found = vol.find_file(&mut sd, b"BTF", None).unwrap().unwrap();
        assert_eq!(found.slot, 0);
    }

    #[test]
    pub fn test_create_file_reuses_deleted_slot() {
        let mut built = Fat16Builder::new(64, 1).build();
        built.add_file(0, b"KEEP    ", b"DSK", ATTR_ARCHIVE, &[], 0, 0);
        built.add_file(1, b"GONE    ", b"DSK", ATTR_ARCHIVE, &[], 0, 0);
        built.raw_entry_mut(1)[0] = 0xE5;
        let (mut sd, vol, _) = mount(built);
        let mut scratch = [0u8; BLOCK_SIZE];
        assert_eq!(vol.create_file(&mut sd, b"NEW     ", b"BTF", 0, &mut scratch), Ok(1));
    }

    #[test]
    pub fn test_create_file_directory_full() {
        let mut built = Fat16Builder::new(64, 1).build();
        for slot in 0..512 {
            built.write_entry(slot, b"FILL    ", b"TXT", ATTR_ARCHIVE, 0, 0, 0, 0);
        }
        let (mut sd, vol, _) = mount(built);
        let mut scratch = [0u8; BLOCK_SIZE];
        assert_eq!(
            vol.create_file(&mut sd, b"GAME    ", b"BTF", 0, &mut scratch),
            Err(DiskError::DirectoryFull)
        );
    }

    #[test]
    pub fn test_create_file_without_space() {
        let built = Fat16Builder::new(16, 1).build();
        let (mut sd, vol, layout) = mount(built);
        let mut scratch = [0u8; BLOCK_SIZE];
        assert_eq!(
            vol.create_file(&mut sd, b"GAME    ", b"NIC", 560, &mut scratch),
            Err(DiskError::NoFreeClusters)
        );
        // Nothing was written.
        assert_eq!(layout.entry(sd.bus_ref().image(), 0)[0], 0);
    }

    #[test]
    pub fn test_patch_directory_name() {
        let mut built = Fat16Builder::new(64, 1).build();
        built.add_file(4, b"OLDNAME ", b"BTF", ATTR_ARCHIVE, &[], 0x1111, 0x2222);
        let (mut sd, vol, layout) = mount(built);
        let mut scratch = [0u8; BLOCK_SIZE];
        let before = sd.bus_ref().writes();
        vol.patch_directory_name(&mut sd, 4, b"NEWNAME ", &mut scratch).unwrap();

        let image = sd.bus_ref().image();
        let entry = layout.entry(image, 4);
        assert_eq!(&entry[0..11], b"NEWNAME BTF");
        assert_eq!(&entry[24..26], &0x1111u16.to_le_bytes());
        // Entry block plus both FAT blocks of the copy.
        assert_eq!(sd.bus_ref().writes() - before, 1 + vol.sectors_per_fat as usize);
    }

    #[test]
    pub fn test_image_chain_refreshes_window_on_demand() {
        let mut built = Fat16Builder::new(64, 2).build();
        let chain: std::vec::Vec<u16> = (10..20).collect();
        built.write_chain(&chain, &[]);
        built.write_entry(0, b"GAME    ", b"NIC", ATTR_ARCHIVE, 10, 20 * 512, 0, 0);
        let (mut sd, vol, layout) = mount(built);

        let mut image = ImageChain::<4>::new();
        image.open(&vol, 0, 20);
        let addr = image.block_addr(&mut sd, &vol, 3).unwrap() as usize;
        assert_eq!(addr, layout.user + (9 * 2 + 1) * 512);
        assert_eq!(image.window().index(), Some(0));

        let addr = image.block_addr(&mut sd, &vol, 19).unwrap() as usize;
        assert_eq!(addr, layout.user + (17 * 2 + 1) * 512);
        assert_eq!(image.window().index(), Some(2));

        assert_eq!(image.block_addr(&mut sd, &vol, 20), Err(DiskError::BadChain(10)));
    }

    #[test]
    pub fn test_sector_addressing() {
        let built = Fat16Builder::new(64, 4).build();
        let (_, vol, layout) = mount(built);
        assert_eq!(vol.clusters_for(560), 140);
        assert_eq!(vol.clusters_for(1), 1);
        assert_eq!(vol.position_of(9), 2);
        let addr = vol.sector_addr(5, 9) as usize;
        assert_eq!(addr, layout.user + (3 * 4 + 1) * 512);
    }
}
