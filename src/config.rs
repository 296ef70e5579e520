// SD card lines. The card is bit-banged, there is no SPI peripheral behind these.
pub static CARD_DO_PIN: usize = 0;
pub static CARD_CS_PIN: usize = 1;
pub static CARD_DETECT_PIN: usize = 3; // LOW while a card is seated
pub static CARD_DI_PIN: usize = 4;
pub static CARD_CLK_PIN: usize = 5;

// Disk II interface.
pub static WRITE_REQUEST_PIN: usize = 2;
pub static PHASE0_PIN: usize = 14;
pub static PHASE1_PIN: usize = 15;
pub static PHASE2_PIN: usize = 16;
pub static PHASE3_PIN: usize = 17;
pub static LED_PIN: usize = 18;
pub static DRIVE_ENABLE_PIN: usize = 23; // LOW enables the drive
pub static READ_PULSE_PIN: usize = 24;
pub static WRITE_DATA_PIN: usize = 25;
pub static WRITE_PROTECT_PIN: usize = 26;

/// Volume number stamped into every address field.
pub const VOLUME: u8 = 0xFE;

/// Number of staged write-back slots.
pub const BUF_NUM: usize = 5;

/// Cluster-chain window sizes for the raw and working images.
pub const FAT_DSK_ELEMS: usize = 18;
pub const FAT_NIC_ELEMS: usize = 35;

/// Number of fixed root directory slots scanned. Also the "not found" value.
pub const DIR_SLOTS: u16 = 512;

/// Polls of the card-detect input before an insertion or removal is trusted.
pub const HOTPLUG_DEBOUNCE_POLLS: u32 = 0x50000;

/// Clocks sent with the card deselected before CMD0.
pub const CARD_WAKE_CLOCKS: usize = 200;

/// Disk II bit cell.
pub const BIT_CELL_NS: u32 = 4_000;

/// Half-bit settle delay of the slow card profile.
pub const SLOW_SETTLE_NS: u32 = 2_500;

pub const DSK_EXT: &[u8; 3] = b"DSK";
pub const NIC_EXT: &[u8; 3] = b"NIC";
pub const BTF_EXT: &[u8; 3] = b"BTF";

/*
 Informationally, a 5.25" DOS 3.3 disk has the following features:

 35 tracks
 16 sectors (per track)
 1 side
 256 bytes (per sector)
 4 stepper phases (per track)
*/
pub const TRACKS: u8 = 35;
pub const SECTORS_PER_TRACK: u8 = 16;

/// Card blocks in a raw image (two 256-byte sectors per block).
pub const DSK_BLOCKS: u16 = 280;
/// Card blocks in a working image (one nibblized sector per block).
pub const NIC_BLOCKS: u16 = 560;
