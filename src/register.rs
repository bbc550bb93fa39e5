//! Decoders for the card registers: CID, CSD, SCR and EXT_CSD.
//!
//! All of them are pure functions of the raw register words, so they carry
//! the golden-table unit tests for the geometry math.

use crate::slot::CardKind;
use crate::BLOCK_SHIFT;

/// EXT_CSD register size in bytes (eMMC only).
pub const EXT_CSD_SIZE: usize = 512;

// EXT_CSD byte offsets consulted by the core.
const EXT_CSD_GP_SIZE_MULT: usize = 143;
const EXT_CSD_PARTITION_SETTING_COMPLETED: usize = 155;
const EXT_CSD_PARTITION_SUPPORT: usize = 160;
const EXT_CSD_RPMB_SIZE_MULT: usize = 168;
const EXT_CSD_REV: usize = 192;
const EXT_CSD_SEC_COUNT: usize = 212;
const EXT_CSD_HC_WP_GRP_SIZE: usize = 221;
const EXT_CSD_HC_ERASE_GRP_SIZE: usize = 224;
const EXT_CSD_BOOT_SIZE_MULT: usize = 226;

// EXT_CSD byte indices written through CMD6.
pub(crate) const EXT_CSD_PART_CONF: u8 = 179;
pub(crate) const EXT_CSD_BUS_WIDTH: u8 = 183;
pub(crate) const EXT_CSD_HS_TIMING: u8 = 185;
pub(crate) const EXT_CSD_BUS_WIDTH_4: u8 = 1;
pub(crate) const EXT_CSD_HS_TIMING_HS: u8 = 1;

/// Card identification register, kept raw for the ioctl pass-through and
/// decoded lazily for probe-time diagnostics.
#[derive(Debug, Copy, Clone, Default)]
pub struct Cid {
    raw: [u32; 4],
}

impl Cid {
    pub fn new(raw: [u32; 4]) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &[u32; 4] {
        &self.raw
    }

    /// Manufacturer ID.
    pub fn mid(&self) -> u8 {
        (self.raw[0] >> 24) as u8
    }

    /// OEM/application ID.
    pub fn oid(&self) -> u16 {
        (self.raw[0] >> 8) as u16
    }

    /// Product name, five ASCII bytes.
    pub fn product_name(&self) -> [u8; 5] {
        [
            self.raw[0] as u8,
            (self.raw[1] >> 24) as u8,
            (self.raw[1] >> 16) as u8,
            (self.raw[1] >> 8) as u8,
            self.raw[1] as u8,
        ]
    }

    /// Product revision, BCD major.minor.
    pub fn revision(&self) -> u8 {
        (self.raw[2] >> 24) as u8
    }

    /// Product serial number.
    pub fn serial(&self) -> u32 {
        ((self.raw[2] & 0x00ff_ffff) << 8) | (self.raw[3] >> 24)
    }

    /// Manufacturing date as (year, month).
    pub fn manufacturing_date(&self) -> (u16, u8) {
        let mdt = (self.raw[3] >> 8) & 0xfff;
        ((((mdt >> 4) & 0xff) + 2000) as u16, (mdt & 0xf) as u8)
    }
}

/// Geometry and flags derived from the CSD.
#[derive(Debug, Copy, Clone, Default)]
pub struct DecodedCsd {
    /// Block count in 512-byte units. Zero when `needs_ext_csd` is set.
    pub nblocks: u32,
    pub blockshift: u32,
    /// The DSR register is implemented and CMD4 may program it.
    pub dsr_imp: bool,
    /// Permanent or temporary write protection.
    pub write_protected: bool,
    /// MMC with C_SIZE = 0xFFF: the real count is EXT_CSD SEC_COUNT.
    pub needs_ext_csd: bool,
}

fn read_bl_len(csd: &[u32; 4]) -> u32 {
    (csd[1] >> 16) & 0xf
}

/// Cards with a native block length above 512 are normalized to 512-byte
/// blocks by scaling the count up.
fn scale_block_count(nblocks: u32, bl_len: u32) -> u32 {
    if bl_len > BLOCK_SHIFT {
        nblocks << (bl_len - BLOCK_SHIFT)
    } else {
        nblocks
    }
}

/// Decode a CSD, dispatching on card kind and addressing mode. The raw words
/// are in transmission order: `csd[0]` holds bits 127:96.
pub fn decode_csd(kind: CardKind, block_addressed: bool, csd: &[u32; 4]) -> DecodedCsd {
    let dsr_imp = (csd[1] >> 12) & 1 != 0;
    let perm_wp = (csd[3] >> 13) & 1 != 0;
    let tmp_wp = (csd[3] >> 12) & 1 != 0;

    let mut needs_ext_csd = false;
    let nblocks = if block_addressed && kind.is_sd() {
        // CSD v2: C_SIZE counts 512 KiB units
        let csize = ((csd[1] & 0x3f) << 16) | (csd[2] >> 16);
        (csize + 1) << 10
    } else {
        // CSD v1 layout, shared by byte-addressed SD and all MMC
        let csize = ((csd[1] & 0x3ff) << 2) | ((csd[2] >> 30) & 3);
        let mult = (csd[2] >> 15) & 7;
        if block_addressed && csize == 0xfff {
            needs_ext_csd = true;
            0
        } else {
            scale_block_count((csize + 1) << (mult + 2), read_bl_len(csd))
        }
    };

    DecodedCsd {
        nblocks,
        blockshift: BLOCK_SHIFT,
        dsr_imp,
        write_protected: perm_wp || tmp_wp,
        needs_ext_csd,
    }
}

/// SD configuration register, received big-endian over the data lines.
#[derive(Debug, Copy, Clone, Default)]
pub struct Scr(u64);

impl Scr {
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }

    pub fn spec_version(&self) -> u8 {
        ((self.0 >> 56) & 0xf) as u8
    }

    /// DAT_BUS_WIDTH nibble.
    pub fn bus_widths(&self) -> u8 {
        ((self.0 >> 48) & 0xf) as u8
    }

    pub fn bus_width_four(&self) -> bool {
        self.bus_widths() & 0x4 != 0
    }

    /// CMD_SUPPORT bit for CMD23 (set block count).
    pub fn cmd23_support(&self) -> bool {
        (self.0 >> 33) & 1 != 0
    }
}

/// Borrowed view over a freshly read EXT_CSD blob.
#[derive(Copy, Clone)]
pub struct ExtCsd<'a>(&'a [u8; EXT_CSD_SIZE]);

impl<'a> ExtCsd<'a> {
    pub fn new(bytes: &'a [u8; EXT_CSD_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn rev(&self) -> u8 {
        self.0[EXT_CSD_REV]
    }

    /// SEC_COUNT, the user-area size in 512-byte sectors.
    pub fn sec_count(&self) -> u32 {
        u32::from_le_bytes([
            self.0[EXT_CSD_SEC_COUNT],
            self.0[EXT_CSD_SEC_COUNT + 1],
            self.0[EXT_CSD_SEC_COUNT + 2],
            self.0[EXT_CSD_SEC_COUNT + 3],
        ])
    }

    /// PARTITIONING_EN bit of PARTITIONING_SUPPORT.
    pub fn partitioning_enabled(&self) -> bool {
        self.0[EXT_CSD_PARTITION_SUPPORT] & 0x1 != 0
    }

    pub fn partition_setting_completed(&self) -> bool {
        self.0[EXT_CSD_PARTITION_SETTING_COMPLETED] & 0x1 != 0
    }

    /// Size of each boot partition in 512-byte blocks
    /// (BOOT_SIZE_MULT x 128 KiB).
    pub fn boot_size_blocks(&self) -> u32 {
        self.0[EXT_CSD_BOOT_SIZE_MULT] as u32 * (128 * 1024 / 512)
    }

    /// Size of the RPMB partition in 512-byte blocks.
    pub fn rpmb_size_blocks(&self) -> u32 {
        self.0[EXT_CSD_RPMB_SIZE_MULT] as u32 * (128 * 1024 / 512)
    }

    /// Size of general-purpose partition `i` (0..4) in 512-byte blocks, or
    /// zero when the partition is absent or partitioning never completed.
    pub fn gp_size_blocks(&self, i: usize) -> u32 {
        if !self.partition_setting_completed() {
            return 0;
        }
        let off = EXT_CSD_GP_SIZE_MULT + 3 * i;
        let mult =
            self.0[off] as u32 | (self.0[off + 1] as u32) << 8 | (self.0[off + 2] as u32) << 16;
        let grp = self.0[EXT_CSD_HC_ERASE_GRP_SIZE] as u32 * self.0[EXT_CSD_HC_WP_GRP_SIZE] as u32;
        mult.saturating_mul(grp).saturating_mul(512 * 1024 / 512)
    }

    pub fn hs_timing(&self) -> u8 {
        self.0[EXT_CSD_HS_TIMING as usize]
    }

    pub fn bus_width(&self) -> u8 {
        self.0[EXT_CSD_BUS_WIDTH as usize]
    }
}

// TRAN_SPEED mantissa table, in tenths.
const TRAN_SPEED_M10: [u32; 16] = [0, 10, 12, 13, 15, 20, 25, 30, 35, 40, 45, 50, 55, 60, 70, 80];

/// Maximum transfer rate the CSD advertises, in kbit/s. 0x32 (25 Mbit/s)
/// and 0x5a (50 Mbit/s) cover nearly every card in the wild.
pub fn csd_tran_speed_kbps(csd: &[u32; 4]) -> u32 {
    let byte = csd[0] & 0xff;
    let unit = match byte & 0x7 {
        0 => 100,
        1 => 1_000,
        2 => 10_000,
        3 => 100_000,
        _ => 0,
    };
    unit * TRAN_SPEED_M10[((byte >> 3) & 0xf) as usize] / 10
}

/// Capacity in KiB for a given block count and shift.
pub fn capacity_kb(nblocks: u32, blockshift: u32) -> u32 {
    if blockshift >= 10 {
        nblocks << (blockshift - 10)
    } else {
        nblocks >> (10 - blockshift)
    }
}
