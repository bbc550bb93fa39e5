//! mmcsd
//!
//! mmcsd is the card-side core of an MMC/SD/eMMC block-device driver. It sits
//! above a low-level SDIO host controller (abstracted by [`SdioHost`]) and
//! below the operating system's block-device glue (abstracted by
//! [`DeviceRegistry`]).
//!
//! The crate can be roughly divided into the following layers, bottom to top:
//!
//! - Command primitives: issue a command, fetch and classify its response
//! - Register decoders: CID, CSD, SCR and EXT_CSD into typed geometry
//! - Card state machines: identification (CMD0/CMD1/CMD8/ACMD41) and
//!   initialization (RCA, CSD, select, wide bus, clock bump)
//! - Transfer engine: single/multi block reads and writes with busy tracking
//!   and DMA bounce buffering
//! - Block-device facade: per-partition open/close/read/write/geometry/ioctl
//!   and hotplug lifecycle
//!
//! A slot is bound with [`SdSlot::bind`], which attaches the host, arms the
//! media-change callback, and probes any card already inserted; every
//! partition with a nonzero block count is then registered as
//! `/dev/mmcsd<minor><suffix>`.

#![no_std]

extern crate alloc;

mod cmd;
mod device;
mod error;
mod host;
mod ident;
mod init;
#[cfg(feature = "ioctl")]
mod ioctl;
mod register;
mod slot;
mod transfer;

pub use cmd::{CardState, CardStatus, Cmd, RespKind};
pub use device::{
    BlockDevice, BlockIoctl, DeviceRegistry, Geometry, PartitionDevice, DEV_MODE, DEV_NAME_PREFIX,
    PART_SUFFIXES,
};
pub use error::{Result, SdError};
pub use host::{ClockRate, HostCaps, HostEvent, MediaCallback, MediaEvent, SdioHost, SleepOps};
#[cfg(feature = "ioctl")]
pub use ioctl::{IocCmd, MMC_IOC_MAX_CMDS};
pub use register::{
    capacity_kb, csd_tran_speed_kbps, decode_csd, Cid, DecodedCsd, ExtCsd, Scr, EXT_CSD_SIZE,
};
pub use slot::{CardKind, SdSlot, SlotConfig, MMCSD_PART_COUNT};

/// Block size every card is normalized to after CSD decoding.
pub const BLOCK_SZ: usize = 512;
/// log2 of [`BLOCK_SZ`].
pub const BLOCK_SHIFT: u32 = 9;
