//! Block-device facade and slot lifecycle: per-partition device objects,
//! registration under `/dev/mmcsd<minor><suffix>`, media-change handling.

use alloc::format;
use alloc::sync::Arc;

use log::*;

use crate::error::{Result, SdError};
use crate::host::{MediaEvent, SdioHost, SleepOps};
#[cfg(feature = "ioctl")]
use crate::ioctl::IocCmd;
use crate::slot::{CardKind, SdSlot, SlotInner, MAX_CREFS, MMCSD_PART_COUNT};
use crate::BLOCK_SHIFT;

/// Device name stem; minor number and partition suffix complete it.
pub const DEV_NAME_PREFIX: &str = "/dev/mmcsd";

/// Name suffix per hardware partition index.
pub const PART_SUFFIXES: [&str; MMCSD_PART_COUNT] =
    ["", "boot0", "boot1", "rpmb", "gp1", "gp2", "gp3", "gp4"];

/// Node mode for registered entries.
pub const DEV_MODE: u32 = 0o666;

/// Geometry snapshot returned to the block layer. Reading it consumes the
/// media-changed flag.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Geometry {
    pub available: bool,
    pub mediachanged: bool,
    pub writeenabled: bool,
    pub nsectors: u32,
    pub sectorsize: u32,
}

/// Requests accepted by [`BlockDevice::ioctl`].
pub enum BlockIoctl<'a, 'b> {
    /// Re-probe the slot (`BIOC_PROBE`).
    Probe,
    /// Tear the card down and re-arm the insertion callback (`BIOC_EJECT`).
    Eject,
    /// Raw command pass-through (`MMC_IOC_CMD`).
    #[cfg(feature = "ioctl")]
    MmcCmd(&'b mut IocCmd<'a>),
    /// Bounded raw command batch (`MMC_IOC_MULTI_CMD`).
    #[cfg(feature = "ioctl")]
    MmcMultiCmd(&'b mut [IocCmd<'a>]),
    /// Unconstructible; keeps the lifetimes alive when the raw-command
    /// surface is compiled out.
    #[cfg(not(feature = "ioctl"))]
    #[doc(hidden)]
    _Raw(
        core::convert::Infallible,
        core::marker::PhantomData<(&'a (), &'b mut ())>,
    ),
}

/// The contract each registered partition device exposes to the block
/// layer. Buffers are counted in 512-byte blocks.
pub trait BlockDevice: Send + Sync {
    fn open(&self) -> Result<()>;
    fn close(&self) -> Result<()>;
    fn read(&self, buf: &mut [u8], startblock: u32, nblocks: u32) -> Result<u32>;
    fn write(&self, buf: &[u8], startblock: u32, nblocks: u32) -> Result<u32>;
    fn geometry(&self) -> Result<Geometry>;
    fn ioctl(&self, req: BlockIoctl<'_, '_>) -> Result<()>;
}

/// Block-device registration glue the surrounding OS provides. Entries are
/// expected to appear with mode [`DEV_MODE`].
pub trait DeviceRegistry: Send + Sync {
    fn register(&self, name: &str, device: Arc<dyn BlockDevice>) -> Result<()>;
    fn unregister(&self, name: &str) -> Result<()>;
}

/// One registered partition: a shared slot reference plus the hardware
/// partition index it addresses.
pub struct PartitionDevice<H: SdioHost, S: SleepOps> {
    slot: Arc<SdSlot<H, S>>,
    index: usize,
}

impl<H, S> PartitionDevice<H, S>
where
    H: SdioHost + Send + 'static,
    S: SleepOps + Send + Sync + 'static,
{
    fn check_range(
        &self,
        inner: &SlotInner<H>,
        buflen: usize,
        startblock: u32,
        nblocks: u32,
    ) -> Result<()> {
        if inner.kind == CardKind::Unknown {
            return Err(SdError::NoDevice);
        }
        let end = startblock
            .checked_add(nblocks)
            .ok_or(SdError::InvalidArgument)?;
        if end > inner.part[self.index].nblocks {
            return Err(SdError::InvalidArgument);
        }
        if buflen < (nblocks as usize) << BLOCK_SHIFT {
            return Err(SdError::InvalidArgument);
        }
        Ok(())
    }

    fn chunk_limit(&self) -> u32 {
        match self.slot.config.multiblock_limit {
            0 => u32::MAX,
            n => n,
        }
    }
}

impl<H, S> BlockDevice for PartitionDevice<H, S>
where
    H: SdioHost + Send + 'static,
    S: SleepOps + Send + Sync + 'static,
{
    fn open(&self) -> Result<()> {
        let mut inner = self.slot.inner.lock();
        if inner.crefs == MAX_CREFS {
            return Err(SdError::InvalidArgument);
        }
        inner.crefs += 1;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut inner = self.slot.inner.lock();
        inner.crefs = inner.crefs.saturating_sub(1);
        Ok(())
    }

    /// Read `nblocks` starting at `startblock`, split into runs no longer
    /// than the configured multi-block limit.
    fn read(&self, buf: &mut [u8], startblock: u32, nblocks: u32) -> Result<u32> {
        let mut inner = self.slot.inner.lock();
        self.check_range(&inner, buf.len(), startblock, nblocks)?;

        let limit = self.chunk_limit();
        let mut done: u32 = 0;
        while done < nblocks {
            let chunk = (nblocks - done).min(limit);
            let lo = (done as usize) << BLOCK_SHIFT;
            let hi = ((done + chunk) as usize) << BLOCK_SHIFT;
            let slice = &mut buf[lo..hi];
            if chunk == 1 {
                self.slot
                    .read_single_locked(&mut inner, self.index, slice, startblock + done)?;
            } else {
                self.slot.read_multiple_locked(
                    &mut inner,
                    self.index,
                    slice,
                    startblock + done,
                    chunk,
                )?;
            }
            done += chunk;
        }
        Ok(done)
    }

    fn write(&self, buf: &[u8], startblock: u32, nblocks: u32) -> Result<u32> {
        let mut inner = self.slot.inner.lock();
        self.check_range(&inner, buf.len(), startblock, nblocks)?;

        let limit = self.chunk_limit();
        let mut done: u32 = 0;
        while done < nblocks {
            let chunk = (nblocks - done).min(limit);
            let lo = (done as usize) << BLOCK_SHIFT;
            let hi = ((done + chunk) as usize) << BLOCK_SHIFT;
            let slice = &buf[lo..hi];
            if chunk == 1 {
                self.slot
                    .write_single_locked(&mut inner, self.index, slice, startblock + done)?;
            } else {
                self.slot.write_multiple_locked(
                    &mut inner,
                    self.index,
                    slice,
                    startblock + done,
                    chunk,
                )?;
            }
            done += chunk;
        }
        Ok(done)
    }

    fn geometry(&self) -> Result<Geometry> {
        let mut inner = self.slot.inner.lock();
        if inner.kind == CardKind::Unknown {
            return Err(SdError::NoDevice);
        }
        let mediachanged = inner.mediachanged;
        inner.mediachanged = false;
        let writeenabled = !inner.wrprotect && !inner.host.write_protected();
        Ok(Geometry {
            available: inner.probed,
            mediachanged,
            writeenabled,
            nsectors: inner.part[self.index].nblocks,
            sectorsize: inner.blocksize,
        })
    }

    fn ioctl(&self, req: BlockIoctl<'_, '_>) -> Result<()> {
        match req {
            BlockIoctl::Probe => SdSlot::probe(&self.slot),
            BlockIoctl::Eject => SdSlot::eject(&self.slot),
            #[cfg(feature = "ioctl")]
            BlockIoctl::MmcCmd(cmd) => {
                let mut inner = self.slot.inner.lock();
                self.slot.iocmd(&mut inner, cmd)
            }
            #[cfg(feature = "ioctl")]
            BlockIoctl::MmcMultiCmd(cmds) => {
                let mut inner = self.slot.inner.lock();
                self.slot.multi_iocmd(&mut inner, cmds)
            }
            #[cfg(not(feature = "ioctl"))]
            BlockIoctl::_Raw(never, _) => match never {},
        }
    }
}

impl<H, S> SdSlot<H, S>
where
    H: SdioHost + Send + 'static,
    S: SleepOps + Send + Sync + 'static,
{
    /// Probe the slot: tear down whatever was there, identify and
    /// initialize the card, then register every populated partition.
    pub fn probe(slot: &Arc<Self>) -> Result<()> {
        let mut inner = slot.inner.lock();
        Self::probe_locked(slot, &mut inner)
    }

    /// Tear the card state down and wait for the next insertion.
    pub fn eject(slot: &Arc<Self>) -> Result<()> {
        let mut inner = slot.inner.lock();
        slot.removed_locked(&mut inner);
        inner.host.callback_enable(MediaEvent::INSERTED);
        Ok(())
    }

    /// Media-change notification; runs in thread context and contends for
    /// the slot mutex like every other entry point.
    pub fn media_change(slot: &Arc<Self>) {
        let mut inner = slot.inner.lock();
        if inner.host.present() {
            if let Err(err) = Self::probe_locked(slot, &mut inner) {
                warn!("mmcsd{}: probe failed: {}", slot.config.minor, err);
                inner.host.callback_enable(MediaEvent::INSERTED);
            }
        } else {
            info!("mmcsd{}: media removed", slot.config.minor);
            slot.removed_locked(&mut inner);
            inner.host.callback_enable(MediaEvent::INSERTED);
        }
    }

    pub(crate) fn probe_locked(slot: &Arc<Self>, inner: &mut SlotInner<H>) -> Result<()> {
        slot.removed_locked(inner);

        if let Err(err) = Self::init_card(slot, inner) {
            inner.reset_card_state();
            return Err(err);
        }

        inner.probed = true;
        inner.mediachanged = true;

        for index in 0..MMCSD_PART_COUNT {
            if inner.part[index].nblocks == 0 {
                continue;
            }
            let name = format!(
                "{}{}{}",
                DEV_NAME_PREFIX, slot.config.minor, PART_SUFFIXES[index]
            );
            let device: Arc<dyn BlockDevice> = Arc::new(PartitionDevice {
                slot: Arc::clone(slot),
                index,
            });
            slot.registry.register(&name, device)?;
            inner.registered.push(name);
        }

        inner.host.callback_enable(MediaEvent::EJECTED);
        Ok(())
    }

    fn init_card(slot: &Arc<Self>, inner: &mut SlotInner<H>) -> Result<()> {
        slot.identify_locked(inner)?;
        match inner.kind {
            CardKind::SdV1 | CardKind::SdV2 => slot.sd_initialize_locked(inner),
            #[cfg(feature = "mmc")]
            CardKind::Mmc => slot.mmc_initialize_locked(inner),
            #[cfg(not(feature = "mmc"))]
            CardKind::Mmc => Err(SdError::Unsupported),
            CardKind::Unknown => Err(SdError::NoDevice),
        }
    }

    /// Unregister every partition name, reset card state, and gate the bus.
    pub(crate) fn removed_locked(&self, inner: &mut SlotInner<H>) {
        if !inner.registered.is_empty() {
            inner.mediachanged = true;
        }
        let names = core::mem::take(&mut inner.registered);
        for name in names {
            if let Err(err) = self.registry.unregister(&name) {
                warn!("mmcsd{}: unregister {} failed: {}", self.config.minor, name, err);
            }
        }
        inner.reset_card_state();
        inner.host.widebus(false);
        inner.host.clock(crate::host::ClockRate::Disabled);
    }
}
