//! The transfer engine: single- and multi-block reads and writes, with the
//! DMA alignment bounce and the CMD23/ACMD23/CMD12 block-count policy.

use alloc::vec::Vec;

use log::*;

use crate::cmd::Cmd;
use crate::error::{Result, SdError};
use crate::host::{HostCaps, HostEvent, SdioHost, SleepOps};
use crate::slot::{SdSlot, SlotInner, BLOCK_RDATADELAY_MS, BLOCK_WDATADELAY_MS};

/// RPMB lives at hardware partition index 3; multi-block writes aimed at it
/// carry the reliable-write bit in CMD23.
pub(crate) const PART_RPMB: usize = 3;
const CMD23_RELIABLE_WRITE: u32 = 1 << 31;

/// Aligned staging buffer for hosts whose DMA engine rejects the caller's
/// buffer. Over-allocates by the required alignment and carves the aligned
/// window out of the middle.
pub(crate) struct BounceBuffer {
    storage: Vec<u8>,
    offset: usize,
    len: usize,
}

impl BounceBuffer {
    pub(crate) fn new(len: usize, align: usize) -> Result<Self> {
        let align = align.max(1);
        debug_assert!(align.is_power_of_two());
        let mut storage = Vec::new();
        storage
            .try_reserve_exact(len + align)
            .map_err(|_| SdError::OutOfMemory)?;
        storage.resize(len + align, 0);
        let offset = storage.as_ptr().align_offset(align);
        Ok(Self {
            storage,
            offset,
            len,
        })
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.storage[self.offset..self.offset + self.len]
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.offset..self.offset + self.len]
    }
}

/// How the data phase of one transfer moves: PIO, direct DMA, or DMA via a
/// bounce buffer.
struct DmaPlan {
    use_dma: bool,
    bounce: Option<BounceBuffer>,
}

impl<H, S> SdSlot<H, S>
where
    H: SdioHost + Send + 'static,
    S: SleepOps + Send + Sync + 'static,
{
    /// Shared transfer entry checks: lock/write-protect rejection and the
    /// hardware partition switch.
    fn transfer_prologue(
        &self,
        inner: &mut SlotInner<H>,
        part_index: usize,
        write: bool,
    ) -> Result<()> {
        if inner.locked {
            return Err(SdError::PermissionDenied);
        }
        if write && (inner.wrprotect || inner.host.write_protected()) {
            return Err(SdError::PermissionDenied);
        }
        // A pending write must finish programming before the card will take
        // a partition switch.
        if inner.partnum != part_index as u8 {
            self.transfer_ready(inner)?;
        }
        self.select_partition(inner, part_index as u8)
    }

    /// Decide PIO vs DMA vs bounced DMA for `buf`. A failed bounce
    /// allocation degrades to PIO rather than failing the transfer.
    fn plan_dma(&self, inner: &SlotInner<H>, buf: &[u8]) -> DmaPlan {
        if !inner.caps.contains(HostCaps::DMA_SUPPORTED) {
            return DmaPlan {
                use_dma: false,
                bounce: None,
            };
        }
        if inner.host.dma_preflight(buf) {
            return DmaPlan {
                use_dma: true,
                bounce: None,
            };
        }
        match BounceBuffer::new(buf.len(), inner.host.dma_alignment()) {
            Ok(bounce) => DmaPlan {
                use_dma: true,
                bounce: Some(bounce),
            },
            Err(_) => {
                warn!(
                    "mmcsd{}: bounce allocation failed, degrading to PIO",
                    self.config.minor
                );
                DmaPlan {
                    use_dma: false,
                    bounce: None,
                }
            }
        }
    }

    /// Address argument for CMD17/18/24/25: block number for block-addressed
    /// cards, byte offset otherwise.
    fn sector_arg(&self, inner: &SlotInner<H>, startblock: u32) -> u32 {
        if inner.block_addressed {
            startblock
        } else {
            startblock << inner.blockshift
        }
    }

    fn arm_receive(&self, inner: &mut SlotInner<H>, use_dma: bool, buf: &mut [u8]) -> Result<()> {
        let armed = if use_dma {
            inner.host.dma_recv_setup(buf)
        } else {
            inner.host.recv_setup(buf)
        };
        if let Err(err) = armed {
            inner.host.cancel();
            return Err(err);
        }
        Ok(())
    }

    fn arm_send(&self, inner: &mut SlotInner<H>, use_dma: bool, buf: &[u8]) -> Result<()> {
        let armed = if use_dma {
            inner.host.dma_send_setup(buf)
        } else {
            inner.host.send_setup(buf)
        };
        if let Err(err) = armed {
            inner.host.cancel();
            return Err(err);
        }
        Ok(())
    }

    /// Issue a command and collect its R1, aborting the armed data phase on
    /// failure.
    fn data_cmd(&self, inner: &mut SlotInner<H>, cmd: Cmd, arg: u32) -> Result<()> {
        let issued = self
            .send_command(inner, cmd, arg)
            .and_then(|_| self.recv_r1(inner, cmd).map(|_| ()));
        if let Err(err) = issued {
            inner.host.cancel();
            return Err(err);
        }
        Ok(())
    }

    // ---- reads ----

    /// CMD17. `buf` holds exactly one block.
    pub(crate) fn read_single_locked(
        &self,
        inner: &mut SlotInner<H>,
        part_index: usize,
        buf: &mut [u8],
        startblock: u32,
    ) -> Result<u32> {
        self.transfer_prologue(inner, part_index, false)?;
        let mut plan = self.plan_dma(inner, buf);
        self.transfer_ready(inner)?;

        let offset = self.sector_arg(inner, startblock);
        let blocksize = inner.blocksize;
        self.set_block_length(inner, blocksize)?;

        inner.host.block_setup(blocksize, 1);
        inner.host.wait_enable(
            HostEvent::TRANSFER_DONE | HostEvent::EVENT_TIMEOUT | HostEvent::EVENT_ERROR,
            BLOCK_RDATADELAY_MS,
        );
        match plan.bounce.as_mut() {
            Some(bounce) => self.arm_receive(inner, plan.use_dma, bounce.as_mut_slice())?,
            None => self.arm_receive(inner, plan.use_dma, buf)?,
        }

        self.data_cmd(inner, Cmd::ReadSingle, offset)?;
        self.finish_data_event(inner)?;

        if let Some(bounce) = plan.bounce {
            buf.copy_from_slice(bounce.as_slice());
        }
        Ok(1)
    }

    /// CMD18, optionally preceded by CMD23 and followed by CMD12 when the
    /// card cannot take a pre-count.
    pub(crate) fn read_multiple_locked(
        &self,
        inner: &mut SlotInner<H>,
        part_index: usize,
        buf: &mut [u8],
        startblock: u32,
        nblocks: u32,
    ) -> Result<u32> {
        self.transfer_prologue(inner, part_index, false)?;
        let mut plan = self.plan_dma(inner, buf);
        self.transfer_ready(inner)?;

        let offset = self.sector_arg(inner, startblock);
        let blocksize = inner.blocksize;
        self.set_block_length(inner, blocksize)?;

        inner.host.block_setup(blocksize, nblocks);
        inner.host.wait_enable(
            HostEvent::TRANSFER_DONE | HostEvent::EVENT_TIMEOUT | HostEvent::EVENT_ERROR,
            BLOCK_RDATADELAY_MS * nblocks,
        );
        match plan.bounce.as_mut() {
            Some(bounce) => self.arm_receive(inner, plan.use_dma, bounce.as_mut_slice())?,
            None => self.arm_receive(inner, plan.use_dma, buf)?,
        }

        // MMC and CMD23-capable SD cards stop on their own after the
        // pre-declared count; everyone else needs an explicit CMD12.
        let precount = inner.kind.is_mmc() || inner.cmd23_support;
        if precount {
            self.data_cmd(inner, Cmd::SetBlockCount, nblocks)?;
        }
        self.data_cmd(inner, Cmd::ReadMultiple, offset)?;
        self.finish_data_event(inner)?;
        if !precount {
            self.send_command(inner, Cmd::StopTransmission, 0)?;
            self.recv_r1(inner, Cmd::StopTransmission)?;
        }

        if let Some(bounce) = plan.bounce {
            buf.copy_from_slice(bounce.as_slice());
        }
        Ok(nblocks)
    }

    // ---- writes ----

    /// CMD24. Leaves the slot write-busy; the next operation resolves the
    /// programming state before touching the card.
    pub(crate) fn write_single_locked(
        &self,
        inner: &mut SlotInner<H>,
        part_index: usize,
        buf: &[u8],
        startblock: u32,
    ) -> Result<u32> {
        self.transfer_prologue(inner, part_index, true)?;
        let mut plan = self.plan_dma(inner, buf);
        if let Some(bounce) = plan.bounce.as_mut() {
            bounce.as_mut_slice().copy_from_slice(buf);
        }
        self.transfer_ready(inner)?;

        let offset = self.sector_arg(inner, startblock);
        let blocksize = inner.blocksize;
        self.set_block_length(inner, blocksize)?;

        inner.host.block_setup(blocksize, 1);
        inner.host.wait_enable(
            HostEvent::TRANSFER_DONE | HostEvent::EVENT_TIMEOUT | HostEvent::EVENT_ERROR,
            BLOCK_WDATADELAY_MS,
        );

        let data: &[u8] = match plan.bounce.as_ref() {
            Some(bounce) => bounce.as_slice(),
            None => buf,
        };
        if plan.use_dma && inner.caps.contains(HostCaps::DMA_BEFORE_WRITE) {
            self.arm_send(inner, true, data)?;
            self.data_cmd(inner, Cmd::WriteSingle, offset)?;
        } else {
            self.data_cmd(inner, Cmd::WriteSingle, offset)?;
            self.arm_send(inner, plan.use_dma, data)?;
        }

        self.finish_data_event(inner)?;
        inner.wrbusy = true;
        Ok(1)
    }

    /// CMD25 with the pre-erase/pre-count commands the card family wants.
    /// When the data phase fails but the transmission is open-ended, CMD12
    /// is still attempted and the data-phase error wins.
    pub(crate) fn write_multiple_locked(
        &self,
        inner: &mut SlotInner<H>,
        part_index: usize,
        buf: &[u8],
        startblock: u32,
        nblocks: u32,
    ) -> Result<u32> {
        self.transfer_prologue(inner, part_index, true)?;
        let mut plan = self.plan_dma(inner, buf);
        if let Some(bounce) = plan.bounce.as_mut() {
            bounce.as_mut_slice().copy_from_slice(buf);
        }
        self.transfer_ready(inner)?;

        let offset = self.sector_arg(inner, startblock);
        let blocksize = inner.blocksize;
        self.set_block_length(inner, blocksize)?;

        inner.host.block_setup(blocksize, nblocks);
        inner.host.wait_enable(
            HostEvent::TRANSFER_DONE | HostEvent::EVENT_TIMEOUT | HostEvent::EVENT_ERROR,
            BLOCK_WDATADELAY_MS * nblocks,
        );

        let mut stop_needed = true;
        if inner.kind.is_sd() {
            // Pre-erase hint first, then the binding pre-count if the card
            // understands CMD23.
            self.send_app_cmd(inner)?;
            self.data_cmd(inner, Cmd::AppSetWrBlkEraseCount, nblocks)?;
            if inner.cmd23_support {
                self.data_cmd(inner, Cmd::SetBlockCount, nblocks)?;
                stop_needed = false;
            }
        } else {
            let mut arg = nblocks;
            if part_index == PART_RPMB {
                arg |= CMD23_RELIABLE_WRITE;
            }
            self.data_cmd(inner, Cmd::SetBlockCount, arg)?;
            stop_needed = false;
        }

        let data: &[u8] = match plan.bounce.as_ref() {
            Some(bounce) => bounce.as_slice(),
            None => buf,
        };
        if plan.use_dma && inner.caps.contains(HostCaps::DMA_BEFORE_WRITE) {
            self.arm_send(inner, true, data)?;
            self.data_cmd(inner, Cmd::WriteMultiple, offset)?;
        } else {
            self.data_cmd(inner, Cmd::WriteMultiple, offset)?;
            self.arm_send(inner, plan.use_dma, data)?;
        }

        match self.finish_data_event(inner) {
            Ok(()) => {
                if stop_needed {
                    self.send_command(inner, Cmd::StopTransmission, 0)?;
                    self.recv_r1(inner, Cmd::StopTransmission)?;
                }
            }
            Err(err) => {
                // Best-effort STOP to drag the card back toward TRAN; the
                // original data-phase error is what the caller sees.
                if stop_needed {
                    let _ = self.send_command(inner, Cmd::StopTransmission, 0);
                    let _ = self.recv_r1(inner, Cmd::StopTransmission);
                }
                return Err(err);
            }
        }

        inner.wrbusy = true;
        Ok(nblocks)
    }

    // ---- raw ioctl data helpers ----

    /// PIO data-in for the raw command path (EXT_CSD, CMD18, CMD56 reads).
    #[cfg(feature = "ioctl")]
    pub(crate) fn ioc_data_read(
        &self,
        inner: &mut SlotInner<H>,
        cmd: Cmd,
        arg: u32,
        buf: &mut [u8],
        blocklen: u32,
        nblocks: u32,
    ) -> Result<()> {
        self.transfer_ready(inner)?;
        inner.host.block_setup(blocklen, nblocks);
        inner.host.wait_enable(
            HostEvent::TRANSFER_DONE | HostEvent::EVENT_TIMEOUT | HostEvent::EVENT_ERROR,
            BLOCK_RDATADELAY_MS * nblocks.max(1),
        );
        if let Err(err) = inner.host.recv_setup(buf) {
            inner.host.cancel();
            return Err(err);
        }
        self.data_cmd(inner, cmd, arg)?;
        self.finish_data_event(inner)
    }

    /// PIO data-out counterpart (CMD25, CMD56 writes).
    #[cfg(feature = "ioctl")]
    pub(crate) fn ioc_data_write(
        &self,
        inner: &mut SlotInner<H>,
        cmd: Cmd,
        arg: u32,
        buf: &[u8],
        blocklen: u32,
        nblocks: u32,
    ) -> Result<()> {
        self.transfer_ready(inner)?;
        inner.host.block_setup(blocklen, nblocks);
        inner.host.wait_enable(
            HostEvent::TRANSFER_DONE | HostEvent::EVENT_TIMEOUT | HostEvent::EVENT_ERROR,
            BLOCK_WDATADELAY_MS * nblocks.max(1),
        );
        self.data_cmd(inner, cmd, arg)?;
        if let Err(err) = inner.host.send_setup(buf) {
            inner.host.cancel();
            return Err(err);
        }
        self.finish_data_event(inner)?;
        inner.wrbusy = true;
        Ok(())
    }
}
