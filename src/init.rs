//! Post-identification initialization: addressing, geometry, card select,
//! wide bus and clock negotiation, and (for eMMC) EXT_CSD-derived partition
//! sizing.

use log::*;

use crate::cmd::{CardState, Cmd};
use crate::error::{Result, SdError};
use crate::host::{ClockRate, HostCaps, HostEvent, SdioHost, SleepOps};
use crate::register::{capacity_kb, csd_tran_speed_kbps, decode_csd, Cid, Scr};
#[cfg(feature = "mmc")]
use crate::register::{
    ExtCsd, EXT_CSD_BUS_WIDTH, EXT_CSD_BUS_WIDTH_4, EXT_CSD_HS_TIMING, EXT_CSD_HS_TIMING_HS,
    EXT_CSD_SIZE,
};
use crate::slot::{SdSlot, SlotInner, BLOCK_RDATADELAY_MS, DSR_DELAY_US};
use crate::BLOCK_SZ;

/// ACMD6 argument selecting the 4-bit data bus.
const ACMD6_BUS_WIDTH_4: u32 = 0b10;

impl<H, S> SdSlot<H, S>
where
    H: SdioHost + Send + 'static,
    S: SleepOps + Send + Sync + 'static,
{
    /// Decode the retained CSD into slot geometry. Returns true when the
    /// real block count has to come from the EXT_CSD instead.
    fn decode_and_apply_csd(&self, inner: &mut SlotInner<H>) -> bool {
        let decoded = decode_csd(inner.kind, inner.block_addressed, &inner.csd);
        inner.blocksize = BLOCK_SZ as u32;
        inner.blockshift = decoded.blockshift;
        inner.dsr_imp = decoded.dsr_imp;
        inner.wrprotect = decoded.write_protected;
        if !decoded.needs_ext_csd {
            inner.part[0].nblocks = decoded.nblocks;
        }
        debug!(
            "mmcsd{}: CSD rate {} kbit/s, dsr {}, wp {}",
            self.config.minor,
            csd_tran_speed_kbps(&inner.csd),
            decoded.dsr_imp,
            decoded.write_protected
        );
        decoded.needs_ext_csd
    }

    fn log_cid(&self, inner: &SlotInner<H>) {
        let cid = Cid::new(inner.cid);
        let pnm = cid.product_name();
        debug!(
            "mmcsd{}: CID mid {:#04x} oid {:#06x} pnm {} rev {:#04x} psn {:#010x} mdt {:?}",
            self.config.minor,
            cid.mid(),
            cid.oid(),
            core::str::from_utf8(&pnm).unwrap_or("?????"),
            cid.revision(),
            cid.serial(),
            cid.manufacturing_date(),
        );
    }

    /// SD initialization: RCA assignment, CSD, select, SCR, wide bus.
    pub(crate) fn sd_initialize_locked(&self, inner: &mut SlotInner<H>) -> Result<()> {
        self.send_command(inner, Cmd::AllSendCid, 0)?;
        inner.cid = inner.host.recv_r2(Cmd::AllSendCid)?;
        self.log_cid(inner);

        // The card publishes its RCA.
        self.send_command(inner, Cmd::SendRelativeAddr, 0)?;
        self.recv_r6(inner, Cmd::SendRelativeAddr)?;
        self.verify_state(inner, CardState::Standby)?;

        let rca_arg = (inner.rca as u32) << 16;
        self.send_command(inner, Cmd::SendCsd, rca_arg)?;
        inner.csd = inner.host.recv_r2(Cmd::SendCsd)?;
        self.decode_and_apply_csd(inner);

        self.send_command(inner, Cmd::SelectCard, rca_arg)?;
        self.recv_r1(inner, Cmd::SelectCard)?;

        self.program_dsr(inner)?;
        inner.host.clock(ClockRate::SdTransfer1Bit);

        // A 4-bit-only host cannot even read the SCR over one line.
        if inner.caps.contains(HostCaps::FOUR_BIT_ONLY) {
            inner.widebus = true;
            inner.buswidth = 4;
            inner.host.widebus(true);
            inner.host.clock(ClockRate::SdTransfer4Bit);
        }

        let scr = self.read_scr(inner)?;
        inner.cmd23_support = scr.cmd23_support();
        debug!(
            "mmcsd{}: SCR v{} widths {:#x} cmd23 {}",
            self.config.minor,
            scr.spec_version(),
            scr.bus_widths(),
            scr.cmd23_support()
        );

        if !inner.widebus && scr.bus_width_four() && !inner.caps.contains(HostCaps::ONE_BIT_ONLY) {
            self.sd_widebus(inner)?;
        }

        self.log_geometry(inner);
        Ok(())
    }

    /// MMC initialization: host-assigned RCA, CSD, select, EXT_CSD sizing,
    /// wide bus, high-speed timing.
    #[cfg(feature = "mmc")]
    pub(crate) fn mmc_initialize_locked(&self, inner: &mut SlotInner<H>) -> Result<()> {
        self.send_command(inner, Cmd::AllSendCid, 0)?;
        inner.cid = inner.host.recv_r2(Cmd::AllSendCid)?;
        self.log_cid(inner);

        // The host assigns the RCA for MMC.
        inner.rca = 1;
        let rca_arg = (inner.rca as u32) << 16;
        self.send_command(inner, Cmd::SendRelativeAddr, rca_arg)?;
        self.recv_r1(inner, Cmd::SendRelativeAddr)?;
        self.verify_state(inner, CardState::Standby)?;

        self.send_command(inner, Cmd::SendCsd, rca_arg)?;
        inner.csd = inner.host.recv_r2(Cmd::SendCsd)?;
        let needs_ext_csd = self.decode_and_apply_csd(inner);

        self.program_dsr(inner)?;

        self.send_command(inner, Cmd::SelectCard, rca_arg)?;
        self.recv_r1(inner, Cmd::SelectCard)?;

        if inner.caps.contains(HostCaps::FOUR_BIT_ONLY) {
            self.mmc_widebus(inner)?;
        }

        if inner.block_addressed {
            let mut bytes = [0u8; EXT_CSD_SIZE];
            self.read_extcsd_locked(inner, &mut bytes)?;
            self.apply_extcsd(inner, &bytes);
            if needs_ext_csd && inner.part[0].nblocks == 0 {
                error!("mmcsd{}: EXT_CSD reports no user area", self.config.minor);
                return Err(SdError::Io);
            }
        }

        if !inner.widebus && !inner.caps.contains(HostCaps::ONE_BIT_ONLY) {
            self.mmc_widebus(inner)?;
        }

        if inner.caps.contains(HostCaps::MMC_HIGH_SPEED) {
            self.mmc_switch(inner, EXT_CSD_HS_TIMING, EXT_CSD_HS_TIMING_HS)?;
            self.transfer_ready(inner)?;
        }

        inner.host.clock(ClockRate::MmcTransfer);
        self.log_geometry(inner);
        Ok(())
    }

    /// CMD4 with the configured DSR value, when the CSD says it will stick.
    fn program_dsr(&self, inner: &mut SlotInner<H>) -> Result<()> {
        if !inner.dsr_imp {
            return Ok(());
        }
        if let Some(dsr) = self.config.dsr {
            self.send_command(inner, Cmd::SetDsr, (dsr as u32) << 16)?;
            S::delay_us(DSR_DELAY_US);
        }
        Ok(())
    }

    /// ACMD51 data-in read of the 8-byte SCR.
    fn read_scr(&self, inner: &mut SlotInner<H>) -> Result<Scr> {
        self.send_app_cmd(inner)?;

        let mut bytes = [0u8; 8];
        inner.host.block_setup(8, 1);
        inner.host.wait_enable(
            HostEvent::TRANSFER_DONE | HostEvent::EVENT_TIMEOUT | HostEvent::EVENT_ERROR,
            BLOCK_RDATADELAY_MS,
        );
        if let Err(err) = inner.host.recv_setup(&mut bytes) {
            inner.host.cancel();
            return Err(err);
        }
        let issued = self
            .send_command(inner, Cmd::AppSendScr, 0)
            .and_then(|_| self.recv_r1(inner, Cmd::AppSendScr).map(|_| ()));
        if let Err(err) = issued {
            inner.host.cancel();
            return Err(err);
        }
        self.finish_data_event(inner)?;
        Ok(Scr::from_bytes(bytes))
    }

    /// Map the armed event set to a transfer result, cancelling on failure.
    pub(crate) fn finish_data_event(&self, inner: &mut SlotInner<H>) -> Result<()> {
        let event = inner.host.event_wait();
        if event.contains(HostEvent::EVENT_TIMEOUT) {
            inner.host.cancel();
            return Err(SdError::Timeout);
        }
        if event.contains(HostEvent::EVENT_ERROR) {
            inner.host.cancel();
            return Err(SdError::Io);
        }
        Ok(())
    }

    /// ACMD42 + ACMD6, then the host side of the 4-bit switch. ACMD42 is
    /// optional for the card, so a refusal only costs the DAT3 pull-up.
    fn sd_widebus(&self, inner: &mut SlotInner<H>) -> Result<()> {
        self.send_app_cmd(inner)?;
        let detach = self
            .send_command(inner, Cmd::AppSetClrCardDetect, 0)
            .and_then(|_| self.recv_r1(inner, Cmd::AppSetClrCardDetect).map(|_| ()));
        if let Err(err) = detach {
            warn!(
                "mmcsd{}: ACMD42 refused ({}), keeping DAT3 pull-up",
                self.config.minor, err
            );
        }

        self.send_app_cmd(inner)?;
        self.send_command(inner, Cmd::AppSetBusWidth, ACMD6_BUS_WIDTH_4)?;
        self.recv_r1(inner, Cmd::AppSetBusWidth)?;

        inner.widebus = true;
        inner.buswidth = 4;
        inner.host.widebus(true);
        inner.host.clock(ClockRate::SdTransfer4Bit);
        Ok(())
    }

    /// EXT_CSD byte 183 switch to the 4-bit bus, then the host side.
    #[cfg(feature = "mmc")]
    fn mmc_widebus(&self, inner: &mut SlotInner<H>) -> Result<()> {
        self.mmc_switch(inner, EXT_CSD_BUS_WIDTH, EXT_CSD_BUS_WIDTH_4)?;
        self.transfer_ready(inner)?;
        inner.widebus = true;
        inner.buswidth = 4;
        inner.host.widebus(true);
        Ok(())
    }

    /// CMD8 data read of the 512-byte EXT_CSD into `bytes`.
    #[cfg(feature = "mmc")]
    pub(crate) fn read_extcsd_locked(
        &self,
        inner: &mut SlotInner<H>,
        bytes: &mut [u8; EXT_CSD_SIZE],
    ) -> Result<()> {
        self.transfer_ready(inner)?;
        inner.host.block_setup(EXT_CSD_SIZE as u32, 1);
        inner.host.wait_enable(
            HostEvent::TRANSFER_DONE | HostEvent::EVENT_TIMEOUT | HostEvent::EVENT_ERROR,
            BLOCK_RDATADELAY_MS,
        );
        if let Err(err) = inner.host.recv_setup(bytes) {
            inner.host.cancel();
            return Err(err);
        }
        let issued = self
            .send_command(inner, Cmd::SendExtCsd, 0)
            .and_then(|_| self.recv_r1(inner, Cmd::SendExtCsd).map(|_| ()));
        if let Err(err) = issued {
            inner.host.cancel();
            return Err(err);
        }
        self.finish_data_event(inner)?;
        inner.host.got_extcsd(bytes);
        Ok(())
    }

    /// Fill in the user-area block count and hardware partition sizes.
    #[cfg(feature = "mmc")]
    fn apply_extcsd(&self, inner: &mut SlotInner<H>, bytes: &[u8; EXT_CSD_SIZE]) {
        let ext = ExtCsd::new(bytes);
        debug!(
            "mmcsd{}: EXT_CSD rev {} sec_count {} bus_width {} hs_timing {}",
            self.config.minor,
            ext.rev(),
            ext.sec_count(),
            ext.bus_width(),
            ext.hs_timing()
        );
        if ext.sec_count() != 0 {
            inner.part[0].nblocks = ext.sec_count();
        }
        if ext.partitioning_enabled() {
            let boot = ext.boot_size_blocks();
            inner.part[1].nblocks = boot;
            inner.part[2].nblocks = boot;
            inner.part[3].nblocks = ext.rpmb_size_blocks();
            for i in 0..4 {
                inner.part[4 + i].nblocks = ext.gp_size_blocks(i);
            }
        }
    }

    fn log_geometry(&self, inner: &SlotInner<H>) {
        info!(
            "mmcsd{}: {:?} {} blocks of {} ({} KiB), {}-bit bus{}",
            self.config.minor,
            inner.kind,
            inner.part[0].nblocks,
            inner.blocksize,
            capacity_kb(inner.part[0].nblocks, inner.blockshift),
            inner.buswidth,
            if inner.wrprotect {
                ", write protected"
            } else {
                ""
            }
        );
    }
}
