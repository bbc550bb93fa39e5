//! Card identification: from a freshly powered (or re-inserted) card to a
//! discriminated type with known addressing mode.

use log::*;

use crate::cmd::{
    Cmd, GO_PRE_IDLE_ARG, OCR_HIGH_CAPACITY, OCR_READY, OCR_VDD_WINDOW, SEND_IF_COND_ARG,
};
use crate::error::{Result, SdError};
use crate::host::{ClockRate, SdioHost, SleepOps};
use crate::slot::{CardKind, SdSlot, SlotInner, POWERUP_DELAY_US, PRE_IDLE_DELAY_US};

// ACMD41/CMD1 polling cadence until the card reports power-up done.
const OP_COND_RETRY_MS: usize = 10;
const OP_COND_WAIT_MS: usize = 1000;

impl<H, S> SdSlot<H, S>
where
    H: SdioHost + Send + 'static,
    S: SleepOps + Send + Sync + 'static,
{
    /// Drive the CMD0/CMD1/CMD8/ACMD41 handshake. On success the slot knows
    /// the card family and whether data commands take block addresses.
    pub(crate) fn identify_locked(&self, inner: &mut SlotInner<H>) -> Result<()> {
        if !inner.host.present() {
            inner.kind = CardKind::Unknown;
            return Err(SdError::NoDevice);
        }

        inner.host.clock(ClockRate::IdMode);

        // eMMC pre-idle first, then the standard idle command once the
        // power-up window has passed.
        self.send_command(inner, Cmd::GoIdleState, GO_PRE_IDLE_ARG)?;
        S::delay_us(PRE_IDLE_DELAY_US);
        S::delay_us(POWERUP_DELAY_US);
        self.send_command(inner, Cmd::GoIdleState, 0)?;

        #[cfg(feature = "mmc")]
        {
            // Only an MMC answers CMD1. SD cards ignore it, so a response
            // failure just routes us into SD discovery.
            self.send_command(inner, Cmd::SendOpCond, OCR_VDD_WINDOW | OCR_HIGH_CAPACITY)?;
            match inner.host.recv_r3(Cmd::SendOpCond) {
                Ok(ocr) => {
                    debug!("mmcsd{}: MMC card, OCR {:#010x}", self.config.minor, ocr);
                    inner.kind = CardKind::Mmc;
                    if ocr & OCR_HIGH_CAPACITY != 0 {
                        inner.block_addressed = true;
                    }
                    if ocr & OCR_READY != 0 {
                        return Ok(());
                    }
                }
                Err(_) => {
                    self.send_command(inner, Cmd::GoIdleState, 0)?;
                }
            }
        }

        if !inner.kind.is_mmc() {
            // CMD8 tells v2 cards apart; v1 cards leave it unanswered.
            self.send_command(inner, Cmd::SendIfCond, SEND_IF_COND_ARG)?;
            if let Ok(r7) = inner.host.recv_r7(Cmd::SendIfCond) {
                if r7 & 0xfff == SEND_IF_COND_ARG {
                    debug!("mmcsd{}: SD v2 card", self.config.minor);
                    inner.kind = CardKind::SdV2;
                }
            }
        }

        // Poll the operating-condition command until power-up completes.
        let mut ready = false;
        for _ in 0..(OP_COND_WAIT_MS / OP_COND_RETRY_MS) {
            if inner.kind.is_mmc() {
                #[cfg(feature = "mmc")]
                {
                    self.send_command(inner, Cmd::SendOpCond, OCR_VDD_WINDOW | OCR_HIGH_CAPACITY)?;
                    if let Ok(ocr) = inner.host.recv_r3(Cmd::SendOpCond) {
                        if ocr & OCR_READY != 0 {
                            ready = true;
                            break;
                        }
                    }
                }
            } else {
                self.send_app_cmd(inner)?;
                let hcs = if inner.kind == CardKind::SdV2 {
                    OCR_HIGH_CAPACITY
                } else {
                    0
                };
                self.send_command(inner, Cmd::AppSendOpCond, OCR_VDD_WINDOW | hcs)?;
                if let Ok(ocr) = inner.host.recv_r3(Cmd::AppSendOpCond) {
                    if inner.kind == CardKind::Unknown {
                        inner.kind = CardKind::SdV1;
                    }
                    if ocr & OCR_READY != 0 {
                        if ocr & OCR_HIGH_CAPACITY != 0 && inner.kind == CardKind::SdV2 {
                            inner.block_addressed = true;
                        }
                        ready = true;
                        break;
                    }
                }
            }
            S::sleep_ms(OP_COND_RETRY_MS);
        }

        if inner.kind == CardKind::Unknown {
            error!("mmcsd{}: card did not identify", self.config.minor);
            return Err(SdError::Io);
        }
        if !ready {
            error!("mmcsd{}: card never reported power-up done", self.config.minor);
            return Err(SdError::Timeout);
        }
        debug!(
            "mmcsd{}: identified {:?}, block addressed: {}",
            self.config.minor, inner.kind, inner.block_addressed
        );
        Ok(())
    }
}
