use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::marker::PhantomData;

use log::*;
use spin::Mutex;

use crate::cmd::{CardState, CardStatus, Cmd, R1_ERROR_MASK, R6_ERROR_MASK};
#[cfg(feature = "mmc")]
use crate::cmd::{SwitchArg, SWITCH_MODE_WRITE_BYTE};
use crate::device::DeviceRegistry;
use crate::error::{Result, SdError};
use crate::host::{HostCaps, HostEvent, MediaEvent, SdioHost, SleepOps};
#[cfg(feature = "mmc")]
use crate::register::EXT_CSD_PART_CONF;
use crate::{BLOCK_SHIFT, BLOCK_SZ};

/// Hardware partitions an eMMC exposes: user, boot0, boot1, rpmb, gp1-gp4.
pub const MMCSD_PART_COUNT: usize = 8;

/// Open-handle bound per slot.
pub(crate) const MAX_CREFS: u8 = u8::MAX;

// Busy-poll budget after a write, in 1 ms status reads.
pub(crate) const READY_WAIT_MS: usize = 1000;
// Transfer event watchdogs, scaled by block count for multi-block.
pub(crate) const BLOCK_RDATADELAY_MS: u32 = 100;
pub(crate) const BLOCK_WDATADELAY_MS: u32 = 260;
pub(crate) const WRCOMPLETE_DELAY_MS: u32 = 260;
// Settle delays around CMD0 and CMD4.
pub(crate) const PRE_IDLE_DELAY_US: usize = 100;
pub(crate) const POWERUP_DELAY_US: usize = 250;
pub(crate) const DSR_DELAY_US: usize = 100;

/// Discriminated card family. Addressing mode is tracked separately since
/// both SD v2 and MMC come in byte- and block-addressed flavors.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CardKind {
    Unknown,
    SdV1,
    SdV2,
    Mmc,
}

impl CardKind {
    pub fn is_sd(self) -> bool {
        matches!(self, CardKind::SdV1 | CardKind::SdV2)
    }

    pub fn is_mmc(self) -> bool {
        self == CardKind::Mmc
    }
}

/// Per-slot tunables.
#[derive(Debug, Copy, Clone)]
pub struct SlotConfig {
    /// Minor number used in registered device names.
    pub minor: u8,
    /// Largest block run per CMD18/CMD25. 0 means unlimited, 1 routes
    /// everything through the single-block commands.
    pub multiblock_limit: u32,
    /// Value to program into the DSR via CMD4 when the CSD allows it.
    pub dsr: Option<u16>,
    /// Yield instead of sleeping between busy-poll status reads.
    pub poll_without_sleep: bool,
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self {
            minor: 0,
            multiblock_limit: 0,
            dsr: None,
            poll_without_sleep: false,
        }
    }
}

#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct SdPart {
    pub nblocks: u32,
}

/// Mutable slot state, guarded by the per-slot mutex for the whole duration
/// of every public operation.
pub(crate) struct SlotInner<H: SdioHost> {
    pub host: H,
    pub caps: HostCaps,
    pub kind: CardKind,
    pub block_addressed: bool,
    pub rca: u16,
    pub cid: [u32; 4],
    pub csd: [u32; 4],
    pub blocksize: u32,
    pub blockshift: u32,
    pub buswidth: u8,
    pub widebus: bool,
    /// Last CMD16 argument; lets a repeated set-block-length become a no-op.
    pub selblocklen: u32,
    pub dsr_imp: bool,
    pub wrprotect: bool,
    pub locked: bool,
    /// A write was issued whose programming phase is not yet confirmed done.
    pub wrbusy: bool,
    pub cmd23_support: bool,
    /// Currently selected eMMC hardware partition (PARTITION_ACCESS value).
    pub partnum: u8,
    pub part: [SdPart; MMCSD_PART_COUNT],
    pub crefs: u8,
    pub probed: bool,
    pub mediachanged: bool,
    /// Device names registered at last probe, unregistered on removal.
    pub registered: Vec<String>,
}

impl<H: SdioHost> SlotInner<H> {
    fn new(host: H, caps: HostCaps) -> Self {
        Self {
            host,
            caps,
            kind: CardKind::Unknown,
            block_addressed: false,
            rca: 0,
            cid: [0; 4],
            csd: [0; 4],
            blocksize: BLOCK_SZ as u32,
            blockshift: BLOCK_SHIFT,
            buswidth: 1,
            widebus: false,
            selblocklen: 0,
            dsr_imp: false,
            wrprotect: false,
            locked: false,
            wrbusy: false,
            cmd23_support: false,
            partnum: 0,
            part: [SdPart::default(); MMCSD_PART_COUNT],
            crefs: 0,
            probed: false,
            mediachanged: false,
            registered: Vec::new(),
        }
    }

    /// Drop all card-derived state; the slot is back to "nothing inserted".
    pub(crate) fn reset_card_state(&mut self) {
        self.kind = CardKind::Unknown;
        self.block_addressed = false;
        self.rca = 0;
        self.cid = [0; 4];
        self.csd = [0; 4];
        self.blocksize = BLOCK_SZ as u32;
        self.blockshift = BLOCK_SHIFT;
        self.buswidth = 1;
        self.widebus = false;
        self.selblocklen = 0;
        self.dsr_imp = false;
        self.wrprotect = false;
        self.locked = false;
        self.wrbusy = false;
        self.cmd23_support = false;
        self.partnum = 0;
        self.part = [SdPart::default(); MMCSD_PART_COUNT];
        self.probed = false;
    }
}

/// One card slot: the host controller handle plus all card state, behind a
/// single mutex. Public operations on the slot and on its partition devices
/// serialize on that mutex for their entire duration.
pub struct SdSlot<H: SdioHost, S: SleepOps> {
    pub(crate) inner: Mutex<SlotInner<H>>,
    pub(crate) config: SlotConfig,
    pub(crate) registry: Arc<dyn DeviceRegistry>,
    pub(crate) _sleep: PhantomData<S>,
}

impl<H, S> SdSlot<H, S>
where
    H: SdioHost + Send + 'static,
    S: SleepOps + Send + Sync + 'static,
{
    /// Bind a slot to a host controller: attach interrupts, arm the media
    /// callback, and probe immediately if a card is already inserted.
    pub fn bind(
        host: H,
        config: SlotConfig,
        registry: Arc<dyn DeviceRegistry>,
    ) -> Result<Arc<Self>> {
        let caps = host.capabilities();
        let slot = Arc::new(SdSlot {
            inner: Mutex::new(SlotInner::new(host, caps)),
            config,
            registry,
            _sleep: PhantomData,
        });

        let mut inner = slot.inner.lock();
        inner.host.attach()?;
        let weak = Arc::downgrade(&slot);
        inner.host.register_callback(Box::new(move || {
            if let Some(slot) = weak.upgrade() {
                SdSlot::media_change(&slot);
            }
        }));

        if inner.host.present() {
            if let Err(err) = SdSlot::probe_locked(&slot, &mut inner) {
                warn!("mmcsd{}: initial probe failed: {}", slot.config.minor, err);
                inner.host.callback_enable(MediaEvent::INSERTED);
            }
        } else {
            inner.host.callback_enable(MediaEvent::INSERTED);
        }
        drop(inner);
        Ok(slot)
    }

    /// Identified card family, `Unknown` when the slot is empty.
    pub fn card_kind(&self) -> CardKind {
        self.inner.lock().kind
    }

    /// Whether data commands take block rather than byte addresses.
    pub fn block_addressed(&self) -> bool {
        self.inner.lock().block_addressed
    }

    // ---- command primitives ----

    pub(crate) fn send_command(&self, inner: &mut SlotInner<H>, cmd: Cmd, arg: u32) -> Result<()> {
        inner.host.send_cmd(cmd, arg)
    }

    /// Fetch an R1 and classify it. Any error bit fails the command with
    /// `Io`; the lock status bit is captured into slot state alongside.
    pub(crate) fn recv_r1(&self, inner: &mut SlotInner<H>, cmd: Cmd) -> Result<u32> {
        let r1 = inner.host.recv_r1(cmd)?;
        if r1 & R1_ERROR_MASK != 0 {
            inner.locked = CardStatus::from(r1).card_is_locked();
            warn!(
                "mmcsd{}: CMD{} failed, R1 {:#010x}",
                self.config.minor,
                cmd.index(),
                r1
            );
            return Err(SdError::Io);
        }
        Ok(r1)
    }

    /// Fetch an R6, validate its status field, and capture the new RCA.
    pub(crate) fn recv_r6(&self, inner: &mut SlotInner<H>, cmd: Cmd) -> Result<()> {
        let r6 = inner.host.recv_r6(cmd)?;
        if r6 & R6_ERROR_MASK != 0 {
            warn!(
                "mmcsd{}: CMD{} failed, R6 {:#010x}",
                self.config.minor,
                cmd.index(),
                r6
            );
            return Err(SdError::Io);
        }
        inner.rca = (r6 >> 16) as u16;
        Ok(())
    }

    /// CMD13 against the current RCA.
    pub(crate) fn card_status(&self, inner: &mut SlotInner<H>) -> Result<CardStatus> {
        let arg = (inner.rca as u32) << 16;
        self.send_command(inner, Cmd::SendStatus, arg)?;
        let r1 = self.recv_r1(inner, Cmd::SendStatus)?;
        Ok(CardStatus::from(r1))
    }

    /// Assert the card sits in `expected`; a write no longer pends once the
    /// card answers from a known state.
    pub(crate) fn verify_state(&self, inner: &mut SlotInner<H>, expected: CardState) -> Result<()> {
        let status = self.card_status(inner)?;
        if status.current_state() != expected {
            warn!(
                "mmcsd{}: card in state {:?}, expected {:?}",
                self.config.minor,
                status.current_state(),
                expected
            );
            return Err(SdError::InvalidState);
        }
        inner.wrbusy = false;
        Ok(())
    }

    /// CMD55 prefix for the application command that follows.
    pub(crate) fn send_app_cmd(&self, inner: &mut SlotInner<H>) -> Result<()> {
        let arg = (inner.rca as u32) << 16;
        self.send_command(inner, Cmd::AppCmd, arg)?;
        self.recv_r1(inner, Cmd::AppCmd)?;
        Ok(())
    }

    // ---- readiness ----

    /// Succeeds only when the card is in TRAN state with no programming
    /// pending and the slot is still populated. Every transfer starts here.
    pub(crate) fn transfer_ready(&self, inner: &mut SlotInner<H>) -> Result<()> {
        if inner.kind == CardKind::Unknown || !inner.host.present() {
            return Err(SdError::NoDevice);
        }
        if !inner.wrbusy {
            return Ok(());
        }

        // Let the controller report programming completion first when it
        // can; the status poll below then confirms.
        if inner.caps.contains(HostCaps::WRCOMPLETE_WAIT) {
            inner.host.wait_enable(
                HostEvent::WRITE_COMPLETE | HostEvent::EVENT_TIMEOUT,
                WRCOMPLETE_DELAY_MS,
            );
            let _ = inner.host.event_wait();
        }

        for _ in 0..READY_WAIT_MS {
            let status = self.card_status(inner)?;
            match status.current_state() {
                CardState::Transfer => {
                    inner.wrbusy = false;
                    return Ok(());
                }
                CardState::Programming | CardState::ReceiveData => {
                    if self.config.poll_without_sleep {
                        S::yield_now();
                    } else {
                        S::sleep_ms(1);
                    }
                }
                other => {
                    warn!(
                        "mmcsd{}: unexpected state {:?} while waiting for TRAN",
                        self.config.minor, other
                    );
                    return Err(SdError::InvalidState);
                }
            }
        }
        Err(SdError::Timeout)
    }

    // ---- small shared steps ----

    /// CMD16, skipped when the card already has this block length selected.
    pub(crate) fn set_block_length(&self, inner: &mut SlotInner<H>, len: u32) -> Result<()> {
        if inner.selblocklen == len {
            return Ok(());
        }
        self.send_command(inner, Cmd::SetBlockLen, len)?;
        self.recv_r1(inner, Cmd::SetBlockLen)?;
        inner.selblocklen = len;
        Ok(())
    }

    /// CMD6 write of one EXT_CSD byte. The write runs through PRG state, so
    /// the card is busy until the next readiness check confirms TRAN.
    #[cfg(feature = "mmc")]
    pub(crate) fn mmc_switch(&self, inner: &mut SlotInner<H>, index: u8, value: u8) -> Result<()> {
        let arg = SwitchArg::new()
            .with_mode(SWITCH_MODE_WRITE_BYTE)
            .with_index(index)
            .with_value(value);
        self.send_command(inner, Cmd::Switch, u32::from(arg))?;
        self.recv_r1(inner, Cmd::Switch)?;
        inner.wrbusy = true;
        Ok(())
    }

    /// Select the eMMC hardware partition backing `index`, if not already
    /// selected.
    #[cfg(feature = "mmc")]
    pub(crate) fn select_partition(&self, inner: &mut SlotInner<H>, index: u8) -> Result<()> {
        if inner.partnum == index {
            return Ok(());
        }
        self.mmc_switch(inner, EXT_CSD_PART_CONF, index)?;
        inner.partnum = index;
        Ok(())
    }

    #[cfg(not(feature = "mmc"))]
    pub(crate) fn select_partition(&self, _inner: &mut SlotInner<H>, index: u8) -> Result<()> {
        debug_assert_eq!(index, 0);
        Ok(())
    }
}
