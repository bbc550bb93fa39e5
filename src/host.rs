use alloc::boxed::Box;

use bitflags::bitflags;

use crate::cmd::Cmd;
use crate::error::Result;
use crate::register::EXT_CSD_SIZE;

bitflags! {
    /// Host controller capability bits, sampled once when a slot is bound.
    pub struct HostCaps: u32 {
        /// Data lines are limited to 1-bit mode.
        const ONE_BIT_ONLY = 1 << 0;
        /// Data lines only work in 4-bit mode; wide bus is forced early.
        const FOUR_BIT_ONLY = 1 << 1;
        /// The controller can move data blocks by DMA.
        const DMA_SUPPORTED = 1 << 2;
        /// DMA must be armed before the write command is issued.
        const DMA_BEFORE_WRITE = 1 << 3;
        /// MMC high-speed timing is usable on this bus.
        const MMC_HIGH_SPEED = 1 << 4;
        /// The controller can signal write completion as an event, saving
        /// a round of status polling.
        const WRCOMPLETE_WAIT = 1 << 5;
    }
}

bitflags! {
    /// Events delivered by [`SdioHost::event_wait`].
    pub struct HostEvent: u32 {
        const TRANSFER_DONE = 1 << 0;
        const EVENT_TIMEOUT = 1 << 1;
        const EVENT_ERROR = 1 << 2;
        const WRITE_COMPLETE = 1 << 3;
    }
}

bitflags! {
    /// Media events the slot arms via [`SdioHost::callback_enable`].
    pub struct MediaEvent: u32 {
        const INSERTED = 1 << 0;
        const EJECTED = 1 << 1;
    }
}

/// Bus clock classes. The host maps each class to a concrete divider.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ClockRate {
    /// Clock gated off (slot empty).
    Disabled,
    /// Identification mode, below 400 kHz.
    IdMode,
    /// MMC data transfer rate (high speed if negotiated).
    MmcTransfer,
    /// SD transfer rate over 1 data line.
    SdTransfer1Bit,
    /// SD transfer rate over 4 data lines.
    SdTransfer4Bit,
}

/// Media-change notification, invoked by the host outside interrupt context.
pub type MediaCallback = Box<dyn FnMut() + Send>;

/// Contract of the low-level SDIO host controller.
///
/// The host owns command issuance, response capture (including CRC checks),
/// the data FIFO/DMA engine, and IRQ plumbing. `send_cmd` hands a command to
/// the controller and waits for its response-ready signal; the `recv_*`
/// family then fetches the captured response words. The core never touches
/// controller registers directly.
pub trait SdioHost {
    fn capabilities(&self) -> HostCaps;

    /// Attach controller interrupts. Called once when the slot is bound.
    fn attach(&mut self) -> Result<()>;

    fn present(&self) -> bool;
    fn write_protected(&self) -> bool;

    fn clock(&mut self, rate: ClockRate);
    fn widebus(&mut self, enable: bool);

    /// Issue a command and wait for the response-ready signal.
    fn send_cmd(&mut self, cmd: Cmd, arg: u32) -> Result<()>;

    fn recv_r1(&mut self, cmd: Cmd) -> Result<u32>;
    fn recv_r2(&mut self, cmd: Cmd) -> Result<[u32; 4]>;
    fn recv_r3(&mut self, cmd: Cmd) -> Result<u32>;
    fn recv_r6(&mut self, cmd: Cmd) -> Result<u32>;
    fn recv_r7(&mut self, cmd: Cmd) -> Result<u32>;

    /// Configure block length and count for the next data transfer.
    fn block_setup(&mut self, blocklen: u32, nblocks: u32);

    /// Arm a PIO receive into `buf` for the next data command.
    fn recv_setup(&mut self, buf: &mut [u8]) -> Result<()>;
    /// Arm a PIO send from `buf` for the next data command.
    fn send_setup(&mut self, buf: &[u8]) -> Result<()>;

    /// Whether `buf` satisfies the DMA engine's alignment/span constraints.
    fn dma_preflight(&self, buf: &[u8]) -> bool {
        let _ = buf;
        true
    }

    /// Alignment a bounce buffer must satisfy for this DMA engine.
    fn dma_alignment(&self) -> usize {
        1
    }

    fn dma_recv_setup(&mut self, buf: &mut [u8]) -> Result<()> {
        self.recv_setup(buf)
    }
    fn dma_send_setup(&mut self, buf: &[u8]) -> Result<()> {
        self.send_setup(buf)
    }

    /// Arm the event set the next `event_wait` call may return, with a
    /// watchdog of `timeout_ms` milliseconds.
    fn wait_enable(&mut self, events: HostEvent, timeout_ms: u32);

    /// Block until one of the armed events fires (or the watchdog expires,
    /// reported as `EVENT_TIMEOUT`).
    fn event_wait(&mut self) -> HostEvent;

    /// Abort the data transfer currently set up, if any.
    fn cancel(&mut self);

    fn register_callback(&mut self, callback: MediaCallback);
    fn callback_enable(&mut self, events: MediaEvent);

    /// Diagnostic hook: the card's EXT_CSD was read back.
    fn got_extcsd(&mut self, _extcsd: &[u8; EXT_CSD_SIZE]) {}
}

/// Sleeping and delaying, provided by the platform.
///
/// The busy-poll in the readiness tracker either sleeps or yields between
/// status reads depending on slot configuration; identification needs
/// microsecond power-up delays.
pub trait SleepOps {
    fn sleep_ms(ms: usize);
    fn delay_us(us: usize);
    fn yield_now();
}
