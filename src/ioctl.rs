//! Raw command pass-through for user ioctl access (`MMC_IOC_CMD` and
//! `MMC_IOC_MULTI_CMD`).

use crate::cmd::Cmd;
use crate::error::{Result, SdError};
use crate::host::{SdioHost, SleepOps};
#[cfg(feature = "mmc")]
use crate::register::EXT_CSD_SIZE;
use crate::slot::{SdSlot, SlotInner};
use crate::BLOCK_SZ;

/// Upper bound on one `MMC_IOC_MULTI_CMD` batch.
pub const MMC_IOC_MAX_CMDS: usize = 255;

/// Settle time after a raw CMD0 before the card accepts anything else.
const IDLE_DELAY_MS: usize = 50;

/// One raw command as handed in through the ioctl interface. `response`
/// carries R1 words (or the cached CID for CMD2) back to the caller.
pub struct IocCmd<'a> {
    pub opcode: u8,
    pub arg: u32,
    /// Data direction for CMD56: true writes the block to the card.
    pub write_flag: bool,
    pub blksz: u32,
    pub blocks: u32,
    pub data: Option<&'a mut [u8]>,
    pub response: [u32; 4],
}

impl<'a> IocCmd<'a> {
    pub fn new(opcode: u8, arg: u32) -> Self {
        Self {
            opcode,
            arg,
            write_flag: false,
            blksz: BLOCK_SZ as u32,
            blocks: 0,
            data: None,
            response: [0; 4],
        }
    }
}

impl<H, S> SdSlot<H, S>
where
    H: SdioHost + Send + 'static,
    S: SleepOps + Send + Sync + 'static,
{
    /// Dispatch one raw command. Only the opcodes a user can meaningfully
    /// drive from outside are accepted; everything else is `Unsupported`.
    pub(crate) fn iocmd(&self, inner: &mut SlotInner<H>, cmd: &mut IocCmd<'_>) -> Result<()> {
        match cmd.opcode {
            0 => {
                self.send_command(inner, Cmd::GoIdleState, cmd.arg)?;
                S::sleep_ms(IDLE_DELAY_MS);
                Ok(())
            }
            2 => {
                // The CID was captured during identification; CMD2 is only
                // legal in ident state, so answer from the cache.
                cmd.response = inner.cid;
                Ok(())
            }
            #[cfg(feature = "mmc")]
            6 => {
                self.send_command(inner, Cmd::Switch, cmd.arg)?;
                cmd.response[0] = self.recv_r1(inner, Cmd::Switch)?;
                inner.wrbusy = true;
                Ok(())
            }
            #[cfg(feature = "mmc")]
            8 => {
                let data = match cmd.data.as_deref_mut() {
                    Some(data) => data,
                    None => return Err(SdError::InvalidArgument),
                };
                let bytes: &mut [u8; EXT_CSD_SIZE] =
                    data.try_into().map_err(|_| SdError::InvalidArgument)?;
                self.read_extcsd_locked(inner, bytes)
            }
            13 => {
                let status = self.card_status(inner)?;
                cmd.response[0] = u32::from(status);
                Ok(())
            }
            18 => {
                let blocks = cmd.blocks.max(1);
                let blksz = cmd.blksz;
                let data = match cmd.data.as_deref_mut() {
                    Some(data) => data,
                    None => return Err(SdError::InvalidArgument),
                };
                let len = (blocks as usize) * blksz as usize;
                if data.len() < len {
                    return Err(SdError::InvalidArgument);
                }
                // The RPMB partition ignores the address; passing the
                // caller's argument through is harmless there.
                self.ioc_data_read(
                    inner,
                    Cmd::ReadMultiple,
                    cmd.arg,
                    &mut data[..len],
                    blksz,
                    blocks,
                )
            }
            23 => {
                self.send_command(inner, Cmd::SetBlockCount, cmd.arg)?;
                cmd.response[0] = self.recv_r1(inner, Cmd::SetBlockCount)?;
                Ok(())
            }
            25 => {
                let blocks = cmd.blocks.max(1);
                let blksz = cmd.blksz;
                let data = match cmd.data.as_deref_mut() {
                    Some(data) => data,
                    None => return Err(SdError::InvalidArgument),
                };
                let len = (blocks as usize) * blksz as usize;
                if data.len() < len {
                    return Err(SdError::InvalidArgument);
                }
                self.ioc_data_write(inner, Cmd::WriteMultiple, cmd.arg, &data[..len], blksz, blocks)
            }
            56 => {
                let blksz = cmd.blksz;
                let write = cmd.write_flag;
                let data = match cmd.data.as_deref_mut() {
                    Some(data) => data,
                    None => return Err(SdError::InvalidArgument),
                };
                let len = blksz as usize;
                if data.len() < len {
                    return Err(SdError::InvalidArgument);
                }
                if write {
                    self.ioc_data_write(inner, Cmd::GeneralCommand, cmd.arg, &data[..len], blksz, 1)
                } else {
                    self.ioc_data_read(
                        inner,
                        Cmd::GeneralCommand,
                        cmd.arg,
                        &mut data[..len],
                        blksz,
                        1,
                    )
                }
            }
            _ => Err(SdError::Unsupported),
        }
    }

    /// Run a bounded batch, aborting at the first failure.
    pub(crate) fn multi_iocmd(
        &self,
        inner: &mut SlotInner<H>,
        cmds: &mut [IocCmd<'_>],
    ) -> Result<()> {
        if cmds.len() > MMC_IOC_MAX_CMDS {
            return Err(SdError::InvalidArgument);
        }
        for cmd in cmds.iter_mut() {
            self.iocmd(inner, cmd)?;
        }
        Ok(())
    }
}
