use bitfield_struct::bitfield;

/// Commands the core issues. Application commands (prefixed by CMD55 on the
/// wire) are separate variants so call sites and logs stay unambiguous.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Cmd {
    GoIdleState,
    SendOpCond,
    AllSendCid,
    SendRelativeAddr,
    SetDsr,
    Switch,
    SelectCard,
    /// SD CMD8, interface condition with echo pattern (R7).
    SendIfCond,
    /// MMC CMD8, EXT_CSD data read (R1).
    SendExtCsd,
    SendCsd,
    StopTransmission,
    SendStatus,
    SetBlockLen,
    ReadSingle,
    ReadMultiple,
    SetBlockCount,
    WriteSingle,
    WriteMultiple,
    GeneralCommand,
    AppCmd,
    AppSetBusWidth,
    AppSetWrBlkEraseCount,
    AppSendOpCond,
    AppSetClrCardDetect,
    AppSendScr,
}

/// Response class a command expects on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RespKind {
    None,
    R1,
    R1B,
    R2,
    R3,
    R6,
    R7,
}

impl Cmd {
    /// Command index as sent on the CMD line.
    pub fn index(self) -> u8 {
        match self {
            Cmd::GoIdleState => 0,
            Cmd::SendOpCond => 1,
            Cmd::AllSendCid => 2,
            Cmd::SendRelativeAddr => 3,
            Cmd::SetDsr => 4,
            Cmd::Switch | Cmd::AppSetBusWidth => 6,
            Cmd::SelectCard => 7,
            Cmd::SendIfCond | Cmd::SendExtCsd => 8,
            Cmd::SendCsd => 9,
            Cmd::StopTransmission => 12,
            Cmd::SendStatus => 13,
            Cmd::SetBlockLen => 16,
            Cmd::ReadSingle => 17,
            Cmd::ReadMultiple => 18,
            Cmd::SetBlockCount | Cmd::AppSetWrBlkEraseCount => 23,
            Cmd::WriteSingle => 24,
            Cmd::WriteMultiple => 25,
            Cmd::AppSendOpCond => 41,
            Cmd::AppSetClrCardDetect => 42,
            Cmd::AppSendScr => 51,
            Cmd::AppCmd => 55,
            Cmd::GeneralCommand => 56,
        }
    }

    pub fn response(self) -> RespKind {
        match self {
            Cmd::GoIdleState | Cmd::SetDsr => RespKind::None,
            Cmd::SendOpCond | Cmd::AppSendOpCond => RespKind::R3,
            Cmd::AllSendCid | Cmd::SendCsd => RespKind::R2,
            Cmd::SendRelativeAddr => RespKind::R6,
            Cmd::SendIfCond => RespKind::R7,
            Cmd::Switch | Cmd::SelectCard | Cmd::StopTransmission => RespKind::R1B,
            _ => RespKind::R1,
        }
    }

    /// True for ACMDs that must be preceded by CMD55.
    pub fn is_app(self) -> bool {
        matches!(
            self,
            Cmd::AppSetBusWidth
                | Cmd::AppSetWrBlkEraseCount
                | Cmd::AppSendOpCond
                | Cmd::AppSetClrCardDetect
                | Cmd::AppSendScr
        )
    }
}

/// Card protocol state, bits 12:9 of every R1 word.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum CardState {
    Idle = 0,
    Ready = 1,
    Ident = 2,
    Standby = 3,
    Transfer = 4,
    SendData = 5,
    ReceiveData = 6,
    Programming = 7,
    Disconnect = 8,
    Reserved = 15,
}

impl CardState {
    pub const fn from_bits(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Ready,
            2 => Self::Ident,
            3 => Self::Standby,
            4 => Self::Transfer,
            5 => Self::SendData,
            6 => Self::ReceiveData,
            7 => Self::Programming,
            8 => Self::Disconnect,
            _ => Self::Reserved,
        }
    }

    pub const fn into_bits(self) -> u8 {
        self as u8
    }
}

/// R1 card status word.
#[bitfield(u32, order = Lsb)]
pub struct CardStatus {
    #[bits(3)]
    _rsvd0: u8,
    pub ake_seq_error: bool,
    _rsvd1: bool,
    pub app_cmd: bool,
    _rsvd2: bool,
    pub switch_error: bool,
    pub ready_for_data: bool,
    #[bits(4, default = CardState::Idle)]
    pub current_state: CardState,
    pub erase_reset: bool,
    pub ecc_disabled: bool,
    pub wp_erase_skip: bool,
    pub cid_csd_overwrite: bool,
    pub overrun: bool,
    pub underrun: bool,
    pub error: bool,
    pub cc_error: bool,
    pub card_ecc_failed: bool,
    pub illegal_command: bool,
    pub com_crc_error: bool,
    pub lock_unlock_failed: bool,
    pub card_is_locked: bool,
    pub wp_violation: bool,
    pub erase_param: bool,
    pub erase_seq_error: bool,
    pub block_len_error: bool,
    pub address_error: bool,
    pub out_of_range: bool,
}

/// All R1 bits that make a command fail. CARD_IS_LOCKED (bit 25) is status,
/// not an error by itself.
pub const R1_ERROR_MASK: u32 = (1 << 31)   // OUT_OF_RANGE
    | (1 << 30)   // ADDRESS_ERROR
    | (1 << 29)   // BLOCK_LEN_ERROR
    | (1 << 28)   // ERASE_SEQ_ERROR
    | (1 << 27)   // ERASE_PARAM
    | (1 << 26)   // WP_VIOLATION
    | (1 << 24)   // LOCK_UNLOCK_FAILED
    | (1 << 23)   // COM_CRC_ERROR
    | (1 << 22)   // ILLEGAL_COMMAND
    | (1 << 21)   // CARD_ECC_FAILED
    | (1 << 20)   // CC_ERROR
    | (1 << 19)   // ERROR
    | (1 << 18)   // UNDERRUN
    | (1 << 17)   // OVERRUN
    | (1 << 16)   // CID_CSD_OVERWRITE
    | (1 << 15)   // WP_ERASE_SKIP
    | (1 << 13)   // ERASE_RESET
    | (1 << 3); // AKE_SEQ_ERROR

/// Error bits of the 16-bit status field inside an R6 response.
pub const R6_ERROR_MASK: u32 = (1 << 15) | (1 << 14) | (1 << 13);

/// OCR power-up-done bit (the card has left its busy phase).
pub const OCR_READY: u32 = 1 << 31;
/// OCR card-capacity bit; set on block-addressed cards.
pub const OCR_HIGH_CAPACITY: u32 = 1 << 30;
/// 3.2-3.4 V window bits used for both ACMD41 and CMD1 probing.
pub const OCR_VDD_WINDOW: u32 = (1 << 20) | (1 << 21);

/// CMD8 argument: 2.7-3.6 V plus the 0xAA check pattern.
pub const SEND_IF_COND_ARG: u32 = 0x1AA;

/// CMD0 argument that takes an eMMC from pre-idle to idle.
pub const GO_PRE_IDLE_ARG: u32 = 0xF0F0F0F0;

/// MMC CMD6 argument word: access mode, EXT_CSD byte index, value.
#[bitfield(u32, order = Lsb)]
pub struct SwitchArg {
    pub cmd_set: bool,
    #[bits(7)]
    _rsvd0: u8,
    pub value: u8,
    pub index: u8,
    #[bits(2)]
    pub mode: u8,
    #[bits(6)]
    _rsvd1: u8,
}

/// CMD6 access mode writing one EXT_CSD byte.
pub const SWITCH_MODE_WRITE_BYTE: u8 = 0b11;
