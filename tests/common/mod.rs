//! Test doubles: a mock SDIO host with a small card simulator behind it, a
//! mock device registry, and rig builders for the common card flavors.
//!
//! The mock records every command (index, argument) so tests can assert the
//! exact wire sequences the core emits.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use mmcsd::{
    BlockDevice, ClockRate, Cmd, DeviceRegistry, HostCaps, HostEvent, MediaCallback, MediaEvent,
    Result, SdError, SdSlot, SdioHost, SleepOps, SlotConfig, EXT_CSD_SIZE,
};

pub const BLOCK: usize = 512;

/// What kind of card sits in the simulated slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SimCard {
    None,
    Sd { v2: bool, hc: bool },
    Mmc { hc: bool },
}

/// The card side of the simulation.
pub struct CardSim {
    pub card: SimCard,
    pub cid: [u32; 4],
    pub csd: [u32; 4],
    pub scr: [u8; 8],
    pub ext_csd: Vec<u8>,
    /// RCA an SD card publishes via CMD3.
    pub rca: u16,
    /// How many op-cond polls answer without the ready bit first.
    pub op_cond_polls_left: u32,
}

#[derive(Copy, Clone)]
enum Resp {
    None,
    NoResp,
    R1(u32),
    R2([u32; 4]),
    R3(u32),
    R6(u32),
    R7(u32),
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum PendingIo {
    None,
    Recv { ptr: usize, len: usize },
    Send { ptr: usize, len: usize },
}

pub struct MockState {
    pub sim: CardSim,
    pub caps: HostCaps,
    pub present: bool,
    pub wrprotected: bool,
    pub dma_align: usize,

    // card-side runtime state
    card_state: u8,
    app_next: bool,
    prg_polls: u32,
    /// PRG polls a completed write costs before TRAN comes back.
    pub write_busy_polls: u32,
    selected_partition: u8,
    storage: HashMap<(u8, u32), [u8; BLOCK]>,
    general: Vec<u8>,
    pending_read: Option<Vec<u8>>,
    pending_write: Option<u32>,
    pending_general_write: bool,
    cmd23: Option<u32>,

    // host-side bookkeeping
    last_resp: Resp,
    setup: (u32, u32),
    io: PendingIo,
    last_data_cmd: Option<u8>,
    dma_used: bool,

    // observability
    pub log: Vec<(u8, u32)>,
    pub clock_log: Vec<ClockRate>,
    pub widebus: bool,
    pub wait_enables: Vec<(u32, u32)>,
    pub cancels: usize,
    pub got_extcsd: bool,
    pub enabled_events: MediaEvent,
    pub callback: Option<MediaCallback>,
    pub dma_misaligned_setups: usize,

    // fault injection
    pub fail_event: Option<(u8, HostEvent)>,
    pub fail_r1: HashMap<u8, u32>,
}

impl MockState {
    fn new(sim: CardSim, caps: HostCaps) -> Self {
        Self {
            sim,
            caps,
            present: true,
            wrprotected: false,
            dma_align: 8,
            card_state: 0,
            app_next: false,
            prg_polls: 0,
            write_busy_polls: 2,
            selected_partition: 0,
            storage: HashMap::new(),
            general: vec![0x5a; BLOCK],
            pending_read: None,
            pending_write: None,
            pending_general_write: false,
            cmd23: None,
            last_resp: Resp::None,
            setup: (BLOCK as u32, 1),
            io: PendingIo::None,
            last_data_cmd: None,
            dma_used: false,
            log: Vec::new(),
            clock_log: Vec::new(),
            widebus: false,
            wait_enables: Vec::new(),
            cancels: 0,
            got_extcsd: false,
            enabled_events: MediaEvent::empty(),
            callback: None,
            dma_misaligned_setups: 0,
            fail_event: None,
            fail_r1: HashMap::new(),
        }
    }

    fn byte_addressed(&self) -> bool {
        match self.sim.card {
            SimCard::Sd { hc, .. } | SimCard::Mmc { hc } => !hc,
            SimCard::None => true,
        }
    }

    fn r1(&self) -> u32 {
        ((self.card_state as u32) << 9) | 0x100
    }

    fn block_of(&self, arg: u32) -> u32 {
        if self.byte_addressed() {
            arg >> 9
        } else {
            arg
        }
    }

    fn read_card_blocks(&self, arg: u32, count: u32) -> Vec<u8> {
        let start = self.block_of(arg);
        let mut out = Vec::with_capacity(count as usize * BLOCK);
        for i in 0..count {
            let block = self
                .storage
                .get(&(self.selected_partition, start + i))
                .copied()
                .unwrap_or([0u8; BLOCK]);
            out.extend_from_slice(&block);
        }
        out
    }

    fn write_card_blocks(&mut self, arg: u32, data: &[u8]) {
        let start = self.block_of(arg);
        for (i, chunk) in data.chunks_exact(BLOCK).enumerate() {
            let mut block = [0u8; BLOCK];
            block.copy_from_slice(chunk);
            self.storage
                .insert((self.selected_partition, start + i as u32), block);
        }
    }

    /// Seed one card block with a repeated byte.
    pub fn preload(&mut self, part: u8, block: u32, byte: u8) {
        self.storage.insert((part, block), [byte; BLOCK]);
    }

    pub fn stored(&self, part: u8, block: u32) -> Option<[u8; BLOCK]> {
        self.storage.get(&(part, block)).copied()
    }

    fn apply_switch(&mut self, arg: u32) {
        let index = (arg >> 16) & 0xff;
        let value = ((arg >> 8) & 0xff) as u8;
        if index == 179 {
            self.selected_partition = value & 0x7;
        }
    }

    fn command(&mut self, idx: u8, arg: u32) {
        self.log.push((idx, arg));
        let app = self.app_next;
        self.app_next = false;

        let mut resp = match (idx, app) {
            (0, _) => {
                self.card_state = 0;
                self.cmd23 = None;
                Resp::None
            }
            (1, _) => match self.sim.card {
                SimCard::Mmc { hc } => {
                    let mut ocr = 0x0030_0000;
                    if self.sim.op_cond_polls_left > 0 {
                        self.sim.op_cond_polls_left -= 1;
                    } else {
                        ocr |= 1 << 31;
                        if hc {
                            ocr |= 1 << 30;
                        }
                    }
                    Resp::R3(ocr)
                }
                _ => Resp::NoResp,
            },
            (2, _) => {
                self.card_state = 2;
                Resp::R2(self.sim.cid)
            }
            (3, _) => match self.sim.card {
                SimCard::Sd { .. } => {
                    self.card_state = 3;
                    Resp::R6((self.sim.rca as u32) << 16)
                }
                SimCard::Mmc { .. } => {
                    self.sim.rca = (arg >> 16) as u16;
                    self.card_state = 3;
                    Resp::R1(self.r1())
                }
                SimCard::None => Resp::NoResp,
            },
            (4, _) => Resp::None,
            (6, true) => Resp::R1(self.r1()),
            (6, false) => {
                self.apply_switch(arg);
                self.prg_polls = self.write_busy_polls;
                Resp::R1(self.r1())
            }
            (7, _) => {
                self.card_state = 4;
                Resp::R1(self.r1())
            }
            (8, _) => match self.sim.card {
                SimCard::Sd { v2: true, .. } => Resp::R7(arg & 0xfff),
                SimCard::Sd { v2: false, .. } | SimCard::None => Resp::NoResp,
                SimCard::Mmc { .. } => {
                    self.pending_read = Some(self.sim.ext_csd.clone());
                    self.last_data_cmd = Some(8);
                    Resp::R1(self.r1())
                }
            },
            (9, _) => Resp::R2(self.sim.csd),
            (12, _) => Resp::R1(self.r1()),
            (13, _) => {
                let state = if self.prg_polls > 0 {
                    self.prg_polls -= 1;
                    7
                } else {
                    self.card_state
                };
                Resp::R1(((state as u32) << 9) | 0x100)
            }
            (16, _) => Resp::R1(self.r1()),
            (17, _) | (18, _) => {
                let count = if idx == 17 { 1 } else { self.setup.1 };
                self.pending_read = Some(self.read_card_blocks(arg, count));
                self.last_data_cmd = Some(idx);
                Resp::R1(self.r1())
            }
            (23, false) => {
                self.cmd23 = Some(arg);
                Resp::R1(self.r1())
            }
            (23, true) => Resp::R1(self.r1()),
            (24, _) | (25, _) => {
                self.pending_write = Some(arg);
                self.last_data_cmd = Some(idx);
                Resp::R1(self.r1())
            }
            (41, true) => match self.sim.card {
                SimCard::Sd { hc, .. } => {
                    let mut ocr = 0x0030_0000;
                    if self.sim.op_cond_polls_left > 0 {
                        self.sim.op_cond_polls_left -= 1;
                    } else {
                        ocr |= 1 << 31;
                        if hc && arg & (1 << 30) != 0 {
                            ocr |= 1 << 30;
                        }
                    }
                    Resp::R3(ocr)
                }
                _ => Resp::NoResp,
            },
            (42, true) => Resp::R1(self.r1()),
            (51, true) => {
                self.pending_read = Some(self.sim.scr.to_vec());
                self.last_data_cmd = Some(51);
                Resp::R1(self.r1())
            }
            (55, _) => {
                self.app_next = true;
                Resp::R1(self.r1() | 0x20)
            }
            (56, _) => {
                self.pending_read = Some(self.general.clone());
                self.pending_general_write = true;
                self.last_data_cmd = Some(56);
                Resp::R1(self.r1())
            }
            _ => Resp::NoResp,
        };

        if let Some(bad) = self.fail_r1.remove(&idx) {
            resp = Resp::R1(bad);
        }
        self.last_resp = resp;
    }
}

/// Host side handed to the slot; all state lives behind the shared mutex so
/// the test keeps a window into it.
pub struct MockHost {
    pub state: Arc<Mutex<MockState>>,
}

impl SdioHost for MockHost {
    fn capabilities(&self) -> HostCaps {
        self.state.lock().unwrap().caps
    }

    fn attach(&mut self) -> Result<()> {
        Ok(())
    }

    fn present(&self) -> bool {
        self.state.lock().unwrap().present
    }

    fn write_protected(&self) -> bool {
        self.state.lock().unwrap().wrprotected
    }

    fn clock(&mut self, rate: ClockRate) {
        self.state.lock().unwrap().clock_log.push(rate);
    }

    fn widebus(&mut self, enable: bool) {
        self.state.lock().unwrap().widebus = enable;
    }

    fn send_cmd(&mut self, cmd: Cmd, arg: u32) -> Result<()> {
        self.state.lock().unwrap().command(cmd.index(), arg);
        Ok(())
    }

    fn recv_r1(&mut self, _cmd: Cmd) -> Result<u32> {
        match self.state.lock().unwrap().last_resp {
            Resp::R1(v) => Ok(v),
            Resp::NoResp => Err(SdError::Timeout),
            _ => Err(SdError::Io),
        }
    }

    fn recv_r2(&mut self, _cmd: Cmd) -> Result<[u32; 4]> {
        match self.state.lock().unwrap().last_resp {
            Resp::R2(v) => Ok(v),
            Resp::NoResp => Err(SdError::Timeout),
            _ => Err(SdError::Io),
        }
    }

    fn recv_r3(&mut self, _cmd: Cmd) -> Result<u32> {
        match self.state.lock().unwrap().last_resp {
            Resp::R3(v) => Ok(v),
            Resp::NoResp => Err(SdError::Timeout),
            _ => Err(SdError::Io),
        }
    }

    fn recv_r6(&mut self, _cmd: Cmd) -> Result<u32> {
        match self.state.lock().unwrap().last_resp {
            Resp::R6(v) => Ok(v),
            Resp::NoResp => Err(SdError::Timeout),
            _ => Err(SdError::Io),
        }
    }

    fn recv_r7(&mut self, _cmd: Cmd) -> Result<u32> {
        match self.state.lock().unwrap().last_resp {
            Resp::R7(v) => Ok(v),
            Resp::NoResp => Err(SdError::Timeout),
            _ => Err(SdError::Io),
        }
    }

    fn block_setup(&mut self, blocklen: u32, nblocks: u32) {
        self.state.lock().unwrap().setup = (blocklen, nblocks);
    }

    fn recv_setup(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.io = PendingIo::Recv {
            ptr: buf.as_mut_ptr() as usize,
            len: buf.len(),
        };
        st.dma_used = false;
        Ok(())
    }

    fn send_setup(&mut self, buf: &[u8]) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.io = PendingIo::Send {
            ptr: buf.as_ptr() as usize,
            len: buf.len(),
        };
        st.dma_used = false;
        Ok(())
    }

    fn dma_preflight(&self, buf: &[u8]) -> bool {
        let st = self.state.lock().unwrap();
        buf.as_ptr() as usize % st.dma_align == 0
    }

    fn dma_alignment(&self) -> usize {
        self.state.lock().unwrap().dma_align
    }

    fn dma_recv_setup(&mut self, buf: &mut [u8]) -> Result<()> {
        {
            let mut st = self.state.lock().unwrap();
            if buf.as_ptr() as usize % st.dma_align != 0 {
                st.dma_misaligned_setups += 1;
            }
        }
        self.recv_setup(buf)?;
        self.state.lock().unwrap().dma_used = true;
        Ok(())
    }

    fn dma_send_setup(&mut self, buf: &[u8]) -> Result<()> {
        {
            let mut st = self.state.lock().unwrap();
            if buf.as_ptr() as usize % st.dma_align != 0 {
                st.dma_misaligned_setups += 1;
            }
        }
        self.send_setup(buf)?;
        self.state.lock().unwrap().dma_used = true;
        Ok(())
    }

    fn wait_enable(&mut self, events: HostEvent, timeout_ms: u32) {
        self.state
            .lock()
            .unwrap()
            .wait_enables
            .push((events.bits(), timeout_ms));
    }

    fn event_wait(&mut self) -> HostEvent {
        let mut st = self.state.lock().unwrap();

        if let Some((idx, ev)) = st.fail_event {
            if st.last_data_cmd == Some(idx) {
                st.fail_event = None;
                st.pending_read = None;
                st.pending_write = None;
                st.pending_general_write = false;
                st.io = PendingIo::None;
                return ev;
            }
        }

        let io = st.io;
        match io {
            PendingIo::Recv { ptr, len } => {
                if let Some(data) = st.pending_read.take() {
                    let n = len.min(data.len());
                    unsafe {
                        std::ptr::copy_nonoverlapping(data.as_ptr(), ptr as *mut u8, n);
                    }
                }
            }
            PendingIo::Send { ptr, len } => {
                let bytes = unsafe { std::slice::from_raw_parts(ptr as *const u8, len) }.to_vec();
                if let Some(arg) = st.pending_write.take() {
                    st.write_card_blocks(arg, &bytes);
                    st.prg_polls = st.write_busy_polls;
                } else if st.pending_general_write {
                    st.general = bytes;
                    st.prg_polls = st.write_busy_polls;
                }
            }
            PendingIo::None => {}
        }
        st.pending_read = None;
        st.pending_general_write = false;
        st.io = PendingIo::None;
        HostEvent::TRANSFER_DONE
    }

    fn cancel(&mut self) {
        self.state.lock().unwrap().cancels += 1;
    }

    fn register_callback(&mut self, callback: MediaCallback) {
        self.state.lock().unwrap().callback = Some(callback);
    }

    fn callback_enable(&mut self, events: MediaEvent) {
        self.state.lock().unwrap().enabled_events = events;
    }

    fn got_extcsd(&mut self, _extcsd: &[u8; EXT_CSD_SIZE]) {
        self.state.lock().unwrap().got_extcsd = true;
    }
}

/// Run the registered media-change callback the way the host would: outside
/// any mock lock, in thread context.
pub fn fire_media_change(state: &Arc<Mutex<MockState>>) {
    let callback = state.lock().unwrap().callback.take();
    if let Some(mut callback) = callback {
        callback();
        state.lock().unwrap().callback = Some(callback);
    }
}

/// Registry that records registrations by name.
#[derive(Default)]
pub struct MockRegistry {
    entries: Mutex<BTreeMap<String, Arc<dyn BlockDevice>>>,
}

impl MockRegistry {
    pub fn names(&self) -> Vec<String> {
        self.entries.lock().unwrap().keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BlockDevice>> {
        self.entries.lock().unwrap().get(name).cloned()
    }
}

impl DeviceRegistry for MockRegistry {
    fn register(&self, name: &str, device: Arc<dyn BlockDevice>) -> Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(name.to_string(), device);
        Ok(())
    }

    fn unregister(&self, name: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or(SdError::NoDevice)
    }
}

/// No-op sleeping for tests.
pub struct TestSleep;

impl SleepOps for TestSleep {
    fn sleep_ms(_ms: usize) {}
    fn delay_us(_us: usize) {}
    fn yield_now() {}
}

// ---- card flavors ----

/// CSD v2 with C_SIZE = 0x781F: 31,490,048 blocks.
pub const SDV2_CSD: [u32; 4] = [0x400e_0032, 0x5b59_0000, 0x781f_7f80, 0x0a40_0000];
/// CSD v1 with C_SIZE = 0xE3F, C_SIZE_MULT = 7: 1,867,776 blocks.
pub const SDV1_CSD: [u32; 4] = [0x002d_0032, 0x5f59_838f, 0xcfff_bcff, 0x9680_0000];
/// MMC CSD with C_SIZE = 0xFFF: size deferred to EXT_CSD.
pub const MMC_CSD: [u32; 4] = [0x9026_0032, 0x0f59_93ff, 0xf6db_ff87, 0x8a40_400d];

pub const TEST_CID: [u32; 4] = [0x0353_4453, 0x5530_3847, 0x8098_7654, 0x3201_3600];

pub fn scr_bytes(four_bit: bool, cmd23: bool) -> [u8; 8] {
    let widths = if four_bit { 0x05 } else { 0x01 };
    [
        0x02,
        0x40 | widths,
        0x80,
        if cmd23 { 0x02 } else { 0x00 },
        0,
        0,
        0,
        0,
    ]
}

pub fn sdv2_hc_sim(cmd23: bool) -> CardSim {
    CardSim {
        card: SimCard::Sd { v2: true, hc: true },
        cid: TEST_CID,
        csd: SDV2_CSD,
        scr: scr_bytes(true, cmd23),
        ext_csd: Vec::new(),
        rca: 0x1234,
        op_cond_polls_left: 0,
    }
}

pub fn sdv1_sim() -> CardSim {
    CardSim {
        card: SimCard::Sd {
            v2: false,
            hc: false,
        },
        cid: TEST_CID,
        csd: SDV1_CSD,
        scr: scr_bytes(false, false),
        ext_csd: Vec::new(),
        rca: 0x0042,
        op_cond_polls_left: 0,
    }
}

/// eMMC with user area from SEC_COUNT plus boot/rpmb/gp1 partitions.
pub fn mmc_sim() -> CardSim {
    let mut ext = vec![0u8; EXT_CSD_SIZE];
    ext[192] = 8; // EXT_CSD_REV
    ext[214] = 0xec; // SEC_COUNT = 0x00EC0000
    ext[160] = 0x01; // partitioning enabled
    ext[155] = 0x01; // partition setting completed
    ext[226] = 16; // boot partitions: 2 MiB each
    ext[168] = 2; // rpmb: 256 KiB
    ext[224] = 1; // hc_erase_grp_size
    ext[221] = 4; // hc_wp_grp_size
    ext[143] = 2; // gp1 multiplier
    CardSim {
        card: SimCard::Mmc { hc: true },
        cid: TEST_CID,
        csd: MMC_CSD,
        scr: [0; 8],
        ext_csd: ext,
        rca: 0,
        op_cond_polls_left: 0,
    }
}

pub fn absent_sim() -> CardSim {
    CardSim {
        card: SimCard::None,
        cid: [0; 4],
        csd: [0; 4],
        scr: [0; 8],
        ext_csd: Vec::new(),
        rca: 0,
        op_cond_polls_left: 0,
    }
}

// ---- rig ----

pub struct TestRig {
    pub state: Arc<Mutex<MockState>>,
    pub registry: Arc<MockRegistry>,
    pub slot: Arc<SdSlot<MockHost, TestSleep>>,
}

impl TestRig {
    pub fn log(&self) -> Vec<(u8, u32)> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn clear_log(&self) {
        self.state.lock().unwrap().log.clear();
    }

    /// Indices of every command sent, in order.
    pub fn cmd_indices(&self) -> Vec<u8> {
        self.log().iter().map(|(idx, _)| *idx).collect()
    }

    pub fn count_cmd(&self, idx: u8) -> usize {
        self.log().iter().filter(|(i, _)| *i == idx).count()
    }

    pub fn device(&self, name: &str) -> Arc<dyn BlockDevice> {
        self.registry
            .get(name)
            .unwrap_or_else(|| panic!("{} not registered", name))
    }
}

pub fn bind_rig(sim: CardSim, caps: HostCaps, config: SlotConfig) -> TestRig {
    bind_rig_with(sim, caps, config, |_| {})
}

/// Like [`bind_rig`], with a hook to tweak the mock (fault injection, write
/// protect, storage preload) before the initial probe runs.
pub fn bind_rig_with(
    sim: CardSim,
    caps: HostCaps,
    config: SlotConfig,
    tweak: impl FnOnce(&mut MockState),
) -> TestRig {
    let present = sim.card != SimCard::None;
    let state = Arc::new(Mutex::new(MockState::new(sim, caps)));
    {
        let mut st = state.lock().unwrap();
        st.present = present;
        tweak(&mut st);
    }
    let registry = Arc::new(MockRegistry::default());
    let host = MockHost {
        state: Arc::clone(&state),
    };
    let slot = SdSlot::<MockHost, TestSleep>::bind(
        host,
        config,
        registry.clone() as Arc<dyn DeviceRegistry>,
    )
    .expect("bind failed");
    TestRig {
        state,
        registry,
        slot,
    }
}

/// Assert `pattern` appears in `log` as a subsequence; `None` arguments
/// match anything.
pub fn assert_subseq(log: &[(u8, u32)], pattern: &[(u8, Option<u32>)]) {
    let mut it = log.iter();
    for (idx, arg) in pattern {
        let found = it.any(|(i, a)| i == idx && arg.map_or(true, |want| *a == want));
        assert!(
            found,
            "command CMD{} (arg {:?}) not found in order in {:?}",
            idx, arg, log
        );
    }
}
