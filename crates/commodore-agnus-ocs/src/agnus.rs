//! Agnus: the beam clock, the per-cycle bus arbiter, and the chip register
//! bus that drives the DMA slot table, the DAS table and the Copper.
//!
//! Time is kept in master clock ticks (`emu_core::Ticks`); one DMA cycle is 8
//! master ticks. `execute_until` walks the beam one DMA cycle at a time,
//! dispatching whatever the scheduler has due before advancing.

use emu_core::{Observable, Ticks, Value};

use crate::collab::Collaborators;
use crate::config::AgnusConfig;
use crate::copper::{Copper, Outcome as CopperOutcome, State as CopperState};
use crate::das_table::{self, DasTable};
use crate::dma_table::{DmaTable, SLOTS_PER_LINE};
use crate::scheduler::{BltEvent, CiaEvent, CopEvent, DasEvent, DmaEvent, RegEvent, Scheduler, SecEvent};
use crate::snapshot::{Reader, SnapshotError, Writer};

/// Master ticks per DMA cycle.
pub const TICKS_PER_DMA_CYCLE: u64 = 8;
/// Master ticks a REG write is delayed before taking effect (2 DMA cycles).
const REG_DELAY_TICKS: u64 = 2 * TICKS_PER_DMA_CYCLE;

const DMACON_DMAEN: u16 = 0x0200;
const DMACON_BPLEN: u16 = 0x0100;
const DMACON_COPEN: u16 = 0x0080;
const DMACON_SPREN: u16 = 0x0020;
const DMACON_DSKEN: u16 = 0x0010;
const DMACON_AUD: [u16; 4] = [0x0001, 0x0002, 0x0004, 0x0008];

const BPLCON0_HIRES: u16 = 0x8000;
const BPLCON0_LACE: u16 = 0x0004;
const BPLCON0_BPU_SHIFT: u16 = 12;
const BPLCON0_BPU_MASK: u16 = 0x7;

const ADDR_DMACONR: u16 = 0x002;
const ADDR_VPOSR: u16 = 0x004;
const ADDR_VHPOSR: u16 = 0x006;
const ADDR_COP1LCH: u16 = 0x080;
const ADDR_COP1LCL: u16 = 0x082;
const ADDR_COP2LCH: u16 = 0x084;
const ADDR_COP2LCL: u16 = 0x086;
const ADDR_COPJMP1: u16 = 0x088;
const ADDR_COPJMP2: u16 = 0x08A;
const ADDR_COPINS: u16 = 0x08C;
const ADDR_DIWSTRT: u16 = 0x08E;
const ADDR_DIWSTOP: u16 = 0x090;
const ADDR_DDFSTRT: u16 = 0x092;
const ADDR_DDFSTOP: u16 = 0x094;
const ADDR_DMACON: u16 = 0x096;
const ADDR_DSKPTH: u16 = 0x020;
const ADDR_DSKPTL: u16 = 0x022;
const ADDR_BPL1PTH: u16 = 0x0E0;
const ADDR_BPL1MOD: u16 = 0x108;
const ADDR_BPL2MOD: u16 = 0x10A;
const ADDR_BPLCON0: u16 = 0x100;
const ADDR_COPCON: u16 = 0x02E;
const ADDR_SPR0PTH: u16 = 0x120;

const QUERY_PATHS: &[&str] = &[
    "beam.v",
    "beam.h",
    "frame.nr",
    "frame.longFrame",
    "dma.dmacon",
    "dma.activeBitplanes",
    "copper.state",
    "copper.coppc",
    "warnings.clockRegressions",
];

/// Who drove the bus on a given DMA cycle, recorded per-line for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusOwner {
    #[default]
    None,
    Disk,
    Audio,
    Bitplane,
    Sprite,
    Copper,
    Blitter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpriteDmaState {
    Idle,
    Data,
}

/// The register-change effects the REG slot replays after its fixed delay.
#[derive(Debug, Clone, Copy)]
enum RegEffect {
    DiwStrt(u16),
    DiwStop(u16),
    DdfStrt(u16),
    DdfStop(u16),
    Bpl1Mod(i16),
    Bpl2Mod(i16),
    BplPtHi(u8, u16),
    BplPtLo(u8, u16),
}

#[derive(Debug, Clone, Copy)]
struct QueuedChange {
    when: u64,
    effect: RegEffect,
}

#[derive(Debug, Clone, Copy)]
struct FrameInfo {
    nr: u64,
    interlaced: bool,
    long_frame: bool,
    num_lines: u16,
}

impl Default for FrameInfo {
    fn default() -> Self {
        Self { nr: 0, interlaced: false, long_frame: true, num_lines: 312 }
    }
}

/// Who sources a given chip register write. A CPU poke and a Copper MOVE
/// follow the same admission rule today; the distinction is kept at the
/// collaborator boundary for whatever needs it next (e.g. bus contention
/// between the two).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterSource {
    Cpu,
    Copper,
}

pub struct Agnus {
    pub config: AgnusConfig,

    pub v: u16,
    pub h: u16,
    pub clock: u64,
    frame: FrameInfo,
    v_flop: bool,
    diw_vstrt: i32,
    diw_vstop: i32,
    diw_hstrt: i32,
    diw_hstop: i32,

    pub dmacon: u16,
    pub bplcon0: u16,
    pub diwstrt: u16,
    pub diwstop: u16,
    pub ddfstrt: u16,
    pub ddfstop: u16,
    pub bpl1mod: i16,
    pub bpl2mod: i16,
    pub bplpt: [u32; 6],
    pub dskpt: u32,
    pub audlc: [u32; 4],
    pub sprpt: [u32; 8],
    spr_vstrt: [u16; 8],
    spr_vstop: [u16; 8],
    spr_dma_state: [SpriteDmaState; 8],

    pub copper: Copper,

    scheduler: Scheduler,
    dma_table: DmaTable,
    das_table: DasTable,
    das_idx: usize,
    reg_queue: Vec<QueuedChange>,

    pub bus_owner: [BusOwner; SLOTS_PER_LINE],
    pub bus_value: [u16; SLOTS_PER_LINE],

    clock_regressions: u64,
}

fn plane_index(event: DmaEvent) -> Option<usize> {
    match event {
        DmaEvent::BplL1 | DmaEvent::BplH1 => Some(0),
        DmaEvent::BplL2 | DmaEvent::BplH2 => Some(1),
        DmaEvent::BplL3 | DmaEvent::BplH3 => Some(2),
        DmaEvent::BplL4 | DmaEvent::BplH4 => Some(3),
        DmaEvent::BplL5 => Some(4),
        DmaEvent::BplL6 => Some(5),
        _ => None,
    }
}

fn plane_event(plane: usize, hires: bool) -> DmaEvent {
    if hires {
        match plane {
            0 => DmaEvent::BplH1,
            1 => DmaEvent::BplH2,
            2 => DmaEvent::BplH3,
            3 => DmaEvent::BplH4,
            _ => DmaEvent::None,
        }
    } else {
        match plane {
            0 => DmaEvent::BplL1,
            1 => DmaEvent::BplL2,
            2 => DmaEvent::BplL3,
            3 => DmaEvent::BplL4,
            4 => DmaEvent::BplL5,
            5 => DmaEvent::BplL6,
            _ => DmaEvent::None,
        }
    }
}

impl Agnus {
    #[must_use]
    pub fn new(config: AgnusConfig) -> Self {
        let mut agnus = Self {
            config,
            v: 0,
            h: 0,
            clock: 0,
            frame: FrameInfo::default(),
            v_flop: false,
            diw_vstrt: -1,
            diw_vstop: -1,
            diw_hstrt: -1,
            diw_hstop: -1,
            dmacon: 0,
            bplcon0: 0,
            diwstrt: 0,
            diwstop: 0,
            ddfstrt: 0,
            ddfstop: 0,
            bpl1mod: 0,
            bpl2mod: 0,
            bplpt: [0; 6],
            dskpt: 0,
            audlc: [0; 4],
            sprpt: [0; 8],
            spr_vstrt: [0; 8],
            spr_vstop: [0; 8],
            spr_dma_state: [SpriteDmaState::Idle; 8],
            copper: Copper::new(),
            scheduler: Scheduler::new(),
            dma_table: DmaTable::default(),
            das_table: DasTable::build(),
            das_idx: 0,
            reg_queue: Vec::new(),
            bus_owner: [BusOwner::None; SLOTS_PER_LINE],
            bus_value: [0; SLOTS_PER_LINE],
            clock_regressions: 0,
        };
        agnus.das_idx = agnus.das_table.first_enabled(agnus.das_mask()).unwrap_or(0);
        agnus
    }

    #[must_use]
    pub fn num_bitplanes(&self) -> u8 {
        (((self.bplcon0 >> BPLCON0_BPU_SHIFT) & BPLCON0_BPU_MASK) as u8).min(6)
    }

    #[must_use]
    pub fn hires(&self) -> bool {
        self.bplcon0 & BPLCON0_HIRES != 0
    }

    fn dma_master_enabled(&self) -> bool {
        self.dmacon & DMACON_DMAEN != 0
    }

    fn dma_enabled(&self, bit: u16) -> bool {
        self.dma_master_enabled() && self.dmacon & bit != 0
    }

    fn bitplane_dma_on(&self) -> bool {
        self.v_flop
            && self.v >= 26
            && self.v < self.frame.num_lines.saturating_sub(1)
            && self.num_bitplanes() > 0
            && self.dma_enabled(DMACON_BPLEN)
    }

    fn das_mask(&self) -> u16 {
        let mut mask = 0u16;
        if self.dma_master_enabled() {
            mask |= das_table::DMAEN;
            if self.dmacon & DMACON_DSKEN != 0 {
                mask |= das_table::DSKEN;
            }
            if self.dmacon & DMACON_SPREN != 0 {
                mask |= das_table::SPREN;
            }
            for (ch, &bit) in DMACON_AUD.iter().enumerate() {
                if self.dmacon & bit != 0 {
                    mask |= 1 << (2 + ch);
                }
            }
        }
        mask
    }

    fn bplxpt_write_is_lost(&self, plane: usize) -> bool {
        let ev = plane_event(plane, self.hires());
        if ev == DmaEvent::None {
            return false;
        }
        let k1 = self.h as usize + 1;
        let k2 = self.h as usize + 2;
        if k1 >= SLOTS_PER_LINE || k2 >= SLOTS_PER_LINE {
            return false;
        }
        self.dma_table.dma_event[k1] == ev && self.dma_table.dma_event[k2] == DmaEvent::None
    }

    fn post_delayed(&mut self, effect: RegEffect) {
        let when = self.clock + REG_DELAY_TICKS;
        self.reg_queue.push(QueuedChange { when, effect });
        self.reg_queue.sort_by_key(|c| c.when);
        self.scheduler.reg.schedule_abs(self.reg_queue[0].when, RegEvent::ApplyNext, 0);
    }

    fn apply_reg_effect(&mut self, effect: RegEffect) {
        match effect {
            RegEffect::DiwStrt(v) => {
                self.diwstrt = v;
                self.diw_vstrt = i32::from(v >> 8);
                let hstrt = i32::from(v & 0xFF);
                self.diw_hstrt = if hstrt < 2 { -1 } else { hstrt };
            }
            RegEffect::DiwStop(v) => {
                self.diwstop = v;
                self.diw_vstop = i32::from(v >> 8) | if v & 0x8000 == 0 { 0x100 } else { 0 };
                let hstop = i32::from(v & 0xFF) | 0x100;
                self.diw_hstop = if hstop > 0x1C7 { -1 } else { hstop };
            }
            RegEffect::DdfStrt(v) => {
                self.ddfstrt = v;
                self.refresh_ddf_mid_line();
            }
            RegEffect::DdfStop(v) => {
                self.ddfstop = v;
                self.refresh_ddf_mid_line();
            }
            RegEffect::Bpl1Mod(v) => self.bpl1mod = v,
            RegEffect::Bpl2Mod(v) => self.bpl2mod = v,
            RegEffect::BplPtHi(plane, hi) => {
                let p = plane as usize;
                if !self.bplxpt_write_is_lost(p) {
                    self.bplpt[p] = (self.bplpt[p] & 0xFFFF) | (u32::from(hi & 0x7) << 16);
                }
            }
            RegEffect::BplPtLo(plane, lo) => {
                let p = plane as usize;
                if !self.bplxpt_write_is_lost(p) {
                    self.bplpt[p] = (self.bplpt[p] & 0x7_0000) | u32::from(lo & 0xFFFE);
                }
            }
        }
    }

    /// A mid-line DDFSTRT/DDFSTOP write must not wait for the next HSYNC to
    /// take hold: recompute the fetch window now and reschedule the BPL slot
    /// from the current cycle forward.
    fn refresh_ddf_mid_line(&mut self) {
        let bpl_on = self.bitplane_dma_on();
        self.dma_table.rebuild(self.ddfstrt, self.ddfstop, self.hires(), self.num_bitplanes(), bpl_on);

        let h = (self.h as usize).min(SLOTS_PER_LINE - 1);
        let next_h = self.dma_table.next_dma_event[h];
        if next_h == 0 {
            self.scheduler.bpl.cancel();
        } else {
            let delta = (u64::from(next_h) - h as u64) * TICKS_PER_DMA_CYCLE;
            self.scheduler.bpl.schedule_rel(self.clock, delta, self.dma_table.dma_event[next_h as usize], 0);
        }
    }

    fn dispatch_reg(&mut self) {
        if !self.reg_queue.is_empty() && self.reg_queue[0].when <= self.clock {
            let change = self.reg_queue.remove(0);
            self.apply_reg_effect(change.effect);
        }
        if self.reg_queue.is_empty() {
            self.scheduler.reg.cancel();
        } else {
            self.scheduler.reg.schedule_abs(self.reg_queue[0].when, RegEvent::ApplyNext, 0);
        }
    }

    fn dispatch_bpl(&mut self, collab: &mut Collaborators) {
        let h = self.h as usize;
        let event = self.dma_table.dma_event[h];
        if let Some(plane) = plane_index(event) {
            let word = collab.chip_ram.read16(self.bplpt[plane] & 0x7_FFFE);
            self.bplpt[plane] = (self.bplpt[plane] + 2) & 0x7_FFFF;
            self.bus_owner[h] = BusOwner::Bitplane;
            self.bus_value[h] = word;
            collab.denise.bpl_slice_word(plane as u8, word);
        }

        let next_h = self.dma_table.next_dma_event[h];
        if next_h == 0 {
            self.scheduler.bpl.cancel();
        } else {
            let delta = (u64::from(next_h) - h as u64) * TICKS_PER_DMA_CYCLE;
            self.scheduler.bpl.schedule_rel(self.clock, delta, self.dma_table.dma_event[next_h as usize], 0);
        }
    }

    fn dispatch_das(&mut self, collab: &mut Collaborators) {
        let h = self.h as usize;
        let event = self.das_table.event_of(self.das_idx);
        match event {
            DasEvent::Refresh => {}
            DasEvent::Disk(_phase) => {
                let word = collab.chip_ram.read16(self.dskpt & 0x7_FFFE);
                self.dskpt = (self.dskpt + 2) & 0x7_FFFF;
                self.bus_owner[h] = BusOwner::Disk;
                self.bus_value[h] = word;
            }
            DasEvent::Audio(ch) => {
                let word = collab.chip_ram.read16(self.audlc[ch as usize] & 0x7_FFFE);
                self.audlc[ch as usize] = (self.audlc[ch as usize] + 2) & 0x7_FFFF;
                self.bus_owner[h] = BusOwner::Audio;
                self.bus_value[h] = word;
                collab.paula.audio_fill_word_for(ch, word);
            }
            DasEvent::Sprite(ch, phase) => {
                let idx = ch as usize;
                if self.v == self.spr_vstop[idx] {
                    self.spr_dma_state[idx] = SpriteDmaState::Idle;
                }
                if self.v == self.spr_vstrt[idx] {
                    self.spr_dma_state[idx] = SpriteDmaState::Data;
                }

                let word = collab.chip_ram.read16(self.sprpt[idx] & 0x7_FFFE);
                self.sprpt[idx] = (self.sprpt[idx] + 2) & 0x7_FFFF;
                self.bus_owner[h] = BusOwner::Sprite;
                self.bus_value[h] = word;

                if self.spr_dma_state[idx] == SpriteDmaState::Idle {
                    if phase == 0 {
                        let lo8 = (word >> 8) & 0xFF;
                        self.spr_vstrt[idx] = (self.spr_vstrt[idx] & 0x100) | lo8;
                    } else {
                        let lo8 = (word >> 8) & 0xFF;
                        self.spr_vstop[idx] = (self.spr_vstop[idx] & 0x100) | lo8;
                        let vstrt_hi8 = if word & 0x0004 == 0 { 0x100 } else { 0 };
                        let vstop_hi8 = if word & 0x0002 == 0 { 0x100 } else { 0 };
                        self.spr_vstrt[idx] = (self.spr_vstrt[idx] & 0xFF) | vstrt_hi8;
                        self.spr_vstop[idx] = (self.spr_vstop[idx] & 0xFF) | vstop_hi8;
                    }
                }
            }
        }

        let mask = self.das_mask();
        let (next_idx, delay) = self.das_table.next_with_index(self.das_idx, mask);
        self.das_idx = next_idx;
        self.scheduler.das.schedule_rel(
            self.clock,
            u64::from(delay) * TICKS_PER_DMA_CYCLE,
            self.das_table.event_of(next_idx),
            0,
        );
    }

    /// Ticks until the beam reaches packed position `target = (v << 8) | h`.
    /// `h`'s packed field spans 0..256 but a real line is only
    /// [`SLOTS_PER_LINE`] cycles wide, so a plain packed subtraction would
    /// misjudge the distance whenever a WAIT targets a high `h`; carry the
    /// excess into `v` the way a real beam would.
    fn beam_diff_ticks(&self, target: u32) -> u64 {
        let lpl = SLOTS_PER_LINE as u64;
        let target_v = u64::from((target >> 8) & 0x1FF);
        let target_h = u64::from(target & 0xFF);
        let target_v = target_v + target_h / lpl;
        let target_h = target_h % lpl;

        let cur_abs = u64::from(self.v) * lpl + u64::from(self.h);
        let target_abs = target_v * lpl + target_h;

        target_abs.saturating_sub(cur_abs).saturating_sub(2) * TICKS_PER_DMA_CYCLE
    }

    fn dispatch_cop(&mut self, collab: &mut Collaborators) {
        let event = self.scheduler.cop.id;
        let h = self.h;

        if matches!(event, CopEvent::ReqDma | CopEvent::Fetch | CopEvent::Move | CopEvent::WaitSkip) {
            let copper_dma_enabled = self.dma_master_enabled() && self.dmacon & DMACON_COPEN != 0;
            let bus_free = self.bus_owner[h as usize] == BusOwner::None;
            if !Copper::can_run(copper_dma_enabled, bus_free, h) {
                self.scheduler.cop.schedule_rel(self.clock, TICKS_PER_DMA_CYCLE, event, 0);
                return;
            }
        }

        let blitter_busy = collab.blitter.is_busy();
        let beam_v = self.v;
        let beam_h = self.h;
        let chip_ram = &mut collab.chip_ram;
        let outcome = self.copper.step(event, beam_v, beam_h, &mut |addr| chip_ram.read16(addr), blitter_busy);

        if matches!(event, CopEvent::Fetch | CopEvent::Move | CopEvent::WaitSkip) {
            self.bus_owner[h as usize] = BusOwner::Copper;
        }

        let mut park_ticks = None;
        match outcome {
            CopperOutcome::RegisterWrite { reg, value } => self.poke_chip(reg, value, RegisterSource::Copper, collab),
            CopperOutcome::ParkUntil(pos) => park_ticks = Some(self.beam_diff_ticks(pos)),
            CopperOutcome::None | CopperOutcome::Stopped | CopperOutcome::Unreachable => {}
        }

        match self.copper.state {
            CopperState::Idle => self.scheduler.cop.cancel(),
            CopperState::ReqDma => {
                let delay = park_ticks.unwrap_or(TICKS_PER_DMA_CYCLE);
                self.scheduler.cop.schedule_rel(self.clock, delay, CopEvent::ReqDma, 0);
            }
            CopperState::Fetch => {
                self.scheduler.cop.schedule_rel(self.clock, TICKS_PER_DMA_CYCLE, CopEvent::Fetch, 0);
            }
            CopperState::Move => {
                self.scheduler.cop.schedule_rel(self.clock, TICKS_PER_DMA_CYCLE, CopEvent::Move, 0);
            }
            CopperState::WaitSkip => {
                self.scheduler.cop.schedule_rel(self.clock, TICKS_PER_DMA_CYCLE, CopEvent::WaitSkip, 0);
            }
            CopperState::WaitBlit => {
                let delay = park_ticks.unwrap_or(TICKS_PER_DMA_CYCLE);
                self.scheduler.cop.schedule_rel(self.clock, delay, CopEvent::WaitBlit, 0);
            }
        }
    }

    fn hsync(&mut self, collab: &mut Collaborators) {
        collab.denise.end_of_line(self.v);
        collab.paula.audio_execute_until(self.clock);
        collab.cia_b.increment_tod();

        self.v += 1;
        if self.v >= self.frame.num_lines {
            self.vsync(collab);
        }

        if i32::from(self.v) == self.diw_vstrt {
            self.v_flop = true;
        }
        if i32::from(self.v) == self.diw_vstop {
            self.v_flop = false;
        }

        let bpl_on = self.bitplane_dma_on();
        self.dma_table.rebuild(self.ddfstrt, self.ddfstop, self.hires(), self.num_bitplanes(), bpl_on);

        let (first_px, last_px) = if self.dma_table.dma_first_bpl1_event == 0 {
            (0, 0)
        } else {
            let first = u16::from(self.dma_table.dma_first_bpl1_event);
            let last = u16::from(self.dma_table.dma_last_bpl1_event);
            let tail = if self.hires() { 15 } else { 31 };
            (first * 4 + 6, last * 4 + 6 + tail)
        };
        collab.denise.set_first_last_canvas_pixel(first_px, last_px);

        self.bus_owner = [BusOwner::None; SLOTS_PER_LINE];
        self.bus_value = [0; SLOTS_PER_LINE];

        collab.denise.begin_of_line(self.v);

        let base = self.clock + TICKS_PER_DMA_CYCLE;
        if let Some(first) = self.dma_table.first_event_index() {
            self.scheduler.bpl.schedule_abs(
                base + u64::from(first) * TICKS_PER_DMA_CYCLE,
                self.dma_table.dma_event[first as usize],
                0,
            );
        } else {
            self.scheduler.bpl.cancel();
        }

        let mask = self.das_mask();
        if let Some(first_das) = self.das_table.first_enabled(mask) {
            self.das_idx = first_das;
            self.scheduler.das.schedule_abs(
                base + u64::from(self.das_table.h_of(first_das)) * TICKS_PER_DMA_CYCLE,
                self.das_table.event_of(first_das),
                0,
            );
        } else {
            self.scheduler.das.cancel();
        }
    }

    fn vsync(&mut self, collab: &mut Collaborators) {
        self.frame.nr += 1;
        self.frame.interlaced = self.bplcon0 & BPLCON0_LACE != 0;
        self.frame.long_frame = if self.frame.interlaced { !self.frame.long_frame } else { true };
        self.frame.num_lines = if self.frame.long_frame { 313 } else { 312 };
        self.v = 0;
        self.v_flop = false;

        collab.cia_a.increment_tod();
        collab.paula.intreq_raise(0x0020);

        self.scheduler.cop.schedule_rel(self.clock, 4, CopEvent::Jmp1, 0);
    }

    fn execute_due(&mut self, collab: &mut Collaborators) {
        let now = self.clock;

        if self.scheduler.reg.is_pending() && self.scheduler.reg.trigger <= now {
            self.dispatch_reg();
        }
        if self.scheduler.ciaa.is_pending() && self.scheduler.ciaa.trigger <= now {
            collab.cia_a.increment_tod();
            self.scheduler.ciaa.cancel();
        }
        if self.scheduler.ciab.is_pending() && self.scheduler.ciab.trigger <= now {
            collab.cia_b.increment_tod();
            self.scheduler.ciab.cancel();
        }
        if self.scheduler.bpl.is_pending() && self.scheduler.bpl.trigger <= now {
            self.dispatch_bpl(collab);
        }
        if self.scheduler.das.is_pending() && self.scheduler.das.trigger <= now {
            self.dispatch_das(collab);
        }
        if self.scheduler.cop.is_pending() && self.scheduler.cop.trigger <= now {
            self.dispatch_cop(collab);
        }
        if self.scheduler.blt.is_pending() && self.scheduler.blt.trigger <= now {
            self.scheduler.blt.cancel();
        }
    }

    /// Advance the beam, dispatching every due event, until `target` master
    /// ticks have elapsed.
    pub fn execute_until(&mut self, target: Ticks, collab: &mut Collaborators) {
        let target = target.0;
        if target < self.clock {
            self.clock_regressions += 1;
            return;
        }
        while self.clock < target {
            self.execute_due(collab);
            if self.h as usize >= SLOTS_PER_LINE - 1 {
                self.h = 0;
                self.hsync(collab);
            } else {
                self.h += 1;
            }
            self.clock += TICKS_PER_DMA_CYCLE;
        }
    }

    /// Write a chip register. `source` distinguishes a CPU poke from a
    /// Copper MOVE for future use; both follow the same admission rule
    /// today.
    pub fn poke_chip(&mut self, addr: u16, value: u16, _source: RegisterSource, collab: &mut Collaborators) {
        match addr {
            ADDR_DMACON => {
                let old = self.dmacon;
                if value & 0x8000 != 0 {
                    self.dmacon |= value & 0x7FFF;
                } else {
                    self.dmacon &= !(value & 0x7FFF);
                }
                collab.blitter.dmacon_update(old, self.dmacon);

                let old_en = old & DMACON_DMAEN != 0;
                let new_en = self.dmacon & DMACON_DMAEN != 0;
                for (ch, &bit) in DMACON_AUD.iter().enumerate() {
                    let was_on = old_en && old & bit != 0;
                    let is_on = new_en && self.dmacon & bit != 0;
                    if was_on != is_on {
                        if is_on {
                            collab.paula.audio_enable_dma(ch as u8);
                        } else {
                            collab.paula.audio_disable_dma(ch as u8);
                        }
                    }
                }

                if old & DMACON_COPEN == 0 && self.dmacon & DMACON_COPEN != 0 {
                    self.scheduler.cop.schedule_rel(self.clock, TICKS_PER_DMA_CYCLE, CopEvent::ReqDma, 0);
                }
            }
            a if (0x180..=0x1BE).contains(&a) => {
                collab.denise.record_color_change(a, value, 4 * self.h);
            }
            ADDR_BPLCON0 => self.bplcon0 = value,
            ADDR_DIWSTRT => self.post_delayed(RegEffect::DiwStrt(value)),
            ADDR_DIWSTOP => self.post_delayed(RegEffect::DiwStop(value)),
            ADDR_DDFSTRT => self.post_delayed(RegEffect::DdfStrt(value)),
            ADDR_DDFSTOP => self.post_delayed(RegEffect::DdfStop(value)),
            ADDR_BPL1MOD => self.post_delayed(RegEffect::Bpl1Mod(value as i16)),
            ADDR_BPL2MOD => self.post_delayed(RegEffect::Bpl2Mod(value as i16)),
            ADDR_DSKPTH => self.dskpt = (self.dskpt & 0xFFFF) | (u32::from(value & 0x7) << 16),
            ADDR_DSKPTL => self.dskpt = (self.dskpt & 0x7_0000) | u32::from(value & 0xFFFE),
            ADDR_COPCON => self.copper.cdang = value & 0x0002 != 0,
            ADDR_COPJMP1 => self.scheduler.cop.schedule_rel(self.clock, TICKS_PER_DMA_CYCLE, CopEvent::Jmp1, 0),
            ADDR_COPJMP2 => self.scheduler.cop.schedule_rel(self.clock, TICKS_PER_DMA_CYCLE, CopEvent::Jmp2, 0),
            ADDR_COP1LCH => self.copper.cop1lc = (self.copper.cop1lc & 0xFFFF) | (u32::from(value) << 16),
            ADDR_COP1LCL => self.copper.cop1lc = (self.copper.cop1lc & 0x7_0000) | u32::from(value & 0xFFFE),
            ADDR_COP2LCH => self.copper.cop2lc = (self.copper.cop2lc & 0xFFFF) | (u32::from(value) << 16),
            ADDR_COP2LCL => self.copper.cop2lc = (self.copper.cop2lc & 0x7_0000) | u32::from(value & 0xFFFE),
            ADDR_COPINS => self.copper.cop1ins = value,
            a if (ADDR_BPL1PTH..ADDR_BPL1PTH + 24).contains(&a) => {
                let offset = a - ADDR_BPL1PTH;
                let plane = (offset / 4) as u8;
                if offset.is_multiple_of(4) {
                    self.post_delayed(RegEffect::BplPtHi(plane, value));
                } else {
                    self.post_delayed(RegEffect::BplPtLo(plane, value));
                }
            }
            a if (ADDR_SPR0PTH..ADDR_SPR0PTH + 32).contains(&a) => {
                let offset = a - ADDR_SPR0PTH;
                let ch = (offset / 4) as usize;
                if offset.is_multiple_of(4) {
                    self.sprpt[ch] = (self.sprpt[ch] & 0xFFFF) | (u32::from(value & 0x7) << 16);
                } else {
                    self.sprpt[ch] = (self.sprpt[ch] & 0x7_0000) | u32::from(value & 0xFFFE);
                }
            }
            _ => {}
        }
    }

    #[must_use]
    pub fn peek_chip(&self, addr: u16, collab: &Collaborators) -> Option<u16> {
        match addr {
            ADDR_DMACONR => {
                let mut result = self.dmacon;
                if collab.blitter.is_busy() {
                    result |= 1 << 14;
                }
                if collab.blitter.is_zero() {
                    result |= 1 << 13;
                }
                Some(result)
            }
            ADDR_VPOSR => {
                let lof = u16::from(self.frame.long_frame) << 15;
                Some(lof | (self.v >> 8))
            }
            ADDR_VHPOSR => Some((self.v << 8) | (self.h & 0xFF)),
            _ => None,
        }
    }

    pub(crate) fn write_persistent(&self, w: &mut Writer) {
        write_slot(w, &self.scheduler.reg, reg_event_tag);
        write_slot(w, &self.scheduler.ciaa, cia_event_tag);
        write_slot(w, &self.scheduler.ciab, cia_event_tag);
        write_slot(w, &self.scheduler.bpl, dma_event_tag);
        write_slot(w, &self.scheduler.das, das_event_tag);
        write_slot(w, &self.scheduler.cop, cop_event_tag);
        write_slot(w, &self.scheduler.blt, blt_event_tag);
        write_slot(w, &self.scheduler.sec, sec_event_tag);

        w.u64(self.clock);

        w.u64(self.frame.nr);
        w.bool(self.frame.interlaced);
        w.u16(self.frame.num_lines);
        w.bool(self.frame.long_frame);

        w.u16(self.v);
        w.u16(self.h);

        w.u16(self.ddfstrt);
        w.u16(self.ddfstop);
        w.u16(self.diwstrt);
        w.u16(self.diwstop);
        w.i32(self.diw_vstrt);
        w.i32(self.diw_vstop);
        w.i32(self.diw_hstrt);
        w.i32(self.diw_hstop);
        w.bool(self.v_flop);

        w.u16(self.dmacon);
        w.u16(self.bplcon0);
        w.u8(self.num_bitplanes());

        w.u32(self.dskpt);
        for &a in &self.audlc {
            w.u32(a);
        }
        for &p in &self.bplpt {
            w.u32(p);
        }
        w.i16(self.bpl1mod);
        w.i16(self.bpl2mod);

        for &p in &self.sprpt {
            w.u32(p);
        }
        for &s in &self.spr_vstrt {
            w.u16(s);
        }
        for &s in &self.spr_vstop {
            w.u16(s);
        }
        for s in &self.spr_dma_state {
            w.u8(match s {
                SpriteDmaState::Idle => 0,
                SpriteDmaState::Data => 1,
            });
        }

        for &e in &self.dma_table.dma_event {
            w.u8(dma_event_tag(e));
        }
        for &n in &self.dma_table.next_dma_event {
            w.u8(n);
        }
        w.u8(self.dma_table.dma_first_bpl1_event);
        w.u8(self.dma_table.dma_last_bpl1_event);

        w.u8(self.das_idx as u8);

        w.u16(self.reg_queue.len() as u16);
        for change in &self.reg_queue {
            w.u64(change.when);
            let (tag, a, b) = reg_effect_encode(change.effect);
            w.u8(tag);
            w.u16(a);
            w.u16(b);
        }

        w.u8(copper_state_tag(self.copper.state));
        w.u32(self.copper.coppc);
        w.u32(self.copper.cop1lc);
        w.u32(self.copper.cop2lc);
        w.u32(self.copper.cop1end);
        w.u32(self.copper.cop2end);
        w.u16(self.copper.cop1ins);
        w.u16(self.copper.cop2ins);
        w.bool(self.copper.cdang);
        w.bool(self.copper.skip);
        w.bool(self.copper.servicing);
    }

    pub(crate) fn read_persistent(&mut self, r: &mut Reader) -> Result<(), SnapshotError> {
        self.scheduler.reg = read_slot(r, reg_event_from_tag)?;
        self.scheduler.ciaa = read_slot(r, cia_event_from_tag)?;
        self.scheduler.ciab = read_slot(r, cia_event_from_tag)?;
        self.scheduler.bpl = read_slot(r, dma_event_from_tag)?;
        self.scheduler.das = read_slot(r, das_event_from_tag)?;
        self.scheduler.cop = read_slot(r, cop_event_from_tag)?;
        self.scheduler.blt = read_slot(r, blt_event_from_tag)?;
        self.scheduler.sec = read_slot(r, sec_event_from_tag)?;

        self.clock = r.u64()?;

        self.frame.nr = r.u64()?;
        self.frame.interlaced = r.bool()?;
        self.frame.num_lines = r.u16()?;
        self.frame.long_frame = r.bool()?;

        self.v = r.u16()?;
        self.h = r.u16()?;

        self.ddfstrt = r.u16()?;
        self.ddfstop = r.u16()?;
        self.diwstrt = r.u16()?;
        self.diwstop = r.u16()?;
        self.diw_vstrt = r.i32()?;
        self.diw_vstop = r.i32()?;
        self.diw_hstrt = r.i32()?;
        self.diw_hstop = r.i32()?;
        self.v_flop = r.bool()?;

        self.dmacon = r.u16()?;
        self.bplcon0 = r.u16()?;
        let _active_bitplanes = r.u8()?;

        self.dskpt = r.u32()?;
        for a in &mut self.audlc {
            *a = r.u32()?;
        }
        for p in &mut self.bplpt {
            *p = r.u32()?;
        }
        self.bpl1mod = r.i16()?;
        self.bpl2mod = r.i16()?;

        for p in &mut self.sprpt {
            *p = r.u32()?;
        }
        for s in &mut self.spr_vstrt {
            *s = r.u16()?;
        }
        for s in &mut self.spr_vstop {
            *s = r.u16()?;
        }
        for s in &mut self.spr_dma_state {
            *s = if r.u8()? == 0 { SpriteDmaState::Idle } else { SpriteDmaState::Data };
        }

        for e in &mut self.dma_table.dma_event {
            *e = dma_event_from_tag(r.u8()?);
        }
        for n in &mut self.dma_table.next_dma_event {
            *n = r.u8()?;
        }
        self.dma_table.dma_first_bpl1_event = r.u8()?;
        self.dma_table.dma_last_bpl1_event = r.u8()?;

        self.das_idx = r.u8()? as usize;

        let n_changes = r.u16()?;
        self.reg_queue.clear();
        for _ in 0..n_changes {
            let when = r.u64()?;
            let tag = r.u8()?;
            let a = r.u16()?;
            let b = r.u16()?;
            self.reg_queue.push(QueuedChange { when, effect: reg_effect_decode(tag, a, b) });
        }

        self.copper.state = copper_state_from_tag(r.u8()?);
        self.copper.coppc = r.u32()?;
        self.copper.cop1lc = r.u32()?;
        self.copper.cop2lc = r.u32()?;
        self.copper.cop1end = r.u32()?;
        self.copper.cop2end = r.u32()?;
        self.copper.cop1ins = r.u16()?;
        self.copper.cop2ins = r.u16()?;
        self.copper.cdang = r.bool()?;
        self.copper.skip = r.bool()?;
        self.copper.servicing = r.bool()?;

        Ok(())
    }
}

fn write_slot<T: Copy, F: Fn(T) -> u8>(w: &mut Writer, slot: &crate::scheduler::Slot<T>, tag: F) {
    w.u64(slot.trigger);
    w.u8(tag(slot.id));
    w.i32(slot.data as i32);
}

fn read_slot<T: Copy, F: Fn(u8) -> T>(r: &mut Reader, from_tag: F) -> Result<crate::scheduler::Slot<T>, SnapshotError> {
    let trigger = r.u64()?;
    let id = from_tag(r.u8()?);
    let data = i64::from(r.i32()?);
    Ok(crate::scheduler::Slot { trigger, id, data })
}

fn reg_event_tag(_e: RegEvent) -> u8 {
    0
}
fn reg_event_from_tag(_t: u8) -> RegEvent {
    RegEvent::ApplyNext
}

fn cia_event_tag(_e: CiaEvent) -> u8 {
    0
}
fn cia_event_from_tag(_t: u8) -> CiaEvent {
    CiaEvent::Tod
}

fn dma_event_tag(e: DmaEvent) -> u8 {
    match e {
        DmaEvent::None => 0,
        DmaEvent::BplL1 => 1,
        DmaEvent::BplL2 => 2,
        DmaEvent::BplL3 => 3,
        DmaEvent::BplL4 => 4,
        DmaEvent::BplL5 => 5,
        DmaEvent::BplL6 => 6,
        DmaEvent::BplH1 => 7,
        DmaEvent::BplH2 => 8,
        DmaEvent::BplH3 => 9,
        DmaEvent::BplH4 => 10,
        DmaEvent::BplSr => 11,
        DmaEvent::BplEol => 12,
    }
}
fn dma_event_from_tag(t: u8) -> DmaEvent {
    match t {
        1 => DmaEvent::BplL1,
        2 => DmaEvent::BplL2,
        3 => DmaEvent::BplL3,
        4 => DmaEvent::BplL4,
        5 => DmaEvent::BplL5,
        6 => DmaEvent::BplL6,
        7 => DmaEvent::BplH1,
        8 => DmaEvent::BplH2,
        9 => DmaEvent::BplH3,
        10 => DmaEvent::BplH4,
        11 => DmaEvent::BplSr,
        12 => DmaEvent::BplEol,
        _ => DmaEvent::None,
    }
}

fn das_event_tag(e: DasEvent) -> u8 {
    match e {
        DasEvent::Refresh => 0,
        DasEvent::Disk(_) => 1,
        DasEvent::Audio(_) => 2,
        DasEvent::Sprite(_, _) => 3,
    }
}
fn das_event_from_tag(t: u8) -> DasEvent {
    match t {
        1 => DasEvent::Disk(0),
        2 => DasEvent::Audio(0),
        3 => DasEvent::Sprite(0, 0),
        _ => DasEvent::Refresh,
    }
}

fn cop_event_tag(e: CopEvent) -> u8 {
    match e {
        CopEvent::ReqDma => 0,
        CopEvent::Fetch => 1,
        CopEvent::Move => 2,
        CopEvent::WaitSkip => 3,
        CopEvent::Jmp1 => 4,
        CopEvent::Jmp2 => 5,
        CopEvent::WaitBlit => 6,
        CopEvent::Vblank => 7,
    }
}
fn cop_event_from_tag(t: u8) -> CopEvent {
    match t {
        1 => CopEvent::Fetch,
        2 => CopEvent::Move,
        3 => CopEvent::WaitSkip,
        4 => CopEvent::Jmp1,
        5 => CopEvent::Jmp2,
        6 => CopEvent::WaitBlit,
        7 => CopEvent::Vblank,
        _ => CopEvent::ReqDma,
    }
}

fn blt_event_tag(e: BltEvent) -> u8 {
    match e {
        BltEvent::Service => 0,
        BltEvent::Finished => 1,
    }
}
fn blt_event_from_tag(t: u8) -> BltEvent {
    if t == 1 { BltEvent::Finished } else { BltEvent::Service }
}

fn sec_event_tag(e: SecEvent) -> u8 {
    match e {
        SecEvent::Gate => 0,
        SecEvent::Channel(_) => 1,
        SecEvent::Disk => 2,
        SecEvent::DiskChange => 3,
        SecEvent::Vbl => 4,
        SecEvent::Irq => 5,
        SecEvent::Ipl => 6,
        SecEvent::Keyboard => 7,
        SecEvent::Txd => 8,
        SecEvent::Rxd => 9,
        SecEvent::Potentiometer => 10,
        SecEvent::Inspector => 11,
    }
}
fn sec_event_from_tag(t: u8) -> SecEvent {
    match t {
        1 => SecEvent::Channel(0),
        2 => SecEvent::Disk,
        3 => SecEvent::DiskChange,
        4 => SecEvent::Vbl,
        5 => SecEvent::Irq,
        6 => SecEvent::Ipl,
        7 => SecEvent::Keyboard,
        8 => SecEvent::Txd,
        9 => SecEvent::Rxd,
        10 => SecEvent::Potentiometer,
        11 => SecEvent::Inspector,
        _ => SecEvent::Gate,
    }
}

fn copper_state_tag(s: CopperState) -> u8 {
    match s {
        CopperState::Idle => 0,
        CopperState::ReqDma => 1,
        CopperState::Fetch => 2,
        CopperState::Move => 3,
        CopperState::WaitSkip => 4,
        CopperState::WaitBlit => 5,
    }
}
fn copper_state_from_tag(t: u8) -> CopperState {
    match t {
        1 => CopperState::ReqDma,
        2 => CopperState::Fetch,
        3 => CopperState::Move,
        4 => CopperState::WaitSkip,
        5 => CopperState::WaitBlit,
        _ => CopperState::Idle,
    }
}

fn reg_effect_encode(effect: RegEffect) -> (u8, u16, u16) {
    match effect {
        RegEffect::DiwStrt(v) => (0, v, 0),
        RegEffect::DiwStop(v) => (1, v, 0),
        RegEffect::DdfStrt(v) => (2, v, 0),
        RegEffect::DdfStop(v) => (3, v, 0),
        RegEffect::Bpl1Mod(v) => (4, v as u16, 0),
        RegEffect::Bpl2Mod(v) => (5, v as u16, 0),
        RegEffect::BplPtHi(plane, hi) => (6, u16::from(plane), hi),
        RegEffect::BplPtLo(plane, lo) => (7, u16::from(plane), lo),
    }
}
fn reg_effect_decode(tag: u8, a: u16, b: u16) -> RegEffect {
    match tag {
        0 => RegEffect::DiwStrt(a),
        1 => RegEffect::DiwStop(a),
        2 => RegEffect::DdfStrt(a),
        3 => RegEffect::DdfStop(a),
        4 => RegEffect::Bpl1Mod(a as i16),
        5 => RegEffect::Bpl2Mod(a as i16),
        6 => RegEffect::BplPtHi(a as u8, b),
        _ => RegEffect::BplPtLo(a as u8, b),
    }
}

impl Observable for Agnus {
    fn query(&self, path: &str) -> Option<Value> {
        match path {
            "beam.v" => Some(Value::U16(self.v)),
            "beam.h" => Some(Value::U16(self.h)),
            "frame.nr" => Some(Value::U64(self.frame.nr)),
            "frame.longFrame" => Some(Value::Bool(self.frame.long_frame)),
            "dma.dmacon" => Some(Value::U16(self.dmacon)),
            "dma.activeBitplanes" => Some(Value::U8(self.num_bitplanes())),
            "copper.state" => Some(Value::String(format!("{:?}", self.copper.state))),
            "copper.coppc" => Some(Value::U32(self.copper.coppc)),
            "warnings.clockRegressions" => Some(Value::U64(self.clock_regressions)),
            _ => None,
        }
    }

    fn query_paths(&self) -> &'static [&'static str] {
        QUERY_PATHS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::test_doubles::{FlatChipRam, NullBlitter, NullCia, NullPaula, RecordingDenise};

    #[test]
    fn diwstrt_write_is_delayed_two_dma_cycles() {
        let mut agnus = Agnus::new(AgnusConfig::default());
        let mut ram = FlatChipRam::new(0x10000);
        let mut denise = RecordingDenise::default();
        let mut paula = NullPaula::default();
        let mut cia_a = NullCia;
        let mut cia_b = NullCia;
        let mut blitter = NullBlitter::default();
        let mut collab = Collaborators {
            chip_ram: &mut ram,
            denise: &mut denise,
            paula: &mut paula,
            cia_a: &mut cia_a,
            cia_b: &mut cia_b,
            blitter: &mut blitter,
        };

        agnus.poke_chip(ADDR_DIWSTRT, 0x2C81, RegisterSource::Cpu, &mut collab);
        assert_eq!(agnus.diwstrt, 0);
        agnus.execute_until(Ticks(REG_DELAY_TICKS - TICKS_PER_DMA_CYCLE), &mut collab);
        assert_eq!(agnus.diwstrt, 0, "effect not yet applied before the delay elapses");
        agnus.execute_until(Ticks(REG_DELAY_TICKS + TICKS_PER_DMA_CYCLE), &mut collab);
        assert_eq!(agnus.diwstrt, 0x2C81);
    }

    #[test]
    fn dmacon_master_disable_clears_das_mask() {
        let mut agnus = Agnus::new(AgnusConfig::default());
        agnus.dmacon = DMACON_DMAEN | DMACON_DSKEN;
        assert_eq!(agnus.das_mask() & das_table::DSKEN, das_table::DSKEN);
        agnus.dmacon = DMACON_DSKEN;
        assert_eq!(agnus.das_mask(), 0);
    }

    #[test]
    fn num_bitplanes_reads_bplcon0_bpu_field() {
        let mut agnus = Agnus::new(AgnusConfig::default());
        agnus.bplcon0 = 4 << BPLCON0_BPU_SHIFT;
        assert_eq!(agnus.num_bitplanes(), 4);
    }

    #[test]
    fn bplxpt_write_is_lost_when_fetch_lands_on_the_following_cycle() {
        let mut agnus = Agnus::new(AgnusConfig::default());
        agnus.bplpt[0] = 0x1000;
        agnus.dma_table.dma_event = [DmaEvent::None; SLOTS_PER_LINE];
        agnus.h = 0x10;
        agnus.dma_table.dma_event[0x11] = DmaEvent::BplL1;
        assert!(agnus.bplxpt_write_is_lost(0));
        agnus.apply_reg_effect(RegEffect::BplPtHi(0, 0x0007));
        assert_eq!(agnus.bplpt[0], 0x1000, "the write is lost, pointer unchanged");
    }

    #[test]
    fn bplxpt_write_applies_when_not_contended() {
        let mut agnus = Agnus::new(AgnusConfig::default());
        agnus.bplpt[0] = 0x1000;
        agnus.dma_table.dma_event = [DmaEvent::None; SLOTS_PER_LINE];
        agnus.h = 0x10;
        assert!(!agnus.bplxpt_write_is_lost(0));
        agnus.apply_reg_effect(RegEffect::BplPtHi(0, 0x0007));
        assert_eq!(agnus.bplpt[0], 0x7_1000, "high word changes, low word is preserved");
    }

    #[test]
    fn bitplane_dma_is_gated_by_vflop_and_line_range() {
        let mut agnus = Agnus::new(AgnusConfig::default());
        agnus.bplcon0 = 2 << BPLCON0_BPU_SHIFT;
        agnus.dmacon = DMACON_DMAEN | DMACON_BPLEN;
        agnus.v_flop = true;
        agnus.v = 10;
        assert!(!agnus.bitplane_dma_on(), "outside the visible vertical range");
        agnus.v = 100;
        assert!(agnus.bitplane_dma_on());
        agnus.v_flop = false;
        assert!(!agnus.bitplane_dma_on());
    }

    #[test]
    fn copper_move_to_bplcon0_lands_through_poke_chip() {
        let mut agnus = Agnus::new(AgnusConfig::default());
        let mut ram = FlatChipRam::new(0x10000);
        ram.0[0x2000 / 2] = 0x0100; // MOVE BPLCON0
        ram.0[0x2002 / 2] = 0x2200; // 2 bitplanes, hires off
        agnus.copper.cop1lc = 0x2000;
        agnus.copper.jump(1);
        agnus.scheduler.cop.schedule_rel(agnus.clock, TICKS_PER_DMA_CYCLE, CopEvent::ReqDma, 0);
        agnus.dmacon = DMACON_DMAEN | DMACON_COPEN;

        let mut denise = RecordingDenise::default();
        let mut paula = NullPaula::default();
        let mut cia_a = NullCia;
        let mut cia_b = NullCia;
        let mut blitter = NullBlitter::default();
        let mut collab = Collaborators {
            chip_ram: &mut ram,
            denise: &mut denise,
            paula: &mut paula,
            cia_a: &mut cia_a,
            cia_b: &mut cia_b,
            blitter: &mut blitter,
        };
        agnus.execute_until(Ticks(TICKS_PER_DMA_CYCLE * 4), &mut collab);

        assert_eq!(agnus.bplcon0, 0x2200);
        assert_eq!(agnus.num_bitplanes(), 2);
    }

    #[test]
    fn copper_move_to_illegal_register_stops_without_reaching_poke_chip() {
        let mut agnus = Agnus::new(AgnusConfig::default());
        let mut ram = FlatChipRam::new(0x10000);
        ram.0[0x2000 / 2] = 0x006E; // illegal register (< 0x80, cdang false)
        ram.0[0x2002 / 2] = 0x1234;
        agnus.copper.cop1lc = 0x2000;
        agnus.copper.jump(1);
        agnus.scheduler.cop.schedule_rel(agnus.clock, TICKS_PER_DMA_CYCLE, CopEvent::ReqDma, 0);
        agnus.dmacon = DMACON_DMAEN | DMACON_COPEN;

        let mut denise = RecordingDenise::default();
        let mut paula = NullPaula::default();
        let mut cia_a = NullCia;
        let mut cia_b = NullCia;
        let mut blitter = NullBlitter::default();
        let mut collab = Collaborators {
            chip_ram: &mut ram,
            denise: &mut denise,
            paula: &mut paula,
            cia_a: &mut cia_a,
            cia_b: &mut cia_b,
            blitter: &mut blitter,
        };
        agnus.execute_until(Ticks(TICKS_PER_DMA_CYCLE * 4), &mut collab);

        assert_eq!(agnus.copper.state, CopperState::Idle);
        assert_eq!(agnus.bplcon0, 0);
    }

    #[test]
    fn copper_wait_parks_until_the_target_line_instead_of_resolving_in_two_cycles() {
        let mut agnus = Agnus::new(AgnusConfig::default());
        let mut ram = FlatChipRam::new(0x10000);
        // WAIT for v=5, h=0 under a full mask with BFD set (ignore blitter),
        // then MOVE to BPLCON0 so we have something observable to check.
        ram.0[0x2000 / 2] = (5u16 << 8) | 1; // cop1ins: VP=5 HP=0, WAIT form
        ram.0[0x2002 / 2] = 0xFFFE; // cop2ins: VM=0x7F HM=0xFE BFD=1
        ram.0[0x2004 / 2] = 0x0100; // MOVE BPLCON0
        ram.0[0x2006 / 2] = 0x1200;
        agnus.copper.cop1lc = 0x2000;
        agnus.copper.jump(1);
        agnus.scheduler.cop.schedule_rel(agnus.clock, TICKS_PER_DMA_CYCLE, CopEvent::ReqDma, 0);
        agnus.dmacon = DMACON_DMAEN | DMACON_COPEN;

        let mut denise = RecordingDenise::default();
        let mut paula = NullPaula::default();
        let mut cia_a = NullCia;
        let mut cia_b = NullCia;
        let mut blitter = NullBlitter::default();
        let mut collab = Collaborators {
            chip_ram: &mut ram,
            denise: &mut denise,
            paula: &mut paula,
            cia_a: &mut cia_a,
            cia_b: &mut cia_b,
            blitter: &mut blitter,
        };

        // Well short of line 5: the WAIT must not have resolved yet.
        agnus.execute_until(Ticks(TICKS_PER_DMA_CYCLE * 40), &mut collab);
        assert_eq!(agnus.bplcon0, 0, "WAIT resolved long before the beam reached its target line");
        assert_ne!(agnus.copper.state, CopperState::Idle);

        // Comfortably past line 5: now it should have fired.
        agnus.execute_until(Ticks(TICKS_PER_DMA_CYCLE * u64::from(SLOTS_PER_LINE as u16) * 6), &mut collab);
        assert_eq!(agnus.bplcon0, 0x1200);
    }

    #[test]
    fn copper_stays_parked_while_copper_dma_is_disabled() {
        let mut agnus = Agnus::new(AgnusConfig::default());
        let mut ram = FlatChipRam::new(0x10000);
        ram.0[0x2000 / 2] = 0x0100; // MOVE BPLCON0
        ram.0[0x2002 / 2] = 0x2200;
        agnus.copper.cop1lc = 0x2000;
        agnus.copper.jump(1);
        agnus.scheduler.cop.schedule_rel(agnus.clock, TICKS_PER_DMA_CYCLE, CopEvent::ReqDma, 0);
        agnus.dmacon = DMACON_DMAEN; // COPEN left off: can_run must refuse

        let mut denise = RecordingDenise::default();
        let mut paula = NullPaula::default();
        let mut cia_a = NullCia;
        let mut cia_b = NullCia;
        let mut blitter = NullBlitter::default();
        let mut collab = Collaborators {
            chip_ram: &mut ram,
            denise: &mut denise,
            paula: &mut paula,
            cia_a: &mut cia_a,
            cia_b: &mut cia_b,
            blitter: &mut blitter,
        };

        agnus.execute_until(Ticks(TICKS_PER_DMA_CYCLE * 20), &mut collab);
        assert_eq!(agnus.copper.state, CopperState::ReqDma, "bus never granted, Copper can't leave ReqDma");
        assert_eq!(agnus.copper.coppc, 0x2000, "no fetch happened without a free DMA cycle");

        agnus.dmacon |= DMACON_COPEN;
        agnus.execute_until(Ticks(TICKS_PER_DMA_CYCLE * 24), &mut collab);
        assert_eq!(agnus.bplcon0, 0x2200, "once DMA is granted the Copper completes the MOVE");
    }

    #[test]
    fn ddfstrt_write_mid_line_rebuilds_dma_table_immediately() {
        let mut agnus = Agnus::new(AgnusConfig::default());
        agnus.bplcon0 = 4 << BPLCON0_BPU_SHIFT;
        agnus.dmacon = DMACON_DMAEN | DMACON_BPLEN;
        agnus.v_flop = true;
        agnus.v = 100;
        agnus.h = 0;
        agnus.ddfstrt = 0x48;
        agnus.ddfstop = 0xD0;
        agnus.dma_table.rebuild(agnus.ddfstrt, agnus.ddfstop, false, 4, true);
        assert_eq!(agnus.dma_table.dma_first_bpl1_event, 0x4F);

        agnus.apply_reg_effect(RegEffect::DdfStrt(0x38));
        assert_eq!(agnus.ddfstrt, 0x38);
        assert_eq!(
            agnus.dma_table.dma_first_bpl1_event, 0x3F,
            "DDFSTRT mid-line write must recompute the table immediately, not at the next hsync"
        );
        assert!(agnus.scheduler.bpl.is_pending(), "the BPL slot is rescheduled against the new window");
    }

    #[test]
    fn colour_register_poke_is_forwarded_to_denise_with_pixel_offset() {
        let mut agnus = Agnus::new(AgnusConfig::default());
        agnus.h = 10;
        let mut ram = FlatChipRam::new(0x10000);
        let mut denise = RecordingDenise::default();
        let mut paula = NullPaula::default();
        let mut cia_a = NullCia;
        let mut cia_b = NullCia;
        let mut blitter = NullBlitter::default();
        let mut collab = Collaborators {
            chip_ram: &mut ram,
            denise: &mut denise,
            paula: &mut paula,
            cia_a: &mut cia_a,
            cia_b: &mut cia_b,
            blitter: &mut blitter,
        };

        agnus.poke_chip(0x182, 0x0FFF, RegisterSource::Cpu, &mut collab);
        assert_eq!(denise.color_changes, vec![(0x182, 0x0FFF, 40)]);
    }

    #[test]
    fn hsync_forwards_first_and_last_canvas_pixel_to_denise() {
        let mut agnus = Agnus::new(AgnusConfig::default());
        agnus.bplcon0 = 4 << BPLCON0_BPU_SHIFT;
        agnus.dmacon = DMACON_DMAEN | DMACON_BPLEN;
        agnus.v_flop = true;
        agnus.v = 99;
        agnus.diw_vstop = -1;
        agnus.ddfstrt = 0x38;
        agnus.ddfstop = 0xD0;

        let mut ram = FlatChipRam::new(0x10000);
        let mut denise = RecordingDenise::default();
        let mut paula = NullPaula::default();
        let mut cia_a = NullCia;
        let mut cia_b = NullCia;
        let mut blitter = NullBlitter::default();
        let mut collab = Collaborators {
            chip_ram: &mut ram,
            denise: &mut denise,
            paula: &mut paula,
            cia_a: &mut cia_a,
            cia_b: &mut cia_b,
            blitter: &mut blitter,
        };

        agnus.hsync(&mut collab);

        assert_eq!(denise.canvas_pixels, vec![(0x3F * 4 + 6, 0xD7 * 4 + 6 + 31)]);
    }

    #[test]
    fn dmacon_poke_notifies_blitter_and_drives_audio_dma_enable() {
        let mut agnus = Agnus::new(AgnusConfig::default());
        agnus.dmacon = DMACON_DMAEN;
        let mut ram = FlatChipRam::new(0x10000);
        let mut denise = RecordingDenise::default();
        let mut paula = NullPaula::default();
        let mut cia_a = NullCia;
        let mut cia_b = NullCia;
        let mut blitter = NullBlitter::default();
        let mut collab = Collaborators {
            chip_ram: &mut ram,
            denise: &mut denise,
            paula: &mut paula,
            cia_a: &mut cia_a,
            cia_b: &mut cia_b,
            blitter: &mut blitter,
        };

        agnus.poke_chip(ADDR_DMACON, 0x8000 | DMACON_AUD[1], RegisterSource::Cpu, &mut collab);
        assert_eq!(blitter.dmacon_calls, vec![(DMACON_DMAEN, DMACON_DMAEN | DMACON_AUD[1])]);
        assert_eq!(paula.dma_enabled, vec![1]);
        assert!(paula.dma_disabled.is_empty());

        let mut collab = Collaborators {
            chip_ram: &mut ram,
            denise: &mut denise,
            paula: &mut paula,
            cia_a: &mut cia_a,
            cia_b: &mut cia_b,
            blitter: &mut blitter,
        };
        agnus.poke_chip(ADDR_DMACON, DMACON_AUD[1], RegisterSource::Cpu, &mut collab);
        assert_eq!(paula.dma_disabled, vec![1]);
    }

    #[test]
    fn dmacon_read_reflects_blitter_busy_and_zero_flags() {
        let mut agnus = Agnus::new(AgnusConfig::default());
        agnus.dmacon = DMACON_DMAEN;
        let mut ram = FlatChipRam::new(0x10000);
        let mut denise = RecordingDenise::default();
        let mut paula = NullPaula::default();
        let mut cia_a = NullCia;
        let mut cia_b = NullCia;
        let mut blitter = NullBlitter { busy: true, zero: true, dmacon_calls: Vec::new() };
        let collab = Collaborators {
            chip_ram: &mut ram,
            denise: &mut denise,
            paula: &mut paula,
            cia_a: &mut cia_a,
            cia_b: &mut cia_b,
            blitter: &mut blitter,
        };

        let result = agnus.peek_chip(ADDR_DMACONR, &collab).expect("DMACONR is always readable");
        assert_eq!(result & (1 << 14), 1 << 14, "blitter busy bit");
        assert_eq!(result & (1 << 13), 1 << 13, "blitter zero bit");
    }
}
