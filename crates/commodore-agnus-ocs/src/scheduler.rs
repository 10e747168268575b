//! Multi-slot event scheduler.
//!
//! Each named slot holds at most one pending event. `NEVER` marks a slot
//! inactive; schedule/cancel operations never drop an event, they only move
//! or clear a trigger.

/// Sentinel meaning "this slot has no pending event".
pub const NEVER: u64 = u64::MAX;

/// A single pending event: when it fires, and the tagged payload to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot<T> {
    pub trigger: u64,
    pub id: T,
    pub data: i64,
}

impl<T: Copy + Default> Default for Slot<T> {
    fn default() -> Self {
        Self { trigger: NEVER, id: T::default(), data: 0 }
    }
}

impl<T: Copy> Slot<T> {
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.trigger != NEVER
    }

    pub fn schedule_abs(&mut self, when: u64, id: T, data: i64) {
        self.trigger = when;
        self.id = id;
        self.data = data;
    }

    pub fn schedule_rel(&mut self, now: u64, delta: u64, id: T, data: i64) {
        self.schedule_abs(now.saturating_add(delta), id, data);
    }

    /// Advance an already-pending trigger by `delta`. No-op on an inactive slot.
    #[allow(dead_code)] // will be used once blitter-stall rescheduling lands
    pub fn reschedule_inc(&mut self, delta: u64) {
        if self.trigger != NEVER {
            self.trigger = self.trigger.saturating_add(delta);
        }
    }

    pub fn cancel(&mut self) {
        self.trigger = NEVER;
    }

    /// If `trigger` is due in the past relative to `now`, pull it forward to
    /// `now` rather than letting it go missed.
    #[allow(dead_code)] // will be used once blitter-stall rescheduling lands
    pub fn clamp_to(&mut self, now: u64) {
        if self.trigger != NEVER && self.trigger < now {
            self.trigger = now;
        }
    }
}

/// Bitplane/fetch-table event kind, shared between the DMA slot table and the
/// BPL scheduler slot (the slot's `id` names which table entry is due).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DmaEvent {
    #[default]
    None,
    BplL1,
    BplL2,
    BplL3,
    BplL4,
    BplL5,
    BplL6,
    BplH1,
    BplH2,
    BplH3,
    BplH4,
    BplSr,
    BplEol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegEvent {
    #[default]
    ApplyNext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CiaEvent {
    #[default]
    Tod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DasEvent {
    #[default]
    Refresh,
    Disk(u8),
    Audio(u8),
    Sprite(u8, u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CopEvent {
    #[default]
    ReqDma,
    Fetch,
    Move,
    WaitSkip,
    Jmp1,
    Jmp2,
    WaitBlit,
    Vblank,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BltEvent {
    #[default]
    Service,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecEvent {
    #[default]
    Gate,
    Channel(u8),
    Disk,
    DiskChange,
    Vbl,
    Irq,
    Ipl,
    Keyboard,
    Txd,
    Rxd,
    Potentiometer,
    Inspector,
}

/// The full named-slot set. Primary slots drive the per-cycle dispatch order
/// (REG, BPL, DAS, COP, BLT); CIAA/CIAB and SEC carry bookkeeping forwarded to
/// collaborators and secondary housekeeping respectively.
#[derive(Debug, Default)]
pub struct Scheduler {
    pub reg: Slot<RegEvent>,
    pub ciaa: Slot<CiaEvent>,
    pub ciab: Slot<CiaEvent>,
    pub bpl: Slot<DmaEvent>,
    pub das: Slot<DasEvent>,
    pub cop: Slot<CopEvent>,
    pub blt: Slot<BltEvent>,
    pub sec: Slot<SecEvent>,
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `nextTrigger`: the minimum active trigger across every named slot.
    #[must_use]
    #[allow(dead_code)] // exposed for a future skip-ahead fast path in execute_until
    pub fn next_trigger(&self) -> u64 {
        [
            self.reg.trigger,
            self.ciaa.trigger,
            self.ciab.trigger,
            self.bpl.trigger,
            self.das.trigger,
            self.cop.trigger,
            self.blt.trigger,
            self.sec.trigger,
        ]
        .into_iter()
        .min()
        .unwrap_or(NEVER)
    }
}
