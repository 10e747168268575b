//! Disk/Audio/Sprite DMA schedule: fixed horizontal positions, gated by the
//! DMA-enable mask. Precomputed once per mask so the arbiter never rescans
//! the fixed position list while stepping through a line.

use crate::scheduler::DasEvent;

pub const DMAEN: u16 = 1 << 0;
pub const DSKEN: u16 = 1 << 1;
pub const AU0EN: u16 = 1 << 2;
pub const AU1EN: u16 = 1 << 3;
pub const AU2EN: u16 = 1 << 4;
pub const AU3EN: u16 = 1 << 5;
pub const SPREN: u16 = 1 << 6;

const MASK_BITS: u32 = 7;
const MASK_COMBINATIONS: usize = 1 << MASK_BITS;

/// A fixed DAS position: horizontal cycle, event identity, and which mask
/// bit(s) gate it.
struct FixedSlot {
    h: u8,
    event: DasEvent,
    gate: u16,
}

fn fixed_slots() -> Vec<FixedSlot> {
    let mut slots = vec![FixedSlot { h: 0x01, event: DasEvent::Refresh, gate: DMAEN }];
    for (i, h) in [0x07u8, 0x09, 0x0B].into_iter().enumerate() {
        slots.push(FixedSlot { h, event: DasEvent::Disk(i as u8), gate: DMAEN | DSKEN });
    }
    for (i, (h, gate)) in [(0x0Du8, AU0EN), (0x0F, AU1EN), (0x11, AU2EN), (0x13, AU3EN)]
        .into_iter()
        .enumerate()
    {
        slots.push(FixedSlot { h, event: DasEvent::Audio(i as u8), gate: DMAEN | gate });
    }
    for ch in 0..8u8 {
        let base = 0x15 + ch * 2;
        slots.push(FixedSlot { h: base, event: DasEvent::Sprite(ch, 0), gate: DMAEN | SPREN });
        slots.push(FixedSlot { h: base + 1, event: DasEvent::Sprite(ch, 1), gate: DMAEN | SPREN });
    }
    slots.sort_by_key(|s| s.h);
    slots
}

/// `nextDASEvent[id][mask]` / `nextDASDelay[id][mask]`: given the DAS event
/// currently being serviced and the DMA-enable mask, the next enabled DAS
/// event and its delay in DMA cycles.
pub struct DasTable {
    positions: Vec<FixedSlot>,
    #[allow(dead_code)] // mirrored by next_index; kept so next() stays available for tests
    next_event: Vec<Vec<DasEvent>>,
    next_index: Vec<Vec<usize>>,
    next_delay: Vec<Vec<u8>>,
}

impl DasTable {
    #[must_use]
    pub fn build() -> Self {
        let positions = fixed_slots();
        let n = positions.len();
        let mut next_event = vec![vec![DasEvent::Refresh; MASK_COMBINATIONS]; n];
        let mut next_index = vec![vec![0usize; MASK_COMBINATIONS]; n];
        let mut next_delay = vec![vec![0u8; MASK_COMBINATIONS]; n];

        for mask in 0..MASK_COMBINATIONS as u16 {
            let enabled: Vec<usize> = (0..n)
                .filter(|&i| positions[i].gate & mask == positions[i].gate)
                .collect();
            if enabled.is_empty() {
                continue;
            }
            for (rank, &i) in enabled.iter().enumerate() {
                let next_rank = (rank + 1) % enabled.len();
                let next_i = enabled[next_rank];
                next_event[i][mask as usize] = positions[next_i].event;
                next_index[i][mask as usize] = next_i;
                let delay = if next_rank == 0 {
                    (228 - positions[i].h as i16 + positions[next_i].h as i16) as u8
                } else {
                    positions[next_i].h - positions[i].h
                };
                next_delay[i][mask as usize] = delay;
            }
        }

        Self { positions, next_event, next_index, next_delay }
    }

    #[must_use]
    #[allow(dead_code)] // event-only lookup; agnus.rs uses next_with_index instead
    pub fn next(&self, current_idx: usize, mask: u16) -> (DasEvent, u8) {
        let mask = mask & ((1 << MASK_BITS) - 1);
        (self.next_event[current_idx][mask as usize], self.next_delay[current_idx][mask as usize])
    }

    /// Like [`Self::next`] but also returns the fixed-slot index, so the
    /// caller doesn't need to re-search the position list by event identity.
    #[must_use]
    pub fn next_with_index(&self, current_idx: usize, mask: u16) -> (usize, u8) {
        let mask = mask & ((1 << MASK_BITS) - 1);
        (self.next_index[current_idx][mask as usize], self.next_delay[current_idx][mask as usize])
    }

    #[must_use]
    pub fn event_of(&self, idx: usize) -> DasEvent {
        self.positions[idx].event
    }

    #[must_use]
    pub fn h_of(&self, idx: usize) -> u8 {
        self.positions[idx].h
    }

    #[must_use]
    #[allow(dead_code)] // diagnostic accessor, exercised by tests
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    #[must_use]
    #[allow(dead_code)] // diagnostic accessor, pairs with len()
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// First fixed slot enabled under `mask`, if any.
    #[must_use]
    pub fn first_enabled(&self, mask: u16) -> Option<usize> {
        let mask = mask & ((1 << MASK_BITS) - 1);
        (0..self.positions.len()).find(|&i| self.positions[i].gate & mask == self.positions[i].gate)
    }
}
