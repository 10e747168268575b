//! Per-line DMA slot table: which horizontal cycle gets which bitplane fetch.

use crate::scheduler::DmaEvent;

pub const SLOTS_PER_LINE: usize = 228;
pub const DDF_STOP_CLAMP: u16 = 0xD8;
pub const DDF_WINDOW_CLAMP: u16 = 0xE0;

/// Cycle offsets (within an 8-cycle fetch unit) and the bitplane count needed
/// to activate them, for lores mode.
const LORES_OFFSETS: [(usize, DmaEvent, u8); 6] = [
    (1, DmaEvent::BplL4, 4),
    (2, DmaEvent::BplL6, 6),
    (3, DmaEvent::BplL2, 2),
    (5, DmaEvent::BplL3, 3),
    (6, DmaEvent::BplL5, 5),
    (7, DmaEvent::BplL1, 1),
];

/// Same, for hires mode (each plane fetched twice per unit).
const HIRES_OFFSETS: [(usize, DmaEvent, u8); 8] = [
    (0, DmaEvent::BplH4, 4),
    (4, DmaEvent::BplH4, 4),
    (1, DmaEvent::BplH2, 2),
    (5, DmaEvent::BplH2, 2),
    (2, DmaEvent::BplH3, 3),
    (6, DmaEvent::BplH3, 3),
    (3, DmaEvent::BplH1, 1),
    (7, DmaEvent::BplH1, 1),
];

#[must_use]
pub fn build_bitplane_subtable(hires: bool, bpu: u8) -> [DmaEvent; 8] {
    let mut out = [DmaEvent::None; 8];
    if hires {
        for (idx, ev, need) in HIRES_OFFSETS {
            if bpu >= need {
                out[idx] = ev;
            }
        }
    } else {
        for (idx, ev, need) in LORES_OFFSETS {
            if bpu >= need {
                out[idx] = ev;
            }
        }
    }
    out
}

/// Compute `(dmaStrt, dmaStop)` for the given mode from `DDFSTRT`/`DDFSTOP`.
#[must_use]
pub fn compute_ddf_window(ddfstrt: u16, ddfstop: u16, hires: bool) -> (u16, u16) {
    let dma_strt_hires = ddfstrt;
    let lores_shift = ddfstrt & 0b100;
    let dma_strt_lores = ddfstrt + lores_shift;
    let strt = if hires { dma_strt_hires } else { dma_strt_lores };
    let stop_clamped = ddfstop.min(DDF_STOP_CLAMP);
    let fetch_units = (stop_clamped.saturating_sub(strt) + 15) >> 3;
    let stop = (strt + 8 * fetch_units).min(DDF_WINDOW_CLAMP);
    (strt, stop)
}

#[derive(Debug, Clone)]
pub struct DmaTable {
    pub dma_event: [DmaEvent; SLOTS_PER_LINE],
    pub next_dma_event: [u8; SLOTS_PER_LINE],
    pub dma_first_bpl1_event: u8,
    pub dma_last_bpl1_event: u8,
}

impl Default for DmaTable {
    fn default() -> Self {
        Self {
            dma_event: [DmaEvent::None; SLOTS_PER_LINE],
            next_dma_event: [0; SLOTS_PER_LINE],
            dma_first_bpl1_event: 0,
            dma_last_bpl1_event: 0,
        }
    }
}

impl DmaTable {
    /// Rebuild the whole 228-entry table for one line. `bitplane_dma_on`
    /// gates whether the bitplane sub-table is stamped into the window at
    /// all (the vFlop/numLines/activeBitplanes/DMACON gate from the data
    /// model).
    pub fn rebuild(&mut self, ddfstrt: u16, ddfstop: u16, hires: bool, bpu: u8, bitplane_dma_on: bool) {
        self.dma_event = [DmaEvent::None; SLOTS_PER_LINE];
        self.dma_first_bpl1_event = 0;
        self.dma_last_bpl1_event = 0;

        if bitplane_dma_on && bpu > 0 {
            let (strt, stop) = compute_ddf_window(ddfstrt, ddfstop, hires);
            let subtable = build_bitplane_subtable(hires, bpu);
            let first_plane_1 = if hires { DmaEvent::BplH1 } else { DmaEvent::BplL1 };

            let mut h = strt;
            while h < stop && (h as usize) < SLOTS_PER_LINE {
                for (offset, event) in subtable.iter().enumerate() {
                    let slot = h as usize + offset;
                    if slot >= SLOTS_PER_LINE || *event == DmaEvent::None {
                        continue;
                    }
                    self.dma_event[slot] = *event;
                    if *event == first_plane_1 {
                        if self.dma_first_bpl1_event == 0 {
                            self.dma_first_bpl1_event = slot as u8;
                        }
                        self.dma_last_bpl1_event = slot as u8;
                    }
                }
                h += 8;
            }
        }

        self.update_jump_table();
    }

    /// First populated slot in the line, if any.
    #[must_use]
    pub fn first_event_index(&self) -> Option<u8> {
        (0..SLOTS_PER_LINE).find(|&h| self.dma_event[h] != DmaEvent::None).map(|h| h as u8)
    }

    /// Right-to-left sweep filling `nextDmaEvent[h]` with the smallest
    /// `h' > h` whose event is not `NONE`, or 0 if there is none.
    pub fn update_jump_table(&mut self) {
        let mut next_idx: u8 = 0;
        for h in (0..SLOTS_PER_LINE).rev() {
            self.next_dma_event[h] = next_idx;
            if self.dma_event[h] != DmaEvent::None {
                next_idx = h as u8;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lores_4bpl_subtable_matches_offsets() {
        let sub = build_bitplane_subtable(false, 4);
        assert_eq!(
            sub,
            [
                DmaEvent::None,
                DmaEvent::BplL4,
                DmaEvent::None,
                DmaEvent::BplL2,
                DmaEvent::None,
                DmaEvent::BplL3,
                DmaEvent::None,
                DmaEvent::BplL1,
            ]
        );
    }

    #[test]
    fn hires_2bpl_subtable_matches_offsets() {
        let sub = build_bitplane_subtable(true, 2);
        assert_eq!(
            sub,
            [
                DmaEvent::None,
                DmaEvent::BplH2,
                DmaEvent::None,
                DmaEvent::BplH1,
                DmaEvent::None,
                DmaEvent::BplH2,
                DmaEvent::None,
                DmaEvent::BplH1,
            ]
        );
    }

    #[test]
    fn lores_4bpl_line_scenario() {
        let (strt, stop) = compute_ddf_window(0x38, 0xD0, false);
        assert_eq!(strt, 0x38);
        assert_eq!(stop, 0xD8);

        let mut table = DmaTable::default();
        table.rebuild(0x38, 0xD0, false, 4, true);

        assert_eq!(table.dma_first_bpl1_event, 0x3F);
        assert_eq!(table.dma_last_bpl1_event, 0xD7);

        let fetches = table
            .dma_event
            .iter()
            .filter(|e| **e != DmaEvent::None)
            .count();
        assert_eq!(fetches, 80, "80 bitplane fetches per lores 4bpl line");
    }

    #[test]
    fn hires_2bpl_line_scenario() {
        let (strt, _stop) = compute_ddf_window(0x3C, 0xD4, true);
        assert_eq!(strt, 0x3C);

        let mut table = DmaTable::default();
        table.rebuild(0x3C, 0xD4, true, 2, true);
        assert_eq!(table.dma_first_bpl1_event, 0x3F);
    }

    #[test]
    fn jump_table_points_to_next_nonempty_slot() {
        let mut table = DmaTable::default();
        table.rebuild(0x38, 0xD0, false, 4, true);
        for h in 0..SLOTS_PER_LINE - 1 {
            let next = table.next_dma_event[h] as usize;
            if next == 0 {
                assert!(
                    table.dma_event[h + 1..].iter().all(|e| *e == DmaEvent::None),
                    "next==0 means no later slot is populated"
                );
            } else {
                assert!(next > h);
                assert_ne!(table.dma_event[next], DmaEvent::None);
                assert!(table.dma_event[h + 1..next].iter().all(|e| *e == DmaEvent::None));
            }
        }
    }

    #[test]
    fn idempotent_jump_table_rebuild() {
        let mut table = DmaTable::default();
        table.rebuild(0x38, 0xD0, false, 4, true);
        let first = table.next_dma_event;
        table.update_jump_table();
        assert_eq!(table.next_dma_event, first, "rebuilding the jump table twice is a no-op");
    }

    #[test]
    fn bitplane_dma_off_produces_empty_table() {
        let mut table = DmaTable::default();
        table.rebuild(0x38, 0xD0, false, 4, false);
        assert!(table.dma_event.iter().all(|e| *e == DmaEvent::None));
        let mut again = table.clone();
        again.rebuild(0x38, 0xD0, false, 4, false);
        assert_eq!(table.dma_event, again.dma_event, "disabling dma twice is idempotent");
    }
}
