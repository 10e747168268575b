//! External-collaborator traits.
//!
//! CPU, Blitter internals, Denise, Paula, CIA-A/B, and chip memory are all
//! owned outside this crate. Each is reached only through one of these narrow
//! traits, bundled into a single [`Collaborators`] capability record passed
//! in at call time, so Agnus never holds a back-pointer to the machine that
//! owns it.

/// 19-bit, even-aligned chip-RAM access.
pub trait ChipRam {
    fn read16(&mut self, addr: u32) -> u16;
    fn write16(&mut self, addr: u32, value: u16);
}

pub trait DeniseOps {
    fn begin_of_line(&mut self, v: u16);
    fn end_of_line(&mut self, v: u16);
    fn set_first_last_canvas_pixel(&mut self, first: u16, last: u16);
    fn record_color_change(&mut self, reg: u16, value: u16, pixel_off: u16);
    fn bpl_slice_word(&mut self, plane: u8, word: u16);
    fn bplcon_bpu(&self) -> u8;
    fn hires(&self) -> bool;
    fn bplcon_lace(&self) -> bool;
}

pub trait PaulaOps {
    fn audio_enable_dma(&mut self, ch: u8);
    fn audio_disable_dma(&mut self, ch: u8);
    fn audio_execute_until(&mut self, clock: u64);
    fn audio_fill_word_for(&mut self, ch: u8, word: u16);
    fn intreq_raise(&mut self, mask: u16);
}

pub trait CiaOps {
    fn increment_tod(&mut self);
}

pub trait BlitterOps {
    fn dmacon_update(&mut self, old: u16, new: u16);
    fn is_busy(&self) -> bool;
    fn is_zero(&self) -> bool;
}

/// The capability record handed to Agnus for the duration of one call into
/// its run loop. Nothing here is stored past the call.
pub struct Collaborators<'a> {
    pub chip_ram: &'a mut dyn ChipRam,
    pub denise: &'a mut dyn DeniseOps,
    pub paula: &'a mut dyn PaulaOps,
    pub cia_a: &'a mut dyn CiaOps,
    pub cia_b: &'a mut dyn CiaOps,
    pub blitter: &'a mut dyn BlitterOps,
}
