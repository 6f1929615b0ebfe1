//! The change set between two canvas snapshots: a per-tile dirty bitset
//! plus a flag for whether any layer's properties changed. Renderers use
//! this to redraw only what actually moved.

use bitvec::prelude::*;
use canvas_model::tiles_for;
use canvas_tree::CanvasState;

#[derive(Debug, Clone)]
pub struct CanvasDiff {
    xtiles: u32,
    ytiles: u32,
    tile_changes: BitVec,
    layer_props_changed: bool,
}

impl Default for CanvasDiff {
    fn default() -> Self {
        Self::new()
    }
}

impl CanvasDiff {
    pub fn new() -> Self {
        Self {
            xtiles: 0,
            ytiles: 0,
            tile_changes: BitVec::new(),
            layer_props_changed: false,
        }
    }

    /// Sizes the bitset to the new dimensions and seeds it all-true iff the
    /// dimensions actually changed, else all-false. Reused buffer capacity
    /// is not preserved across calls here (the original C engine reallocs
    /// only on growth; `BitVec` already amortizes that internally).
    pub fn begin(&mut self, old_width: u32, old_height: u32, new_width: u32, new_height: u32, layer_props_changed: bool) {
        self.xtiles = tiles_for(new_width);
        self.ytiles = tiles_for(new_height);
        let count = (self.xtiles * self.ytiles) as usize;
        let init = old_width != new_width || old_height != new_height;
        self.tile_changes = BitVec::repeat(init, count);
        self.layer_props_changed = layer_props_changed;
    }

    /// ORs `predicate(index)` into the bitset for every tile not already
    /// marked dirty; never clears a bit that's already set.
    pub fn check(&mut self, mut predicate: impl FnMut(usize) -> bool) {
        for i in 0..self.tile_changes.len() {
            if !self.tile_changes[i] && predicate(i) {
                self.tile_changes.set(i, true);
            }
        }
    }

    pub fn check_all(&mut self) {
        self.tile_changes.fill(true);
    }

    pub fn each_index(&self, mut f: impl FnMut(usize)) {
        for i in 0..self.tile_changes.len() {
            if self.tile_changes[i] {
                f(i);
            }
        }
    }

    pub fn each_pos(&self, mut f: impl FnMut(u32, u32)) {
        for y in 0..self.ytiles {
            for x in 0..self.xtiles {
                let idx = (y * self.xtiles + x) as usize;
                if self.tile_changes[idx] {
                    f(x, y);
                }
            }
        }
    }

    pub fn tiles_changed(&self) -> bool {
        self.tile_changes.any()
    }

    pub fn layer_props_changed_reset(&mut self) -> bool {
        let changed = self.layer_props_changed;
        self.layer_props_changed = false;
        changed
    }

    pub fn xtiles(&self) -> u32 {
        self.xtiles
    }

    pub fn ytiles(&self) -> u32 {
        self.ytiles
    }
}

fn layer_props_differ(old: &CanvasState, new: &CanvasState) -> bool {
    if old.layers().len() != new.layers().len() {
        return true;
    }
    for i in 0..new.layers().len() {
        let (op, np) = (old.layers().props_at(i), new.layers().props_at(i));
        if op.id != np.id
            || op.title != np.title
            || op.opacity != np.opacity
            || op.blend_mode != np.blend_mode
            || op.visible != np.visible
            || op.censored != np.censored
            || op.fixed != np.fixed
        {
            return true;
        }
    }
    false
}

/// Computes the full tile-level diff between two consecutive snapshots.
/// Unchanged regions are detected by comparing shared tile pointers, which
/// is exact (two distinct contents never compare pointer-equal) and fast
/// (no pixel comparison needed) because tiles are immutable once shared.
pub fn diff_canvas_states(old: &CanvasState, new: &CanvasState) -> CanvasDiff {
    let mut diff = CanvasDiff::new();
    let props_changed = layer_props_differ(old, new);
    diff.begin(old.width(), old.height(), new.width(), new.height(), props_changed);

    if old.width() != new.width()
        || old.height() != new.height()
        || old.background() != new.background()
        || old.layers().len() != new.layers().len()
    {
        diff.check_all();
        return diff;
    }

    let xtiles = diff.xtiles();
    let ytiles = diff.ytiles();
    for ty in 0..ytiles {
        for tx in 0..xtiles {
            let idx = (ty * xtiles + tx) as usize;
            let changed = (0..new.layers().len()).any(|i| {
                let old_tile = old.layers().content_at(i).grid().tile_at(tx, ty);
                let new_tile = new.layers().content_at(i).grid().tile_at(tx, ty);
                old_tile != new_tile
            });
            if changed {
                diff.tile_changes.set(idx, true);
            }
        }
    }
    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use canvas_pixels::{BlendMode, Pixel};
    use canvas_tree::TransientCanvasState;

    #[test]
    fn diff_of_state_with_itself_is_empty() {
        let base = CanvasState::empty();
        let mut tcs = TransientCanvasState::new(&base);
        tcs.resize(1, 0, 64, 64, 0).unwrap();
        let state = tcs.persist();
        let diff = diff_canvas_states(&state, &state);
        assert!(!diff.tiles_changed());
        assert!(!diff.layer_props_changed_reset());
    }

    #[test]
    fn resize_marks_every_tile_dirty() {
        let empty = CanvasState::empty();
        let mut tcs = TransientCanvasState::new(&empty);
        tcs.resize(1, 0, 128, 128, 0).unwrap();
        let resized = tcs.persist();
        let diff = diff_canvas_states(&empty, &resized);
        assert!(diff.tiles_changed());
        let mut count = 0;
        diff.each_index(|_| count += 1);
        assert_eq!(count, (diff.xtiles() * diff.ytiles()) as usize);
    }

    #[test]
    fn fill_rect_marks_only_its_own_tiles() {
        let empty = CanvasState::empty();
        let mut tcs = TransientCanvasState::new(&empty);
        tcs.resize(1, 0, 128, 128, 0).unwrap();
        tcs.layers_mut().create(1, 0, None, false, false, 128, 128, "L".into(), 1).unwrap();
        let base = tcs.persist();

        let mut tcs2 = TransientCanvasState::new(&base);
        tcs2.layers_mut()
            .fill_rect(1, 1, BlendMode::Normal, 0, 0, 64, 64, Pixel::from_channels(0, 255, 0, 255))
            .unwrap();
        let painted = tcs2.persist();

        let diff = diff_canvas_states(&base, &painted);
        let mut positions = Vec::new();
        diff.each_pos(|x, y| positions.push((x, y)));
        assert_eq!(positions, vec![(0, 0)]);
    }
}
