// Keeps the visible message still while older history is prepended above it.

/// Taken right before a backward fetch; applied once layout has settled
/// with the prepended rows, not before.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollAnchor {
    height_before: f64,
    offset_before: f64,
}

impl ScrollAnchor {
    pub fn capture(scroll_height: f64, scroll_offset: f64) -> Self {
        Self {
            height_before: scroll_height,
            offset_before: scroll_offset,
        }
    }

    /// New scroll offset for the settled `scroll_height`.
    pub fn adjusted_offset(&self, scroll_height: f64) -> f64 {
        let delta = scroll_height - self.height_before;
        (self.offset_before + delta).max(0.0)
    }
}
