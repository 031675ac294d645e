//! Brick visibility classification
//!
//! A brick is classified from its value statistics alone: under an
//! isosurface it is visible when the isovalue lies inside its range, under
//! a transfer function when the function's non-zero range overlaps it.
//! Classification is then aggregated bottom-up so an inner brick is only
//! visible when some child is.

use crate::brick::{BrickHierarchy, BrickKey, BrickStats, ValueRange};

/// What the renderer is currently showing.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum VisibilityMode {
    /// Isosurface at a scalar value.
    Isovalue(f64),
    /// Direct volume rendering; the range where the transfer function is non-zero.
    TransferFunction(ValueRange),
}

/// Parameters that decide which bricks can contribute to the image.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VisibilityParams {
    pub mode: VisibilityMode,
    /// Optional gradient magnitude window.
    pub gradient: Option<ValueRange>,
}

impl VisibilityParams {
    pub fn isosurface(isovalue: f64) -> Self {
        Self { mode: VisibilityMode::Isovalue(isovalue), gradient: None }
    }

    pub fn transfer_function(non_zero: ValueRange) -> Self {
        Self { mode: VisibilityMode::TransferFunction(non_zero), gradient: None }
    }

    pub fn with_gradient(mut self, gradient: ValueRange) -> Self {
        self.gradient = Some(gradient);
        self
    }

    /// Classify one brick. Bricks without statistics are kept.
    pub fn classify(&self, stats: Option<&BrickStats>) -> bool {
        let Some(stats) = stats else {
            return true;
        };
        let value_visible = match self.mode {
            VisibilityMode::Isovalue(iso) => stats.value.contains(iso),
            VisibilityMode::TransferFunction(range) => stats.value.overlaps(&range),
        };
        let gradient_visible = match (self.gradient, stats.gradient) {
            (Some(window), Some(range)) => window.overlaps(&range),
            _ => true,
        };
        value_visible && gradient_visible
    }
}

impl Default for VisibilityParams {
    /// A transfer function that is non-zero everywhere.
    fn default() -> Self {
        Self::transfer_function(ValueRange::new(f64::NEG_INFINITY, f64::INFINITY))
    }
}

/// Visibility of every brick of one timestep, indexed like `stats`
/// (LOD-major, see [`BrickHierarchy::global_id`] at timestep 0).
pub fn compute_visibility(
    hierarchy: &BrickHierarchy,
    stats: &[Option<BrickStats>],
    params: &VisibilityParams,
) -> Vec<bool> {
    let mut visible: Vec<bool> = stats.iter().map(|s| params.classify(s.as_ref())).collect();

    for (lod, level) in hierarchy.levels().iter().enumerate().skip(1) {
        for index in 0..level.brick_count {
            let id = (level.offset + index) as usize;
            if !visible[id] {
                continue;
            }
            let key = BrickKey::new(0, lod as u32, index);
            visible[id] = hierarchy
                .children(&key)
                .iter()
                .any(|child| visible[hierarchy.global_id(child) as usize]);
        }
    }
    visible
}
