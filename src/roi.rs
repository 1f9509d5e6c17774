//! Region of interest: the resolution descriptor carried by every connector.
//!
//! `full_wd`/`full_ht` is the reference resolution of the data at this point in
//! the chain, `wd`/`ht` is what actually gets processed. The working size is
//! always derived from the full size: `wd = max(1, round(full_wd * scale))`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Roi {
    pub wd: u32,
    pub ht: u32,
    pub full_wd: u32,
    pub full_ht: u32,
    /// Working / full ratio
    pub scale: f32,
}

impl Default for Roi {
    fn default() -> Self {
        Self {
            wd: 0,
            ht: 0,
            full_wd: 0,
            full_ht: 0,
            scale: 1.0,
        }
    }
}

impl Roi {
    /// Working size equal to the full size
    pub fn full(wd: u32, ht: u32) -> Self {
        Self {
            wd,
            ht,
            full_wd: wd,
            full_ht: ht,
            scale: 1.0,
        }
    }

    /// Derive the working size from a full size and a scale
    pub fn scaled(full_wd: u32, full_ht: u32, scale: f32) -> Self {
        Self {
            wd: scale_dim(full_wd, scale),
            ht: scale_dim(full_ht, scale),
            full_wd,
            full_ht,
            scale,
        }
    }

    /// Same full size, new scale
    pub fn with_scale(&self, scale: f32) -> Self {
        Self::scaled(self.full_wd, self.full_ht, scale)
    }

    /// Same scale, new full size
    pub fn with_full(&self, full_wd: u32, full_ht: u32) -> Self {
        Self::scaled(full_wd, full_ht, self.scale)
    }

    /// One pyramid level down: working and full sizes are ceiling-divided by two.
    pub fn halved(&self) -> Self {
        Self {
            wd: half_ceil(self.wd),
            ht: half_ceil(self.ht),
            full_wd: half_ceil(self.full_wd),
            full_ht: half_ceil(self.full_ht),
            scale: self.scale,
        }
    }

    /// Integer block downsampling (`block` × `block` pixels become one),
    /// applied to working and full sizes alike.
    pub fn downsampled(&self, block: u32) -> Self {
        let block = block.max(1);
        Self {
            wd: (self.wd / block).max(1),
            ht: (self.ht / block).max(1),
            full_wd: (self.full_wd / block).max(1),
            full_ht: (self.full_ht / block).max(1),
            scale: self.scale,
        }
    }

    /// Drop the last row/column if odd (chroma subsampling needs even sizes)
    pub fn even(&self) -> Self {
        Self {
            wd: self.wd & !1,
            ht: self.ht & !1,
            ..*self
        }
    }

    pub fn pixels(&self) -> usize {
        self.wd as usize * self.ht as usize
    }

    pub fn is_empty(&self) -> bool {
        self.wd == 0 || self.ht == 0
    }

    pub fn is_full_res(&self) -> bool {
        self.wd == self.full_wd && self.ht == self.full_ht
    }
}

fn half_ceil(x: u32) -> u32 {
    if x == 0 {
        0
    } else {
        (x - 1) / 2 + 1
    }
}

fn scale_dim(full: u32, scale: f32) -> u32 {
    if full == 0 {
        return 0;
    }
    ((full as f64 * scale as f64).round() as u32).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_halved_rounds_up() {
        let roi = Roi::full(5, 4).halved();
        assert_eq!((roi.wd, roi.ht), (3, 2));
        assert_eq!((roi.full_wd, roi.full_ht), (3, 2));
        assert_eq!(Roi::full(1, 1).halved().wd, 1);
    }

    #[test]
    fn test_scaled() {
        let roi = Roi::scaled(64, 48, 0.5);
        assert_eq!((roi.wd, roi.ht), (32, 24));
        assert!(!roi.is_full_res());
        assert!(Roi::full(3, 3).is_full_res());
    }

    #[test]
    fn test_even() {
        let roi = Roi::full(7, 5).even();
        assert_eq!((roi.wd, roi.ht), (6, 4));
        assert_eq!(roi.full_wd, 7);
    }

    proptest! {
        #[test]
        fn prop_scaling_is_stable(
            full_wd in 1u32..10_000,
            full_ht in 1u32..10_000,
            scale in 0.01f32..=1.0,
        ) {
            let roi = Roi::scaled(full_wd, full_ht, scale);
            // re-deriving with the stored scale is a fixed point
            prop_assert_eq!(roi.with_scale(roi.scale), roi);
            prop_assert!(roi.wd >= 1 && roi.wd <= full_wd);
            prop_assert!(roi.ht >= 1 && roi.ht <= full_ht);
        }

        #[test]
        fn prop_halving_keeps_scale_and_order(wd in 1u32..10_000, ht in 1u32..10_000) {
            let roi = Roi::full(wd, ht);
            let half = roi.halved();
            prop_assert_eq!(half.scale, roi.scale);
            prop_assert!(half.wd * 2 >= roi.wd && half.wd <= roi.wd);
            prop_assert!(half.full_ht * 2 >= roi.full_ht);
        }
    }
}
