use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub const fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    pub fn is_positive(&self) -> bool {
        self.width.is_finite() && self.height.is_finite() && self.width > 0.0 && self.height > 0.0
    }

    /// Scales down to fit inside `max_edge` on both axes, keeping the aspect ratio.
    pub fn fit_within(self, max_edge: f64) -> Self {
        if !self.is_positive() {
            return self;
        }
        let longest = self.width.max(self.height);
        if longest <= max_edge {
            return self;
        }
        let ratio = max_edge / longest;
        Self {
            width: (self.width * ratio).round(),
            height: (self.height * ratio).round(),
        }
    }
}
