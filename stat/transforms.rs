//! Maps between a parameter's bounded external range and the unbounded internal
//! coordinate seen by the quasi-Newton solver.
//!
//! The maps are the ones popularised by MINUIT:
//!
//! * both bounds: `x = a + (b - a) / 2 * (sin(u) + 1)`
//! * lower bound only: `x = a - 1 + sqrt(u^2 + 1)`
//! * upper bound only: `x = b + 1 - sqrt(u^2 + 1)`
//! * no bounds: identity

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BoundTransform {
    Unbounded,
    Lower(f64),
    Upper(f64),
    Double { min: f64, max: f64 },
}

impl BoundTransform {
    pub fn for_range(min: f64, max: f64) -> Self {
        match (min.is_finite(), max.is_finite()) {
            (true, true) => Self::Double { min, max },
            (true, false) => Self::Lower(min),
            (false, true) => Self::Upper(max),
            (false, false) => Self::Unbounded,
        }
    }

    pub fn to_internal(&self, x: f64) -> f64 {
        match *self {
            Self::Unbounded => x,
            Self::Lower(a) => {
                let t = x - a + 1.0;
                (t * t - 1.0).max(0.0).sqrt()
            }
            Self::Upper(b) => {
                let t = b - x + 1.0;
                (t * t - 1.0).max(0.0).sqrt()
            }
            Self::Double { min, max } => {
                if max == min {
                    return 0.0;
                }
                let s = 2.0 * (x - min) / (max - min) - 1.0;
                s.clamp(-1.0, 1.0).asin()
            }
        }
    }

    pub fn to_external(&self, u: f64) -> f64 {
        match *self {
            Self::Unbounded => u,
            Self::Lower(a) => a - 1.0 + (u * u + 1.0).sqrt(),
            Self::Upper(b) => b + 1.0 - (u * u + 1.0).sqrt(),
            Self::Double { min, max } => min + 0.5 * (max - min) * (u.sin() + 1.0),
        }
    }

    /// `dx/du` at internal coordinate `u`.
    pub fn derivative(&self, u: f64) -> f64 {
        match *self {
            Self::Unbounded => 1.0,
            Self::Lower(_) => u / (u * u + 1.0).sqrt(),
            Self::Upper(_) => -u / (u * u + 1.0).sqrt(),
            Self::Double { min, max } => 0.5 * (max - min) * u.cos(),
        }
    }

    /// Internal start point for `x`, moved off a bound by `step` when `x` sits
    /// on it. The maps are flat at their bounds, so a solver started there
    /// would see a zero gradient along that coordinate.
    pub fn interior_start(&self, x: f64, step: f64) -> f64 {
        let nudged = match *self {
            Self::Unbounded => x,
            Self::Lower(a) => x.max(a + step),
            Self::Upper(b) => x.min(b - step),
            Self::Double { min, max } => {
                let margin = step.min(0.25 * (max - min));
                x.clamp(min + margin, max - margin)
            }
        };
        self.to_internal(nudged)
    }
}
