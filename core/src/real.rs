/// Numeric element type shared by every kernel and engine.
///
/// One generic implementation covers `f32` (the default training precision),
/// `half::f16` (the half-precision target build) and `f64` (used by the
/// gradient checks, where finite differences need the extra mantissa).

use std::fmt::{Debug, Display};

use half::f16;
use num_traits::Float;

/// Element type for tensors, kernels and the MHSA engines.
///
/// `cast`/`wide` are named to stay clear of `num_traits::NumCast` and
/// `ToPrimitive`, which `Float` already pulls into scope for every `T: Real`.
pub trait Real: Float + Default + Debug + Display + Send + Sync + 'static {
    /// Short name used in logs and bench ids.
    const NAME: &'static str;

    /// Round an `f64` to this precision.
    fn cast(x: f64) -> Self;

    /// Widen to `f64`. Exact for every implementor.
    fn wide(self) -> f64;
}

impl Real for f32 {
    const NAME: &'static str = "f32";

    #[inline]
    fn cast(x: f64) -> Self {
        x as f32
    }

    #[inline]
    fn wide(self) -> f64 {
        self as f64
    }
}

impl Real for f64 {
    const NAME: &'static str = "f64";

    #[inline]
    fn cast(x: f64) -> Self {
        x
    }

    #[inline]
    fn wide(self) -> f64 {
        self
    }
}

impl Real for f16 {
    const NAME: &'static str = "f16";

    #[inline]
    fn cast(x: f64) -> Self {
        f16::from_f64(x)
    }

    #[inline]
    fn wide(self) -> f64 {
        self.to_f64()
    }
}

/// Approximate `1/sqrt(x)`: bit-level initial guess plus one Newton step.
///
/// Relative error stays below 0.2% for positive normal inputs.
#[inline]
pub fn fast_inv_sqrt(x: f32) -> f32 {
    let half_x = 0.5 * x;
    let guess = f32::from_bits(0x5f37_59df_u32.wrapping_sub(x.to_bits() >> 1));
    guess * (1.5 - half_x * guess * guess)
}

/// Sum a slice in index order, accumulating in `T`.
pub fn sum<T: Real>(values: &[T]) -> T {
    values.iter().fold(T::zero(), |acc, &v| acc + v)
}
