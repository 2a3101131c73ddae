mod blur;
pub mod mask;
pub mod padding;

pub use blur::{gaussian_blur, gaussian_kernel};

use num_traits::{Bounded, NumCast};
use std::any::TypeId;

pub fn is_floating_point<T: 'static>() -> bool {
    TypeId::of::<T>() == TypeId::of::<f32>()
}

/// Largest sample value of `T`: 1.0 for floats, `T::MAX` for integers.
pub fn get_max_value<T: Bounded + NumCast + 'static>() -> T {
    if is_floating_point::<T>() {
        T::from(1.0).unwrap_or_else(T::max_value)
    } else {
        T::max_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_values() {
        assert_eq!(get_max_value::<u8>(), 255);
        assert_eq!(get_max_value::<u16>(), 65535);
        assert_eq!(get_max_value::<f32>(), 1.0);
    }
}
