//! Scalar values crossing the guest boundary.

use crate::handles::Handle;

/// A scalar passed to or returned from a guest function.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GuestVal {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl GuestVal {
    pub fn as_i32(&self) -> Option<i32> {
        match *self {
            Self::I32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Self::I64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match *self {
            Self::F32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Self::F64(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i32> for GuestVal {
    fn from(value: i32) -> Self {
        Self::I32(value)
    }
}

impl From<u32> for GuestVal {
    fn from(value: u32) -> Self {
        Self::I32(value as i32)
    }
}

impl From<i64> for GuestVal {
    fn from(value: i64) -> Self {
        Self::I64(value)
    }
}

impl From<f32> for GuestVal {
    fn from(value: f32) -> Self {
        Self::F32(value)
    }
}

impl From<f64> for GuestVal {
    fn from(value: f64) -> Self {
        Self::F64(value)
    }
}

impl From<Handle> for GuestVal {
    fn from(value: Handle) -> Self {
        Self::I32(value.into())
    }
}

/// The value a host shim returns when its operation failed and the error
/// was parked in the pending-error slot.
///
/// The guest checks the slot after seeing this value; the sentinel itself
/// carries no information.
pub trait Sentinel {
    const ABNORMAL: Self;
}

impl Sentinel for () {
    const ABNORMAL: Self = ();
}

impl Sentinel for bool {
    const ABNORMAL: Self = false;
}

impl Sentinel for i32 {
    const ABNORMAL: Self = 0;
}

impl Sentinel for u32 {
    const ABNORMAL: Self = 0;
}

impl Sentinel for i64 {
    const ABNORMAL: Self = 0;
}

impl Sentinel for u64 {
    const ABNORMAL: Self = 0;
}

impl Sentinel for f32 {
    const ABNORMAL: Self = f32::NAN;
}

impl Sentinel for f64 {
    const ABNORMAL: Self = f64::NAN;
}

impl Sentinel for Handle {
    const ABNORMAL: Self = Handle::UNDEFINED;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels() {
        assert_eq!(<i32 as Sentinel>::ABNORMAL, 0);
        assert!(<f64 as Sentinel>::ABNORMAL.is_nan());
        assert_eq!(<Handle as Sentinel>::ABNORMAL, Handle::UNDEFINED);
    }

    #[test]
    fn test_guest_val_accessors() {
        assert_eq!(GuestVal::from(7i32).as_i32(), Some(7));
        assert_eq!(GuestVal::from(2.5f64).as_i32(), None);
        assert_eq!(GuestVal::from(Handle::NULL), GuestVal::I32(1));
    }
}
