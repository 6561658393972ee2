//! Where an intercepted function's pre-hook address is kept.

use std::sync::atomic::{AtomicUsize, Ordering};

use libc::c_void;

/// Address of the implementation a hook replaced.
///
/// Filled in once when hooks are committed and read-only afterwards.  Shims
/// call through it to reach the real function.
#[derive(Debug)]
pub struct HookSlot {
    symbol: &'static str,
    addr: AtomicUsize,
}

impl HookSlot {
    pub const fn new(symbol: &'static str) -> Self {
        HookSlot {
            symbol,
            addr: AtomicUsize::new(0),
        }
    }

    pub fn symbol(&self) -> &'static str {
        self.symbol
    }

    pub fn get(&self) -> Option<usize> {
        match self.addr.load(Ordering::Acquire) {
            0 => None,
            addr => Some(addr),
        }
    }

    /// Record `addr` unless an address is already stored.  The first binding
    /// found wins.
    pub fn set_if_empty(&self, addr: usize) -> bool {
        addr != 0
            && self
                .addr
                .compare_exchange(0, addr, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// Out-pointer for hosts that write the original address themselves.
    pub fn as_out_ptr(&self) -> *mut *mut c_void {
        self.addr.as_ptr().cast()
    }

    /// The stored address as a function pointer of type `F`.
    ///
    /// # Safety
    ///
    /// `F` must be a function pointer type matching the real signature.
    pub unsafe fn load<F: Copy>(&self) -> Option<F> {
        debug_assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<usize>());
        self.get()
            .map(|addr| std::mem::transmute_copy::<usize, F>(&addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_address_wins() {
        let slot = HookSlot::new("fgets");
        assert_eq!(slot.get(), None);
        assert!(!slot.set_if_empty(0));
        assert!(slot.set_if_empty(0x1000));
        assert!(!slot.set_if_empty(0x2000));
        assert_eq!(slot.get(), Some(0x1000));
        assert_eq!(slot.symbol(), "fgets");
    }

    #[test]
    fn out_pointer_writes_through() {
        let slot = HookSlot::new("memfd_create");
        unsafe {
            *slot.as_out_ptr() = 0x4242 as *mut c_void;
        }
        assert_eq!(slot.get(), Some(0x4242));
    }

    #[test]
    fn loads_as_function_pointer() {
        extern "C" fn answer() -> i32 {
            42
        }
        let slot = HookSlot::new("answer");
        slot.set_if_empty(answer as usize);
        let f = unsafe { slot.load::<extern "C" fn() -> i32>() }.unwrap();
        assert_eq!(f(), 42);
    }
}
