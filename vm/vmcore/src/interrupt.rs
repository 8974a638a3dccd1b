// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Types to support delivering notifications to the guest.

use std::fmt::Debug;
use std::sync::Arc;

/// An interrupt-like signal used to notify the guest of device activity.
///
/// Devices treat this as edge triggered: each [`Interrupt::deliver`] is one
/// notification, and coalescing is the receiver's business.
#[derive(Clone, Debug, Default)]
pub struct Interrupt {
    inner: InterruptInner,
}

impl Interrupt {
    /// An interrupt that does nothing.
    pub fn null() -> Self {
        Self {
            inner: InterruptInner::Null,
        }
    }

    /// Creates an interrupt from a function.
    ///
    /// The function is called each time [`Self::deliver`] is called, from
    /// whichever thread completed the work.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: 'static + Send + Sync + Fn(),
    {
        Self {
            inner: InterruptInner::Fn(Arc::new(f)),
        }
    }

    /// Delivers the interrupt.
    pub fn deliver(&self) {
        match &self.inner {
            InterruptInner::Null => {}
            InterruptInner::Fn(f) => f(),
        }
    }
}

#[derive(Clone, Default)]
enum InterruptInner {
    #[default]
    Null,
    Fn(Arc<dyn Send + Sync + Fn()>),
}

impl Debug for InterruptInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterruptInner::Null => f.pad("Null"),
            InterruptInner::Fn(_) => f.pad("Fn"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Interrupt;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    #[test]
    fn test_interrupt_fn() {
        let count = Arc::new(AtomicUsize::new(0));
        let interrupt = Interrupt::from_fn({
            let count = count.clone();
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });
        interrupt.deliver();
        interrupt.clone().deliver();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_interrupt_null() {
        let interrupt = Interrupt::default();
        interrupt.deliver();
        assert_eq!(format!("{interrupt:?}"), "Interrupt { inner: Null }");
    }
}
