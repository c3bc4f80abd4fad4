//! Virtual timer helpers.

use std::time::Duration;

/// CNTV_CTL_EL0.ENABLE
pub const CTL_ENABLE: u64 = 1 << 0;
/// CNTV_CTL_EL0.IMASK
pub const CTL_IMASK: u64 = 1 << 1;
/// CNTV_CTL_EL0.ISTATUS
pub const CTL_ISTATUS: u64 = 1 << 2;

/// Whether the timer's interrupt output is asserted for this control value.
pub fn irq_asserted(ctl: u64) -> bool {
    ctl & (CTL_ENABLE | CTL_IMASK | CTL_ISTATUS) == CTL_ENABLE | CTL_ISTATUS
}

/// How long a wait-for-interrupt may sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WfiWait {
    /// The deadline already passed.
    Immediate,
    /// Sleep until the timer fires or a kick arrives.
    For(Duration),
    /// No timer will wake the vCPU; only a kick can.
    Indefinite,
}

impl WfiWait {
    /// Cap the sleep at `max`.
    pub fn clamp(self, max: Option<Duration>) -> Self {
        match (self, max) {
            (WfiWait::For(d), Some(max)) => WfiWait::For(d.min(max)),
            (WfiWait::Indefinite, Some(max)) => WfiWait::For(max),
            (wait, _) => wait,
        }
    }
}

/// Compute the wait for a vCPU whose timer has control `ctl` and compare
/// value `cval`, given the current virtual counter `now` ticking at `freq` Hz.
pub fn wfi_wait(ctl: u64, cval: u64, now: u64, freq: u64) -> WfiWait {
    if ctl & CTL_ENABLE == 0 || ctl & CTL_IMASK != 0 || freq == 0 {
        return WfiWait::Indefinite;
    }
    if cval <= now {
        return WfiWait::Immediate;
    }
    let ticks = (cval - now) as u128;
    let nanos = ticks * 1_000_000_000 / freq as u128;
    WfiWait::For(Duration::from_nanos(nanos.min(u64::MAX as u128) as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_irq_asserted() {
        assert!(irq_asserted(CTL_ENABLE | CTL_ISTATUS));
        assert!(!irq_asserted(CTL_ENABLE | CTL_ISTATUS | CTL_IMASK));
        assert!(!irq_asserted(CTL_ENABLE));
        assert!(!irq_asserted(CTL_ISTATUS));
    }

    #[test]
    fn test_wfi_wait() {
        let freq = 24_000_000;
        assert_eq!(wfi_wait(0, 100, 0, freq), WfiWait::Indefinite);
        assert_eq!(wfi_wait(CTL_ENABLE | CTL_IMASK, 100, 0, freq), WfiWait::Indefinite);
        assert_eq!(wfi_wait(CTL_ENABLE, 100, 100, freq), WfiWait::Immediate);
        assert_eq!(
            wfi_wait(CTL_ENABLE, 24_000, 0, freq),
            WfiWait::For(Duration::from_millis(1))
        );
    }

    #[test]
    fn test_wfi_clamp() {
        let max = Some(Duration::from_millis(5));
        assert_eq!(WfiWait::Indefinite.clamp(max), WfiWait::For(Duration::from_millis(5)));
        assert_eq!(
            WfiWait::For(Duration::from_secs(1)).clamp(max),
            WfiWait::For(Duration::from_millis(5))
        );
        assert_eq!(WfiWait::Immediate.clamp(max), WfiWait::Immediate);
        assert_eq!(WfiWait::Indefinite.clamp(None), WfiWait::Indefinite);
    }
}
