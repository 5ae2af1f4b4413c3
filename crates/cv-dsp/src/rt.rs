//! Real-time scheduling for convolution worker threads
//!
//! Platform-specific priority elevation, applied by each level worker to
//! itself right after spawning:
//!
//! - **Linux**: `pthread_setschedparam` with the caller-supplied policy
//!   (typically SCHED_FIFO) and priority, clamped to the policy's range.
//! - **macOS**: fixed-priority (non-timeshare) mach policy plus a
//!   time-constraint policy derived from the level's cycle period;
//!   pthread priorities play no role there.
//! - elsewhere: unsupported, workers keep default scheduling.
//!
//! Failure is non-fatal by default: the worker keeps running at default
//! priority and the failure is logged once. With the `hard-rt` feature the
//! failure is propagated and engine startup is aborted instead.

/// Scheduling parameters for one worker thread.
#[derive(Debug, Clone, Copy)]
pub struct RtParams {
    /// Scheduling policy (e.g. `libc::SCHED_FIFO`); ignored on macOS.
    pub policy: i32,
    /// Absolute priority within the policy's range.
    pub priority: i32,
    /// Cycle period in nanoseconds, used for the macOS time-constraint
    /// policy (computation ~0.3 period, constraint ~0.9 period).
    pub period_ns: f64,
}

/// Promote the current thread to real-time scheduling.
pub fn promote_current_thread(params: &RtParams) -> Result<(), String> {
    platform_promote(params)
}

// ============ Linux ============

#[cfg(target_os = "linux")]
fn platform_promote(params: &RtParams) -> Result<(), String> {
    let min = unsafe { libc::sched_get_priority_min(params.policy) };
    let max = unsafe { libc::sched_get_priority_max(params.policy) };
    if min < 0 || max < 0 {
        return Err(format!("invalid scheduling policy {}", params.policy));
    }

    let parm = libc::sched_param {
        sched_priority: params.priority.clamp(min, max),
    };

    let rv = unsafe { libc::pthread_setschedparam(libc::pthread_self(), params.policy, &parm) };
    if rv == 0 {
        Ok(())
    } else {
        Err(format!(
            "pthread_setschedparam(policy {}, prio {}) failed: errno {}",
            params.policy, parm.sched_priority, rv
        ))
    }
}

// ============ macOS ============

#[cfg(target_os = "macos")]
fn platform_promote(params: &RtParams) -> Result<(), String> {
    const THREAD_EXTENDED_POLICY: u32 = 1;
    const THREAD_EXTENDED_POLICY_COUNT: u32 = 1;
    const THREAD_PRECEDENCE_POLICY: u32 = 3;
    const THREAD_PRECEDENCE_POLICY_COUNT: u32 = 1;
    const THREAD_TIME_CONSTRAINT_POLICY: u32 = 2;
    const THREAD_TIME_CONSTRAINT_POLICY_COUNT: u32 = 4;

    #[repr(C)]
    struct ThreadExtendedPolicy {
        timeshare: i32,
    }

    #[repr(C)]
    struct ThreadPrecedencePolicy {
        importance: i32,
    }

    #[repr(C)]
    struct ThreadTimeConstraintPolicy {
        period: u32,
        computation: u32,
        constraint: u32,
        preemptible: i32,
    }

    #[repr(C)]
    struct MachTimebaseInfo {
        numer: u32,
        denom: u32,
    }

    extern "C" {
        fn mach_thread_self() -> u32;
        fn mach_timebase_info(info: *mut MachTimebaseInfo) -> i32;
        fn thread_policy_set(thread: u32, flavor: u32, policy_info: *const u8, count: u32) -> i32;
    }

    let thread = unsafe { mach_thread_self() };

    // Ask for fixed (non-timeshare) priority.
    let tep = ThreadExtendedPolicy { timeshare: 0 };
    unsafe {
        thread_policy_set(
            thread,
            THREAD_EXTENDED_POLICY,
            (&tep as *const ThreadExtendedPolicy).cast(),
            THREAD_EXTENDED_POLICY_COUNT,
        );
    }

    // MAXPRI_USER - 3
    let tpp = ThreadPrecedencePolicy { importance: 60 };
    unsafe {
        thread_policy_set(
            thread,
            THREAD_PRECEDENCE_POLICY,
            (&tpp as *const ThreadPrecedencePolicy).cast(),
            THREAD_PRECEDENCE_POLICY_COUNT,
        );
    }

    let mut timebase = MachTimebaseInfo { numer: 0, denom: 0 };
    let rv = unsafe { mach_timebase_info(&mut timebase) };
    if rv != 0 || timebase.numer == 0 {
        return Err("mach_timebase_info failed".to_string());
    }

    let ns_to_abs =
        |ns: f64| -> u32 { (ns * timebase.denom as f64 / timebase.numer as f64) as u32 };

    let ttcp = ThreadTimeConstraintPolicy {
        period: ns_to_abs(params.period_ns),
        computation: ns_to_abs(params.period_ns * 0.3),
        constraint: ns_to_abs(params.period_ns * 0.9),
        preemptible: 1,
    };
    let rv = unsafe {
        thread_policy_set(
            thread,
            THREAD_TIME_CONSTRAINT_POLICY,
            (&ttcp as *const ThreadTimeConstraintPolicy).cast(),
            THREAD_TIME_CONSTRAINT_POLICY_COUNT,
        )
    };
    if rv == 0 {
        Ok(())
    } else {
        Err(format!("thread_policy_set(time constraint) failed: {}", rv))
    }
}

// ============ Other platforms ============

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn platform_promote(_params: &RtParams) -> Result<(), String> {
    Err("real-time scheduling not supported on this platform".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_os = "linux")]
    fn test_promote_does_not_panic() {
        // Without CAP_SYS_NICE this fails; either outcome is acceptable,
        // it must just not panic or corrupt the thread.
        let params = RtParams {
            policy: libc::SCHED_FIFO,
            priority: 70,
            period_ns: 1_333_333.0,
        };
        let _ = promote_current_thread(&params);
    }
}
