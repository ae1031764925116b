use std::io;

/// Nice value of a thread that did not ask for a priority.
pub(crate) const THREAD_PRIORITY_DEFAULT: i32 = 0;

/// Lowest priority a thread may request (highest nice value on Linux).
pub(crate) const THREAD_PRIORITY_LOWEST: i32 = 19;

/// Highest priority a thread may request.
pub(crate) const THREAD_PRIORITY_HIGHEST: i32 = -20;

// Linux applies `setpriority(PRIO_PROCESS, tid, ..)` to a single thread when
// given its kernel tid rather than the process id.
#[cfg(target_os = "linux")]
pub(crate) fn set_current_thread_priority(nice: i32) -> io::Result<()> {
    let ret = unsafe {
        let tid = libc::syscall(libc::SYS_gettid) as libc::id_t;
        libc::setpriority(libc::PRIO_PROCESS, tid, nice)
    };

    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn set_current_thread_priority(_nice: i32) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

/// Reads back the current thread's nice value.
#[cfg(all(test, target_os = "linux"))]
pub(crate) fn get_current_thread_priority() -> io::Result<i32> {
    // -1 is a valid nice value, errno is the only way to tell it apart from
    // a failure.
    unsafe {
        *libc::__errno_location() = 0;
        let tid = libc::syscall(libc::SYS_gettid) as libc::id_t;
        let nice = libc::getpriority(libc::PRIO_PROCESS, tid);

        match *libc::__errno_location() {
            0 => Ok(nice),
            errno => Err(io::Error::from_raw_os_error(errno)),
        }
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn test_lowering_priority() {
        std::thread::spawn(|| {
            // Raising the nice value never needs privileges.
            set_current_thread_priority(THREAD_PRIORITY_LOWEST).unwrap();
            assert_eq!(get_current_thread_priority().unwrap(), THREAD_PRIORITY_LOWEST);
        })
        .join()
        .unwrap();
    }
}
