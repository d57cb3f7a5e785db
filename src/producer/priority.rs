//! Best-effort scheduling boost for the receive thread

use tracing::debug;

/// Raise the calling thread's priority so datagrams are drained promptly.
/// Failure (usually missing privileges) is logged and ignored.
pub fn raise_current_thread() {
    #[cfg(windows)]
    {
        use windows_sys::Win32::System::Threading::{
            GetCurrentThread, SetThreadPriority, THREAD_PRIORITY_HIGHEST,
        };
        let ok = unsafe { SetThreadPriority(GetCurrentThread(), THREAD_PRIORITY_HIGHEST) };
        if ok == 0 {
            debug!("SetThreadPriority failed; receive thread keeps default priority");
        }
    }

    #[cfg(unix)]
    {
        // On Linux, PRIO_PROCESS with who = 0 targets the calling thread
        let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, -10) };
        if rc != 0 {
            debug!(
                error = %std::io::Error::last_os_error(),
                "setpriority failed; receive thread keeps default priority"
            );
        }
    }
}
