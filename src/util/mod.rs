use std::ffi::CStr;

/// Return the host name of this machine, or `"unknown"` if it cannot be read.
pub(crate) fn hostname() -> String {
    let mut buf = [0 as libc::c_char; 256];
    // SAFETY: the buffer is valid for `buf.len()` bytes and its last byte
    // stays NUL, so the result is always terminated.
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr(), buf.len() - 1) };
    if ret != 0 {
        return "unknown".to_owned();
    }
    // SAFETY: see above.
    unsafe { CStr::from_ptr(buf.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}
