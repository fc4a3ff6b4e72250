//! Controlling terminal: raw mode and window size.

use std::io;
use std::os::fd::AsFd;

use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg, Termios};
use tracing::warn;

use super::TermSize;

/// Puts stdin in raw mode; the previous settings are restored on drop.
pub struct RawModeGuard {
    saved: Termios,
}

impl RawModeGuard {
    pub fn enable() -> io::Result<Self> {
        let stdin = io::stdin();
        let saved = tcgetattr(stdin.as_fd())?;
        let mut raw = saved.clone();
        cfmakeraw(&mut raw);
        tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &raw)?;
        Ok(Self { saved })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = tcsetattr(io::stdin().as_fd(), SetArg::TCSANOW, &self.saved) {
            warn!("error restoring terminal state: {e}");
        }
    }
}

/// Current size of the terminal attached to stdin.
pub fn term_size() -> io::Result<TermSize> {
    let mut ws = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCGWINSZ fills in a winsize struct we own.
    let ret = unsafe {
        libc::ioctl(
            libc::STDIN_FILENO,
            libc::TIOCGWINSZ,
            std::ptr::addr_of_mut!(ws),
        )
    };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(TermSize {
        cols: ws.ws_col,
        rows: ws.ws_row,
    })
}
