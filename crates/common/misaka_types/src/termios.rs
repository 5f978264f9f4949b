//! Terminal settings shared by the PTY driver and its callers.

use bitflags::bitflags;
use dataview::Pod;

pub const NCCS: usize = 32;

// indices into `Termios::c_cc`
pub const VEOF: usize = 1;
pub const VEOL: usize = 2;
pub const VERASE: usize = 3;
pub const VINTR: usize = 4;
pub const VKILL: usize = 5;
pub const VMIN: usize = 6;
pub const VQUIT: usize = 7;
pub const VSTART: usize = 8;
pub const VSTOP: usize = 9;
pub const VSUSP: usize = 10;
pub const VTIME: usize = 11;
pub const VLNEXT: usize = 12;
pub const VWERASE: usize = 13;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[repr(transparent)]
    pub struct InputFlags: u32 {
        const BRKINT = 0o000_001;
        const ICRNL = 0o000_002;
        const IGNBRK = 0o000_004;
        const IGNCR = 0o000_010;
        const IGNPAR = 0o000_020;
        const INLCR = 0o000_040;
        const INPCK = 0o000_100;
        const ISTRIP = 0o000_200;
        const IUCLC = 0o000_400;
        const IXANY = 0o001_000;
        const IXOFF = 0o002_000;
        const IXON = 0o004_000;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[repr(transparent)]
    pub struct OutputFlags: u32 {
        const OPOST = 0o000_001;
        const OLCUC = 0o000_002;
        const ONLCR = 0o000_004;
        const OCRNL = 0o000_010;
        const ONOCR = 0o000_020;
        const ONLRET = 0o000_040;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[repr(transparent)]
    pub struct ControlFlags: u32 {
        const CS5 = 0o000_000;
        const CS6 = 0o000_020;
        const CS7 = 0o000_040;
        const CS8 = 0o000_060;
        const CSTOPB = 0o000_100;
        const CREAD = 0o000_200;
        const PARENB = 0o000_400;
        const PARODD = 0o001_000;
        const HUPCL = 0o002_000;
        const CLOCAL = 0o004_000;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[repr(transparent)]
    pub struct LocalFlags: u32 {
        const ISIG = 0o000_001;
        const ICANON = 0o000_002;
        const XCASE = 0o000_004;
        const ECHO = 0o000_010;
        const ECHOE = 0o000_020;
        const ECHOK = 0o000_040;
        const ECHONL = 0o000_100;
        const NOFLSH = 0o000_200;
        const TOSTOP = 0o000_400;
        const IEXTEN = 0o001_000;
    }
}

/// Terminal settings, laid out the way `TCGETS`/`TCSETS` transfer them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod)]
#[repr(C)]
pub struct Termios {
    pub c_iflag: u32,
    pub c_oflag: u32,
    pub c_cflag: u32,
    pub c_lflag: u32,
    pub c_cc: [u8; NCCS],
}

impl Default for Termios {
    fn default() -> Self {
        let mut c_cc = [0; NCCS];
        c_cc[VEOF] = 4; // ^D
        c_cc[VEOL] = 0;
        c_cc[VERASE] = 0x7f;
        c_cc[VINTR] = 3; // ^C
        c_cc[VKILL] = 0x15; // ^U
        c_cc[VMIN] = 1;
        c_cc[VQUIT] = 0x1c; // ^\
        c_cc[VSTART] = 0x11; // ^Q
        c_cc[VSTOP] = 0x13; // ^S
        c_cc[VSUSP] = 0x1a; // ^Z
        c_cc[VTIME] = 0;
        c_cc[VLNEXT] = 0x16; // ^V
        c_cc[VWERASE] = 0x17; // ^W
        Self {
            c_iflag: (InputFlags::ICRNL | InputFlags::BRKINT).bits(),
            c_oflag: (OutputFlags::OPOST | OutputFlags::ONLCR).bits(),
            c_cflag: (ControlFlags::CREAD | ControlFlags::CS8).bits(),
            c_lflag: (LocalFlags::ISIG
                | LocalFlags::ICANON
                | LocalFlags::ECHO
                | LocalFlags::ECHOE
                | LocalFlags::ECHOK
                | LocalFlags::IEXTEN)
                .bits(),
            c_cc,
        }
    }
}

impl Termios {
    #[must_use]
    pub const fn iflag(&self) -> InputFlags {
        InputFlags::from_bits_retain(self.c_iflag)
    }

    #[must_use]
    pub const fn oflag(&self) -> OutputFlags {
        OutputFlags::from_bits_retain(self.c_oflag)
    }

    #[must_use]
    pub const fn cflag(&self) -> ControlFlags {
        ControlFlags::from_bits_retain(self.c_cflag)
    }

    #[must_use]
    pub const fn lflag(&self) -> LocalFlags {
        LocalFlags::from_bits_retain(self.c_lflag)
    }

    pub fn set_lflag(&mut self, flags: LocalFlags) {
        self.c_lflag = flags.bits();
    }

    pub fn set_iflag(&mut self, flags: InputFlags) {
        self.c_iflag = flags.bits();
    }

    pub fn set_oflag(&mut self, flags: OutputFlags) {
        self.c_oflag = flags.bits();
    }

    /// Control character at `index`, or `None` when the slot is disabled.
    #[must_use]
    pub const fn cc(&self, index: usize) -> Option<u8> {
        match self.c_cc[index] {
            0 => None,
            c => Some(c),
        }
    }

    /// Switches to raw mode, like `cfmakeraw`.
    pub fn make_raw(&mut self) {
        let mut iflag = self.iflag();
        iflag.remove(
            InputFlags::IGNBRK
                | InputFlags::BRKINT
                | InputFlags::ISTRIP
                | InputFlags::INLCR
                | InputFlags::IGNCR
                | InputFlags::ICRNL
                | InputFlags::IXON,
        );
        self.set_iflag(iflag);
        let mut oflag = self.oflag();
        oflag.remove(OutputFlags::OPOST);
        self.set_oflag(oflag);
        let mut lflag = self.lflag();
        lflag.remove(
            LocalFlags::ECHO
                | LocalFlags::ECHONL
                | LocalFlags::ICANON
                | LocalFlags::ISIG
                | LocalFlags::IEXTEN,
        );
        self.set_lflag(lflag);
        self.c_cflag = (self.cflag() | ControlFlags::CS8).bits();
    }
}

/// Terminal window size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod)]
#[repr(C)]
pub struct Winsize {
    pub ws_row: u16,
    pub ws_col: u16,
    pub ws_xpixel: u16,
    pub ws_ypixel: u16,
}

impl Default for Winsize {
    fn default() -> Self {
        Self {
            ws_row: 25,
            ws_col: 80,
            ws_xpixel: 0,
            ws_ypixel: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_cooked() {
        let t = Termios::default();
        assert!(t.lflag().contains(LocalFlags::ICANON | LocalFlags::ECHO));
        assert!(t.oflag().contains(OutputFlags::ONLCR));
        assert_eq!(t.cc(VINTR), Some(3));
        assert_eq!(t.cc(VEOL), None);
    }

    #[test]
    fn raw_mode_clears_canonical_processing() {
        let mut t = Termios::default();
        t.make_raw();
        assert!(!t.lflag().intersects(LocalFlags::ICANON | LocalFlags::ECHO | LocalFlags::ISIG));
        assert!(!t.oflag().contains(OutputFlags::OPOST));
        assert!(!t.iflag().contains(InputFlags::ICRNL));
    }
}
