//! Terminal line discipline.
//!
//! Pure byte processing: the driver feeds input bytes one at a time and
//! carries out the returned effects (bytes for the reader, echo, signals,
//! end of file) outside of its state lock.

use misaka_kernel_params::MAX_CANON;
use misaka_types::{
    signal::Signal,
    termios::{
        InputFlags, LocalFlags, OutputFlags, Termios, VEOF, VEOL, VERASE, VINTR, VKILL, VLNEXT,
        VQUIT, VSUSP, VWERASE,
    },
};

/// What processing one input byte asks the driver to do.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct InputEffects {
    /// Bytes that become readable on the slave side.
    pub to_reader: Vec<u8>,
    /// Bytes to echo back to the master, before output processing.
    pub echo: Vec<u8>,
    /// Signal for the foreground process group.
    pub signal: Option<Signal>,
    /// End of file for the slave reader.
    pub eof: bool,
}

#[derive(Debug)]
pub struct LineDiscipline {
    /// Line being edited; grows past `MAX_CANON` when needed.
    canon: Vec<u8>,
    verbatim: bool,
}

impl Default for LineDiscipline {
    fn default() -> Self {
        Self::new()
    }
}

fn is_control(c: u8) -> bool {
    c < 0x20 || c == 0x7f
}

/// Control characters echo as `^X`.
fn push_caret(out: &mut Vec<u8>, c: u8) {
    out.push(b'^');
    out.push((b'@'.wrapping_add(c)) % 128);
}

impl LineDiscipline {
    pub fn new() -> Self {
        Self {
            canon: Vec::with_capacity(MAX_CANON),
            verbatim: false,
        }
    }

    /// Bytes of the line being edited.
    pub fn pending(&self) -> &[u8] {
        &self.canon
    }

    pub fn clear(&mut self) {
        self.canon.clear();
        self.verbatim = false;
    }

    /// Hands over the line being edited, e.g. when leaving canonical mode.
    pub fn take(&mut self) -> Vec<u8> {
        self.verbatim = false;
        core::mem::take(&mut self.canon)
    }

    fn erase_one(&mut self, termios: &Termios, visual: LocalFlags, fx: &mut InputEffects) {
        let Some(c) = self.canon.pop() else {
            return;
        };
        let lflag = termios.lflag();
        if lflag.contains(LocalFlags::ECHO) && lflag.contains(visual) {
            let width = if is_control(c) { 2 } else { 1 };
            for _ in 0..width {
                fx.echo.extend_from_slice(b"\x08 \x08");
            }
        }
    }

    fn dump(&mut self, fx: &mut InputEffects) {
        fx.to_reader.append(&mut self.canon);
    }

    /// Processes one byte typed on the master side.
    pub fn input(&mut self, termios: &Termios, c: u8, fx: &mut InputEffects) {
        let iflag = termios.iflag();
        let lflag = termios.lflag();
        let echo = lflag.contains(LocalFlags::ECHO);

        let mut c = c;
        if iflag.contains(InputFlags::ISTRIP) {
            c &= 0x7f;
        }
        if iflag.contains(InputFlags::IGNCR) && c == b'\r' {
            return;
        }
        if iflag.contains(InputFlags::INLCR) && c == b'\n' {
            c = b'\r';
        } else if iflag.contains(InputFlags::ICRNL) && c == b'\r' {
            c = b'\n';
        }

        if self.verbatim {
            self.verbatim = false;
            self.canon.push(c);
            if echo {
                if is_control(c) {
                    push_caret(&mut fx.echo, c);
                } else {
                    fx.echo.push(c);
                }
            }
            return;
        }

        let is = |index: usize| termios.cc(index) == Some(c);

        if lflag.contains(LocalFlags::ISIG) {
            let sig = if is(VINTR) {
                Some(Signal::Int)
            } else if is(VQUIT) {
                Some(Signal::Quit)
            } else if is(VSUSP) {
                Some(Signal::Tstp)
            } else {
                None
            };
            if let Some(sig) = sig {
                if echo {
                    push_caret(&mut fx.echo, c);
                    fx.echo.push(b'\n');
                }
                self.canon.clear();
                fx.signal = Some(sig);
                return;
            }
        }

        if !lflag.contains(LocalFlags::ICANON) {
            if echo {
                fx.echo.push(c);
            }
            fx.to_reader.push(c);
            return;
        }

        let iexten = lflag.contains(LocalFlags::IEXTEN);
        if iexten && is(VLNEXT) {
            self.verbatim = true;
            if echo {
                fx.echo.extend_from_slice(b"^\x08");
            }
        } else if is(VKILL) {
            while !self.canon.is_empty() {
                self.erase_one(termios, LocalFlags::ECHOK, fx);
            }
        } else if is(VERASE) {
            self.erase_one(termios, LocalFlags::ECHOE, fx);
        } else if iexten && is(VWERASE) {
            while self.canon.last() == Some(&b' ') {
                self.erase_one(termios, LocalFlags::ECHOE, fx);
            }
            while self.canon.last().is_some_and(|&b| b != b' ') {
                self.erase_one(termios, LocalFlags::ECHOE, fx);
            }
        } else if is(VEOF) {
            if self.canon.is_empty() {
                fx.eof = true;
            } else {
                self.dump(fx);
            }
        } else {
            self.canon.push(c);
            if echo {
                if is_control(c) && c != b'\n' {
                    push_caret(&mut fx.echo, c);
                } else {
                    fx.echo.push(c);
                }
            }
            if c == b'\n' || is(VEOL) {
                if !echo && lflag.contains(LocalFlags::ECHONL) {
                    fx.echo.push(c);
                }
                self.dump(fx);
            }
        }
    }
}

/// Applies output processing to one byte written by the slave side.
pub fn output(termios: &Termios, c: u8, out: &mut Vec<u8>) {
    let oflag = termios.oflag();
    if !oflag.contains(OutputFlags::OPOST) {
        out.push(c);
        return;
    }
    match c {
        b'\n' if oflag.contains(OutputFlags::ONLCR) => out.extend_from_slice(b"\r\n"),
        b'\r' if oflag.contains(OutputFlags::OCRNL) => out.push(b'\n'),
        c if oflag.contains(OutputFlags::OLCUC) => out.push(c.to_ascii_uppercase()),
        c => out.push(c),
    }
}
