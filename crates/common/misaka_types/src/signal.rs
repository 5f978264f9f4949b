use core::fmt;

use strum::{Display, FromRepr};

/// Number of signal slots, including the unused slot 0.
pub const NSIG: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromRepr, Display)]
#[repr(u32)]
pub enum Signal {
    #[strum(serialize = "SIGHUP")]
    Hup = 1,
    #[strum(serialize = "SIGINT")]
    Int = 2,
    #[strum(serialize = "SIGQUIT")]
    Quit = 3,
    #[strum(serialize = "SIGILL")]
    Ill = 4,
    #[strum(serialize = "SIGTRAP")]
    Trap = 5,
    #[strum(serialize = "SIGABRT")]
    Abrt = 6,
    #[strum(serialize = "SIGEMT")]
    Emt = 7,
    #[strum(serialize = "SIGFPE")]
    Fpe = 8,
    #[strum(serialize = "SIGKILL")]
    Kill = 9,
    #[strum(serialize = "SIGBUS")]
    Bus = 10,
    #[strum(serialize = "SIGSEGV")]
    Segv = 11,
    #[strum(serialize = "SIGSYS")]
    Sys = 12,
    #[strum(serialize = "SIGPIPE")]
    Pipe = 13,
    #[strum(serialize = "SIGALRM")]
    Alrm = 14,
    #[strum(serialize = "SIGTERM")]
    Term = 15,
    #[strum(serialize = "SIGUSR1")]
    Usr1 = 16,
    #[strum(serialize = "SIGUSR2")]
    Usr2 = 17,
    #[strum(serialize = "SIGCHLD")]
    Chld = 18,
    #[strum(serialize = "SIGPWR")]
    Pwr = 19,
    #[strum(serialize = "SIGWINCH")]
    Winch = 20,
    #[strum(serialize = "SIGURG")]
    Urg = 21,
    #[strum(serialize = "SIGPOLL")]
    Poll = 22,
    #[strum(serialize = "SIGSTOP")]
    Stop = 23,
    #[strum(serialize = "SIGTSTP")]
    Tstp = 24,
    #[strum(serialize = "SIGCONT")]
    Cont = 25,
    #[strum(serialize = "SIGTTIN")]
    Ttin = 26,
    #[strum(serialize = "SIGTTOU")]
    Ttou = 27,
    #[strum(serialize = "SIGVTALRM")]
    Vtalrm = 28,
    #[strum(serialize = "SIGPROF")]
    Prof = 29,
    #[strum(serialize = "SIGXCPU")]
    Xcpu = 30,
    #[strum(serialize = "SIGXFSZ")]
    Xfsz = 31,
}

/// What happens to a process when a signal arrives with the default
/// disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAction {
    Terminate,
    CoreDump,
    Ignore,
    Stop,
    Continue,
}

impl Signal {
    #[must_use]
    pub const fn number(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub const fn default_action(self) -> DefaultAction {
        match self {
            Self::Chld | Self::Pwr | Self::Winch | Self::Urg => DefaultAction::Ignore,
            Self::Stop | Self::Tstp | Self::Ttin | Self::Ttou => DefaultAction::Stop,
            Self::Cont => DefaultAction::Continue,
            Self::Quit
            | Self::Ill
            | Self::Trap
            | Self::Abrt
            | Self::Emt
            | Self::Fpe
            | Self::Bus
            | Self::Segv
            | Self::Sys
            | Self::Xcpu
            | Self::Xfsz => DefaultAction::CoreDump,
            _ => DefaultAction::Terminate,
        }
    }

    /// Signals that can be neither caught, ignored nor blocked.
    #[must_use]
    pub const fn is_unblockable(self) -> bool {
        matches!(self, Self::Kill | Self::Stop)
    }
}

/// A set of signals.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct SigSet(u64);

impl fmt::Debug for SigSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl SigSet {
    pub const EMPTY: Self = Self(0);

    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits & Self::all().0)
    }

    #[must_use]
    pub const fn all() -> Self {
        // bit 0 is never a signal
        Self(((1u64 << NSIG) - 1) & !1)
    }

    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn with(self, sig: Signal) -> Self {
        Self(self.0 | (1 << sig.number()))
    }

    #[must_use]
    pub const fn contains(self, sig: Signal) -> bool {
        self.0 & (1 << sig.number()) != 0
    }

    pub fn insert(&mut self, sig: Signal) {
        self.0 |= 1 << sig.number();
    }

    pub fn remove(&mut self, sig: Signal) {
        self.0 &= !(1 << sig.number());
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    #[must_use]
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Lowest-numbered signal in the set.
    #[must_use]
    pub fn first(self) -> Option<Signal> {
        if self.0 == 0 {
            return None;
        }
        Signal::from_repr(self.0.trailing_zeros())
    }

    pub fn iter(self) -> impl Iterator<Item = Signal> {
        (1..NSIG as u32)
            .filter_map(Signal::from_repr)
            .filter(move |sig| self.contains(*sig))
    }
}

impl FromIterator<Signal> for SigSet {
    fn from_iter<T: IntoIterator<Item = Signal>>(iter: T) -> Self {
        iter.into_iter().fold(Self::EMPTY, Self::with)
    }
}

/// `how` argument of `sigprocmask`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u32)]
pub enum SigHow {
    Block = 0,
    Unblock = 1,
    SetMask = 2,
}
