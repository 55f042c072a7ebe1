//! Content-aware erase/program decision.
//!
//! NOR flash can only clear bits when programming. The only way to get a `1`
//! back is to erase the whole sector. Comparing the wanted contents with what
//! is currently stored tells which of the two (slow, wearing) operations are
//! actually required for a window.

/// Value of an erased flash byte.
pub const ERASED: u8 = 0xff;

/// What a flash window needs to end up holding the candidate data.
///
/// The discriminants are the 2-bit encoding used on the wire by fused
/// read-and-compare SPI controllers: bit 0 is "erase", bit 1 is "program".
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum VerifyOutcome {
    /// Flash already holds the candidate.
    Match = 0,
    /// Erasing is enough, candidate is all `0xff`.
    Erase = 1,
    /// Only programming is needed, no bit has to go from `0` to `1`.
    Program = 2,
    /// Erase, then program.
    EraseProgram = 3,
}

impl VerifyOutcome {
    /// Decode the 2-bit encoding. Upper bits are ignored.
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => VerifyOutcome::Match,
            1 => VerifyOutcome::Erase,
            2 => VerifyOutcome::Program,
            _ => VerifyOutcome::EraseProgram,
        }
    }

    /// 2-bit encoding.
    pub fn bits(self) -> u8 {
        self as u8
    }

    /// `true` if at least one bit must be raised back to `1`.
    pub fn needs_erase(self) -> bool {
        self.bits() & 1 != 0
    }

    /// `true` if a program pass is still required.
    pub fn needs_program(self) -> bool {
        self.bits() & 2 != 0
    }
}

/// Running comparison of a candidate against flash contents.
///
/// Feed it the window piece by piece with [`update()`](Verdict::update), in
/// the same order the bytes come off the bus, then ask for the
/// [`outcome()`](Verdict::outcome).
#[derive(Debug, Default, Clone, Copy)]
pub struct Verdict {
    erase: bool,
    program: bool,
    non_blank: bool,
}

impl Verdict {
    /// Empty verdict, equivalent to comparing zero bytes.
    pub const fn new() -> Self {
        Self {
            erase: false,
            program: false,
            non_blank: false,
        }
    }

    /// Fold one byte pair into the verdict.
    #[inline]
    pub fn byte(&mut self, want: u8, have: u8) {
        // a 1 wanted where flash holds a 0 can only come back through erase
        self.erase |= (want & have) != want;
        self.program |= want != have;
        self.non_blank |= want != ERASED;
    }

    /// Fold a run of bytes. Extra bytes in the longer slice are ignored.
    pub fn update(&mut self, want: &[u8], have: &[u8]) {
        for (w, h) in want.iter().zip(have) {
            self.byte(*w, *h);
        }
    }

    /// Final classification of everything fed so far.
    pub fn outcome(&self) -> VerifyOutcome {
        if self.erase {
            if self.non_blank {
                VerifyOutcome::EraseProgram
            } else {
                VerifyOutcome::Erase
            }
        } else if self.program {
            VerifyOutcome::Program
        } else {
            VerifyOutcome::Match
        }
    }
}

/// Classify `want` against `have` in one go.
pub fn classify(want: &[u8], have: &[u8]) -> VerifyOutcome {
    let mut v = Verdict::new();
    v.update(want, have);
    v.outcome()
}
