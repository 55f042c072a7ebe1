//! RAM model of two SPI NOR chips for unit tests.

use crate::flash::{DfuFlash, EraseSize, FlashError, ManifestPolicy, Reboot, PAGE_SIZE, STATUS_BUSY};
use crate::zone::FlashChip;

const INTERNAL_SIZE: usize = 0x0100_0000;
const CARTRIDGE_SIZE: usize = 0x0001_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SimOp {
    Erase(FlashChip, u32, u32),
    Program(FlashChip, u32, usize),
}

pub(crate) struct SimFlash {
    internal: Vec<u8>,
    cartridge: Vec<u8>,
    selected: FlashChip,
    wel: bool,
    busy: u8,
    /// Status polls reporting busy after each erase or program.
    pub busy_polls: u8,
    /// Address and mask of bits that read back as zero whatever happens.
    pub stuck: Option<(u32, u8)>,
    /// Page programs silently ignored before the next one takes effect.
    pub drop_programs: u32,
    /// Status reads failing with a bus error.
    pub fail_status: u32,
    pub log: Vec<SimOp>,
}

impl SimFlash {
    pub fn new() -> Self {
        Self {
            internal: vec![0xff; INTERNAL_SIZE],
            cartridge: vec![0xff; CARTRIDGE_SIZE],
            selected: FlashChip::Internal,
            wel: false,
            busy: 0,
            busy_polls: 0,
            stuck: None,
            drop_programs: 0,
            fail_status: 0,
            log: Vec::new(),
        }
    }

    pub fn mem(&self, chip: FlashChip) -> &[u8] {
        match chip {
            FlashChip::Internal => &self.internal,
            FlashChip::Cartridge => &self.cartridge,
        }
    }

    fn mem_mut(&mut self, chip: FlashChip) -> &mut [u8] {
        match chip {
            FlashChip::Internal => &mut self.internal,
            FlashChip::Cartridge => &mut self.cartridge,
        }
    }

    /// Overwrite contents directly, bypassing erase rules.
    pub fn fill(&mut self, chip: FlashChip, addr: u32, data: &[u8]) {
        let a = addr as usize;
        self.mem_mut(chip)[a..a + data.len()].copy_from_slice(data);
    }

    pub fn erases(&self) -> usize {
        self.log.iter().filter(|op| matches!(op, SimOp::Erase(..))).count()
    }

    pub fn programs(&self) -> usize {
        self.program_lens().len()
    }

    pub fn program_lens(&self) -> Vec<usize> {
        self.log
            .iter()
            .filter_map(|op| match op {
                SimOp::Program(_, _, len) => Some(*len),
                _ => None,
            })
            .collect()
    }

    pub fn bus_writes(&self) -> usize {
        self.log.len()
    }

    fn apply_stuck(&mut self) {
        if let (FlashChip::Internal, Some((addr, mask))) = (self.selected, self.stuck) {
            self.internal[addr as usize] &= !mask;
        }
    }

    fn start_write(&mut self) -> Result<(), FlashError> {
        if !self.wel {
            return Err(FlashError::Bus);
        }
        self.wel = false;
        self.busy = self.busy_polls;
        Ok(())
    }
}

impl DfuFlash for SimFlash {
    fn select(&mut self, chip: FlashChip) {
        self.selected = chip;
    }

    fn read(&mut self, addr: u32, dst: &mut [u8]) -> Result<(), FlashError> {
        let mem = self.mem(self.selected);
        let a = addr as usize;
        let src = mem.get(a..a + dst.len()).ok_or(FlashError::Address)?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn page_program(&mut self, addr: u32, src: &[u8]) -> Result<(), FlashError> {
        let a = addr as usize;
        assert!(src.len() <= PAGE_SIZE);
        assert!(a % PAGE_SIZE + src.len() <= PAGE_SIZE, "program crosses a page");
        assert_eq!(self.busy, 0, "program while busy");
        self.start_write()?;
        self.log.push(SimOp::Program(self.selected, addr, src.len()));

        if self.drop_programs > 0 {
            self.drop_programs -= 1;
            return Ok(());
        }
        let chip = self.selected;
        let dst = self
            .mem_mut(chip)
            .get_mut(a..a + src.len())
            .ok_or(FlashError::Address)?;
        for (d, s) in dst.iter_mut().zip(src) {
            *d &= *s;
        }
        self.apply_stuck();
        Ok(())
    }

    fn erase(&mut self, addr: u32, size: EraseSize) -> Result<(), FlashError> {
        assert_eq!(addr % size.bytes(), 0, "unaligned erase");
        assert_eq!(self.busy, 0, "erase while busy");
        self.start_write()?;
        self.log.push(SimOp::Erase(self.selected, addr, size.bytes()));

        let chip = self.selected;
        let mem = self.mem_mut(chip);
        let start = (addr as usize).min(mem.len());
        let end = (start + size.bytes() as usize).min(mem.len());
        mem[start..end].fill(0xff);
        self.apply_stuck();
        Ok(())
    }

    fn read_status(&mut self) -> Result<u8, FlashError> {
        if self.fail_status > 0 {
            self.fail_status -= 1;
            return Err(FlashError::Bus);
        }
        if self.busy > 0 {
            self.busy -= 1;
            Ok(STATUS_BUSY)
        } else {
            Ok(0)
        }
    }

    fn write_enable(&mut self) -> Result<(), FlashError> {
        self.wel = true;
        Ok(())
    }
}

/// `DfuFlash` over a wrapped [`SimFlash`] with different tuning constants.
macro_rules! sim_variant {
    ($(#[$meta:meta])* $name:ident { $($tuning:tt)* }) => {
        $(#[$meta])*
        pub(crate) struct $name(pub SimFlash);

        impl DfuFlash for $name {
            $($tuning)*

            fn select(&mut self, chip: FlashChip) {
                self.0.select(chip)
            }

            fn read(&mut self, addr: u32, dst: &mut [u8]) -> Result<(), FlashError> {
                self.0.read(addr, dst)
            }

            fn page_program(&mut self, addr: u32, src: &[u8]) -> Result<(), FlashError> {
                self.0.page_program(addr, src)
            }

            fn erase(&mut self, addr: u32, size: EraseSize) -> Result<(), FlashError> {
                self.0.erase(addr, size)
            }

            fn read_status(&mut self) -> Result<u8, FlashError> {
                self.0.read_status()
            }

            fn write_enable(&mut self) -> Result<(), FlashError> {
                self.0.write_enable()
            }
        }
    };
}

sim_variant! {
    /// Same chips, with `dfuMANIFEST` reported while the queue drains.
    ReportingFlash {
        const MANIFEST_POLICY: ManifestPolicy = ManifestPolicy::Report;
        const TICK_DIVIDER: u8 = 2;
    }
}

sim_variant! {
    /// Same chips, erased in 64 KiB blocks.
    BlockFlash {
        const ERASE_SIZE: EraseSize = EraseSize::Block64K;
    }
}

#[derive(Debug, Default)]
pub(crate) struct RebootCounter(pub u32);

impl Reboot for RebootCounter {
    fn reboot(&mut self) {
        self.0 += 1;
    }
}
