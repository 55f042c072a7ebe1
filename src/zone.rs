//! Flash partitions selectable through the DFU interface alternate setting.

/// Flash device sharing the SPI bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum FlashChip {
    /// On-board configuration flash.
    Internal,
    /// Flash on the removable cartridge.
    Cartridge,
}

/// One updatable flash region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Zone {
    /// Device the region lives on.
    pub chip: FlashChip,
    /// First byte of the region.
    pub start: u32,
    /// One past the last byte of the region.
    pub end: u32,
    /// Reported to the host as the alternate setting's interface string.
    pub name: &'static str,
}

impl Zone {
    /// Region size in bytes.
    pub const fn len(&self) -> u32 {
        self.end - self.start
    }

    /// `true` for a zero-sized region.
    pub const fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Immutable list of zones indexed by alternate setting.
#[derive(Debug, Clone, Copy)]
pub struct ZoneTable(&'static [Zone]);

/// Most alternate settings a [`ZoneTable`] may describe.
pub const MAX_ZONES: usize = 8;

const DEFAULT_ZONES: [Zone; 7] = [
    Zone {
        chip: FlashChip::Internal,
        start: 0x0020_0000,
        end: 0x0100_0000,
        name: "user bitstream",
    },
    Zone {
        chip: FlashChip::Internal,
        start: 0x0034_0000,
        end: 0x0038_0000,
        name: "fw_jump",
    },
    Zone {
        chip: FlashChip::Internal,
        start: 0x0038_0000,
        end: 0x0100_0000,
        name: "u-boot",
    },
    Zone {
        chip: FlashChip::Internal,
        start: 0x0040_0000,
        end: 0x0100_0000,
        name: "user data",
    },
    Zone {
        chip: FlashChip::Internal,
        start: 0x0080_0000,
        end: 0x0100_0000,
        name: "user data (upper)",
    },
    Zone {
        chip: FlashChip::Internal,
        start: 0x0000_0000,
        end: 0x0020_0000,
        name: "bootloader bitstream",
    },
    // Smaller than a sector: erasing it also clears cartridge bytes
    // 0x100..0x1000.
    Zone {
        chip: FlashChip::Cartridge,
        start: 0x0000_0000,
        end: 0x0000_0100,
        name: "RTC",
    },
];

impl ZoneTable {
    /// Partition scheme of the reference board.
    pub const DEFAULT: ZoneTable = ZoneTable(&DEFAULT_ZONES);

    /// Wrap a static table.
    ///
    /// Panics at compile time (when used in a `const`) if the table is empty
    /// or longer than [`MAX_ZONES`].
    pub const fn new(zones: &'static [Zone]) -> Self {
        assert!(!zones.is_empty() && zones.len() <= MAX_ZONES);
        ZoneTable(zones)
    }

    /// Zone for an alternate setting, `None` if out of range.
    pub fn get(&self, alt: u8) -> Option<&Zone> {
        self.0.get(alt as usize)
    }

    /// Number of alternate settings.
    pub const fn len(&self) -> usize {
        self.0.len()
    }

    /// Always `false` for a table built with [`new()`](ZoneTable::new).
    pub const fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Zones in alternate setting order.
    pub fn iter(&self) -> impl Iterator<Item = &Zone> {
        self.0.iter()
    }
}
