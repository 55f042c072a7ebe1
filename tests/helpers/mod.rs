#![allow(dead_code)]
use spiflash_dfu::*;
use usb_device::class::UsbClass;
use usbd_class_tester::prelude::*;

// State
pub const APP_IDLE: u8 = 0;
pub const APP_DETACH: u8 = 1;
pub const DFU_IDLE: u8 = 2;
pub const DFU_DNLOAD_SYNC: u8 = 3;
pub const DFU_DN_BUSY: u8 = 4;
pub const DFU_DNLOAD_IDLE: u8 = 5;
pub const DFU_MANIFEST_SYNC: u8 = 6;
pub const DFU_MANIFEST: u8 = 7;
pub const DFU_MANIFEST_WAIT_RESET: u8 = 8;
pub const DFU_UPLOAD_IDLE: u8 = 9;
pub const DFU_ERROR: u8 = 10;

pub const STATUS_OK: u8 = 0x00;
pub const STATUS_ERR_USBR: u8 = 0x0C;
pub const STATUS_ERR_UNKNOWN: u8 = 0x0E;

pub const POLL_TIMEOUT: u32 = 5;

pub const ALT_BOOTLOADER: u16 = 5;
pub const ALT_RTC: u16 = 6;

pub trait DeviceExt<C> {
    fn read(
        &mut self,
        cls: &mut C,
        req: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> AnyResult<Vec<u8>>;
    fn write(
        &mut self,
        cls: &mut C,
        req: u8,
        value: u16,
        index: u16,
        length: u16,
        data: &[u8],
    ) -> AnyResult<Vec<u8>>;

    fn detach(&mut self, cls: &mut C, timeout: u16) -> AnyResult<Vec<u8>>;
    fn download(&mut self, cls: &mut C, block_num: u16, data: &[u8]) -> AnyResult<Vec<u8>>;
    fn upload(&mut self, cls: &mut C, block_num: u16, length: usize) -> AnyResult<Vec<u8>>;
    fn get_status(&mut self, cls: &mut C) -> AnyResult<Vec<u8>>;
    fn clear_status(&mut self, cls: &mut C) -> AnyResult<Vec<u8>>;
    fn get_state(&mut self, cls: &mut C) -> AnyResult<Vec<u8>>;
    fn abort(&mut self, cls: &mut C) -> AnyResult<Vec<u8>>;
    fn set_interface(&mut self, cls: &mut C, alt: u16) -> AnyResult<Vec<u8>>;
}

impl<'a, C, M> DeviceExt<C> for Device<'a, C, M>
where
    C: UsbClass<EmulatedUsbBus>,
    M: UsbDeviceCtx<C<'a> = C>,
{
    fn read(
        &mut self,
        cls: &mut C,
        req: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> AnyResult<Vec<u8>> {
        self.control_read(
            cls,
            CtrRequestType::to_host().class().interface(),
            req,
            value,
            index,
            length,
        )
    }

    fn write(
        &mut self,
        cls: &mut C,
        req: u8,
        value: u16,
        index: u16,
        length: u16,
        data: &[u8],
    ) -> AnyResult<Vec<u8>> {
        self.control_write(
            cls,
            CtrRequestType::to_device().class().interface(),
            req,
            value,
            index,
            length,
            data,
        )
    }

    fn detach(&mut self, cls: &mut C, timeout: u16) -> AnyResult<Vec<u8>> {
        self.write(cls, 0x0, timeout, 0, 0, &[])
    }

    fn download(&mut self, cls: &mut C, block_num: u16, data: &[u8]) -> AnyResult<Vec<u8>> {
        if data.len() > u16::MAX as usize {
            return Err(AnyUsbError::DataConversion);
        }
        self.write(cls, 0x1, block_num, 0, data.len() as u16, data)
    }

    fn upload(&mut self, cls: &mut C, block_num: u16, length: usize) -> AnyResult<Vec<u8>> {
        if length > u16::MAX as usize {
            return Err(AnyUsbError::DataConversion);
        }
        self.read(cls, 0x2, block_num, 0, length as u16)
    }

    fn get_status(&mut self, cls: &mut C) -> AnyResult<Vec<u8>> {
        self.read(cls, 0x3, 0, 0, 6)
    }

    fn clear_status(&mut self, cls: &mut C) -> AnyResult<Vec<u8>> {
        self.write(cls, 0x4, 0, 0, 0, &[])
    }

    fn get_state(&mut self, cls: &mut C) -> AnyResult<Vec<u8>> {
        self.read(cls, 0x5, 0, 0, 1)
    }

    fn abort(&mut self, cls: &mut C) -> AnyResult<Vec<u8>> {
        self.write(cls, 0x6, 0, 0, 0, &[])
    }

    fn set_interface(&mut self, cls: &mut C, alt: u16) -> AnyResult<Vec<u8>> {
        self.control_write(
            cls,
            CtrRequestType::to_device().interface(),
            0x0B,
            alt,
            0,
            0,
            &[],
        )
    }
}

pub fn status(status: u8, poll_timeout: u32, state: u8) -> [u8; 6] {
    let t = poll_timeout.to_le_bytes();
    [status, t[0], t[1], t[2], state, 0]
}

const INTERNAL_SIZE: usize = 0x0100_0000;
const CARTRIDGE_SIZE: usize = 0x1000;

/// Two NOR chips in RAM. Never busy.
pub struct RamFlash {
    pub internal: Vec<u8>,
    pub cartridge: Vec<u8>,
    selected: FlashChip,
    pub erases: usize,
    pub programs: usize,
}

impl RamFlash {
    pub fn new() -> Self {
        Self {
            internal: vec![0xff; INTERNAL_SIZE],
            cartridge: vec![0xff; CARTRIDGE_SIZE],
            selected: FlashChip::Internal,
            erases: 0,
            programs: 0,
        }
    }

    fn mem(&mut self) -> &mut Vec<u8> {
        match self.selected {
            FlashChip::Internal => &mut self.internal,
            FlashChip::Cartridge => &mut self.cartridge,
        }
    }
}

impl DfuFlash for RamFlash {
    fn select(&mut self, chip: FlashChip) {
        self.selected = chip;
    }

    fn read(&mut self, addr: u32, dst: &mut [u8]) -> Result<(), FlashError> {
        let a = addr as usize;
        let src = self.mem().get(a..a + dst.len()).ok_or(FlashError::Address)?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn page_program(&mut self, addr: u32, src: &[u8]) -> Result<(), FlashError> {
        self.programs += 1;
        let a = addr as usize;
        let dst = self.mem().get_mut(a..a + src.len()).ok_or(FlashError::Address)?;
        for (d, s) in dst.iter_mut().zip(src) {
            *d &= *s;
        }
        Ok(())
    }

    fn erase(&mut self, addr: u32, size: EraseSize) -> Result<(), FlashError> {
        self.erases += 1;
        let mem = self.mem();
        let start = (addr as usize).min(mem.len());
        let end = (start + size.bytes() as usize).min(mem.len());
        mem[start..end].fill(0xff);
        Ok(())
    }

    fn read_status(&mut self) -> Result<u8, FlashError> {
        Ok(0)
    }

    fn write_enable(&mut self) -> Result<(), FlashError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct RebootCount(pub u32);

impl Reboot for RebootCount {
    fn reboot(&mut self) {
        self.0 += 1;
    }
}
