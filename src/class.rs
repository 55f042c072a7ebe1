use core::cmp::min;
use core::marker::PhantomData;
use usb_device::{class_prelude::*, control::Request};

use crate::engine::Tick;
use crate::error::DfuError;
use crate::flash::{DfuFlash, Reboot};
use crate::session::{DfuRequest, DfuSession, DfuState};
use crate::zone::MAX_ZONES;

const USB_CLASS_APPLICATION_SPECIFIC: u8 = 0xFE;
const USB_SUBCLASS_DFU: u8 = 0x01;
const USB_PROTOCOL_DFU_MODE: u8 = 0x02;

const DESC_DESCTYPE_DFU: u8 = 0x21;

/// DFU protocol USB class implementation for usb-device library.
///
/// Exposes one alternate setting per zone of [`DfuFlash::ZONES`]. Data
/// received with `DFU_DNLOAD` is only queued from `usb_dev.poll()`, flash is
/// written by [`tick()`](DfuClass::tick), which the main loop must call
/// regularly.
pub struct DfuClass<B: UsbBus, F: DfuFlash, R: Reboot> {
    if_num: InterfaceNumber,
    // one per zone, the rest unallocated
    strings: [Option<StringIndex>; MAX_ZONES],
    session: DfuSession<F, R>,
    _bus: PhantomData<B>,
}

impl<B: UsbBus, F: DfuFlash, R: Reboot> UsbClass<B> for DfuClass<B, F, R> {
    fn get_configuration_descriptors(
        &self,
        writer: &mut DescriptorWriter,
    ) -> usb_device::Result<()> {
        for alt in 0..F::ZONES.len() {
            writer.interface_alt(
                self.if_num,
                alt as u8,
                USB_CLASS_APPLICATION_SPECIFIC,
                USB_SUBCLASS_DFU,
                USB_PROTOCOL_DFU_MODE,
                self.strings[alt],
            )?;
        }

        // DFU Functional descriptor
        writer.write(
            DESC_DESCTYPE_DFU,
            &[
                // bmAttributes
                // Bit 3: bitWillDetach
                0x8 |
                    // Bit 2: bitManifestationTolerant
                    0x4 |
                    // Bit 1: bitCanUpload
                    0x2 |
                    // Bit 0: bitCanDnload
                    0x1,
                // wDetachTimeOut
                (F::DETACH_TIMEOUT & 0xff) as u8,
                (F::DETACH_TIMEOUT >> 8) as u8,
                // wTransferSize
                (F::TRANSFER_SIZE & 0xff) as u8,
                (F::TRANSFER_SIZE >> 8) as u8,
                // bcdDFUVersion
                0x10,
                0x01,
            ],
        )?;

        Ok(())
    }

    fn get_string(&self, index: StringIndex, lang_id: LangID) -> Option<&str> {
        if lang_id != LangID::EN_US && u16::from(lang_id) != 0 {
            return None;
        }
        let alt = self.strings.iter().position(|s| *s == Some(index))?;
        F::ZONES.get(alt as u8).map(|zone| zone.name)
    }

    fn get_alt_setting(&mut self, interface: InterfaceNumber) -> Option<u8> {
        if interface == self.if_num {
            Some(self.session.alt_setting())
        } else {
            None
        }
    }

    fn set_alt_setting(&mut self, interface: InterfaceNumber, alternative: u8) -> bool {
        interface == self.if_num && self.session.select_alt(alternative)
    }

    // Handle control requests to the host.
    fn control_in(&mut self, xfer: ControlIn<B>) {
        let req = *xfer.request();

        if req.recipient != control::Recipient::Interface {
            return;
        }

        if req.index != u8::from(self.if_num) as u16 {
            return;
        }

        match req.request_type {
            control::RequestType::Class => {}
            control::RequestType::Vendor => {
                self.vendor_in(xfer, req);
                return;
            }
            _ => return,
        }

        let request = match self.session.request(req.request) {
            Ok(request) => request,
            Err(_) => {
                xfer.reject().ok();
                return;
            }
        };

        match request {
            DfuRequest::Upload => {
                self.upload(xfer, req);
            }
            DfuRequest::GetStatus => {
                let status = self.session.get_status();
                xfer.accept_with(&status).ok();
            }
            DfuRequest::GetState => {
                xfer.accept_with(&[self.session.get_state()]).ok();
            }
            _ => {
                // OUT request sent as IN
                self.session.fail(DfuError::ProtocolViolation);
                xfer.reject().ok();
            }
        }
    }

    // Handle a control request from the host.
    fn control_out(&mut self, xfer: ControlOut<B>) {
        let req = *xfer.request();

        if req.request_type == control::RequestType::Standard
            && req.recipient == control::Recipient::Device
            && req.request == Request::SET_CONFIGURATION
            && req.value != 0
        {
            // left for usb-device to acknowledge
            self.session.configured();
            return;
        }

        if req.recipient != control::Recipient::Interface {
            return;
        }

        if req.index != u8::from(self.if_num) as u16 {
            return;
        }

        match req.request_type {
            control::RequestType::Class => {}
            control::RequestType::Vendor => {
                if self.session.flash_mut().vendor_out(req.request, req.value, xfer.data()) {
                    xfer.accept().ok();
                } else {
                    xfer.reject().ok();
                }
                return;
            }
            _ => return,
        }

        let request = match self.session.request(req.request) {
            Ok(request) => request,
            Err(_) => {
                xfer.reject().ok();
                return;
            }
        };

        match request {
            DfuRequest::Detach => {
                self.session.detach();
                xfer.accept().ok();
            }
            DfuRequest::Dnload => {
                let data = xfer.data();
                let len = min(data.len(), req.length as usize);
                match self.session.download(&data[..len]) {
                    Ok(()) => xfer.accept().ok(),
                    Err(_) => xfer.reject().ok(),
                };
            }
            DfuRequest::ClrStatus => {
                self.session.clear_status();
                xfer.accept().ok();
            }
            DfuRequest::Abort => {
                self.session.abort();
                xfer.accept().ok();
            }
            _ => {
                // IN request sent as OUT
                self.session.fail(DfuError::ProtocolViolation);
                xfer.reject().ok();
            }
        }
    }

    fn reset(&mut self) {
        // may not return
        self.session.bus_reset();
    }

    fn poll(&mut self) {
        self.session.poll();
    }
}

impl<B: UsbBus, F: DfuFlash, R: Reboot> DfuClass<B, F, R> {
    /// Creates a new [`DfuClass`] with the provided UsbBus, [`DfuFlash`]
    /// and [`Reboot`].
    pub fn new(alloc: &UsbBusAllocator<B>, flash: F, reboot: R) -> Self {
        Self {
            if_num: alloc.interface(),
            strings: core::array::from_fn(|alt| (alt < F::ZONES.len()).then(|| alloc.string())),
            session: DfuSession::new(flash, reboot),
            _bus: PhantomData,
        }
    }

    /// This function will consume self and return the owned flash and
    /// reboot arguments that were moved in the call to [`DfuClass::new()`]
    pub fn release(self) -> (F, R) {
        self.session.release()
    }

    /// Perform one step of flash programming. Never waits for the flash.
    ///
    /// Must be called from the same context as `usb_dev.poll()`.
    pub fn tick(&mut self) -> Tick {
        self.session.tick()
    }

    /// Leave `appDETACH` for `dfuIDLE`.
    ///
    /// Happens on its own when the host sends `SET_CONFIGURATION`. May be
    /// called by the application if the device is configured some other way.
    pub fn set_configured(&mut self) {
        self.session.configured();
    }

    /// Current DFU state.
    pub fn state(&self) -> DfuState {
        self.session.state()
    }

    /// Underlying protocol session.
    pub fn session(&self) -> &DfuSession<F, R> {
        &self.session
    }

    /// Mutable protocol session.
    pub fn session_mut(&mut self) -> &mut DfuSession<F, R> {
        &mut self.session
    }

    fn upload(&mut self, xfer: ControlIn<B>, req: Request) {
        let length = min(req.length, F::TRANSFER_SIZE) as usize;
        let session = &mut self.session;

        // failures stall the request, the session is already in dfuERROR
        xfer.accept(|buf| {
            let n = min(length, buf.len());
            session
                .upload(&mut buf[..n], req.length as usize)
                .map_err(|_| UsbError::InvalidState)
        })
        .ok();
    }

    fn vendor_in(&mut self, xfer: ControlIn<B>, req: Request) {
        let flash = self.session.flash_mut();

        xfer.accept(|buf| {
            let n = min(req.length as usize, buf.len());
            flash
                .vendor_in(req.request, req.value, &mut buf[..n])
                .ok_or(UsbError::Unsupported)
        })
        .ok();
    }
}
