//! DFU protocol state machine, independent of the USB stack.
//!
//! [`DfuSession`] owns the flash, the double buffer and the program engine.
//! [`DfuClass`](crate::class::DfuClass) decodes USB control transfers and
//! calls into it.

use core::cmp::min;

use crate::buffer::DoubleBuffer;
use crate::engine::{ProgramState, Tick};
use crate::error::DfuError;
use crate::flash::{DfuFlash, ManifestPolicy, Reboot};

/// DFU device state, as reported by `DFU_GETSTATUS` and `DFU_GETSTATE`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum DfuState {
    /// Device is running its normal application.
    AppIdle = 0,
    /// Device is running its normal application, has received the DFU_DETACH request, and is waiting for a USB reset.
    AppDetach = 1,
    /// Device is operating in the DFU mode and is waiting for requests.
    DfuIdle = 2,
    /// Device has received a block and is waiting for the host to solicit the status via DFU_GETSTATUS.
    DfuDnloadSync = 3,
    /// Device is programming a control-write block into its nonvolatile memories.
    DfuDnBusy = 4,
    /// Device is processing a download operation. Expecting DFU_DNLOAD requests.
    DfuDnloadIdle = 5,
    /// Device has received the final block of firmware from the host and is waiting for receipt of DFU_GETSTATUS to begin the Manifestation phase.
    DfuManifestSync = 6,
    /// Device is in the Manifestation phase.
    DfuManifest = 7,
    /// Device has programmed its memories and is waiting for a USB reset or a power on reset.
    DfuManifestWaitReset = 8,
    /// The device is processing an upload operation. Expecting DFU_UPLOAD requests.
    DfuUploadIdle = 9,
    /// An error has occurred. Awaiting the DFU_CLRSTATUS request.
    DfuError = 10,
}

/// `bStatus` field of the `DFU_GETSTATUS` reply.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum DfuStatusCode {
    /// No error condition is present.
    Ok = 0x00,
    /// File is not targeted for use by this device.
    ErrTarget = 0x01,
    /// File is for this device but fails some vendor-specific verification test.
    ErrFile = 0x02,
    /// Device is unable to write memory.
    ErrWrite = 0x03,
    /// Memory erase function failed.
    ErrErase = 0x04,
    /// Memory erase check failed.
    ErrCheckErased = 0x05,
    /// Program memory function failed.
    ErrProg = 0x06,
    /// Programmed memory failed verification.
    ErrVerify = 0x07,
    /// Cannot program memory due to received address that is out of range.
    ErrAddress = 0x08,
    /// Received DFU_DNLOAD with wLength = 0, but device does not think it has all of the data yet.
    ErrNotdone = 0x09,
    /// Device’s firmware is corrupt. It cannot return to run-time (non-DFU) operations.
    ErrFirmware = 0x0A,
    /// iString indicates a vendor-specific error.
    ErrVendor = 0x0B,
    /// Device detected unexpected USB reset signaling.
    ErrUsbr = 0x0C,
    /// Device detected unexpected power on reset.
    ErrPOR = 0x0D,
    /// Something went wrong, but the device does not know what it was.
    ErrUnknown = 0x0E,
    /// Device stalled an unexpected request.
    ErrStalledPkt = 0x0F,
}

/// DFU class request codes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum DfuRequest {
    /// `DFU_DETACH`
    Detach = 0x00,
    /// `DFU_DNLOAD`
    Dnload = 0x01,
    /// `DFU_UPLOAD`
    Upload = 0x02,
    /// `DFU_GETSTATUS`
    GetStatus = 0x03,
    /// `DFU_CLRSTATUS`
    ClrStatus = 0x04,
    /// `DFU_GETSTATE`
    GetState = 0x05,
    /// `DFU_ABORT`
    Abort = 0x06,
}

impl TryFrom<u8> for DfuRequest {
    type Error = DfuError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => DfuRequest::Detach,
            0x01 => DfuRequest::Dnload,
            0x02 => DfuRequest::Upload,
            0x03 => DfuRequest::GetStatus,
            0x04 => DfuRequest::ClrStatus,
            0x05 => DfuRequest::GetState,
            0x06 => DfuRequest::Abort,
            _ => return Err(DfuError::ProtocolViolation),
        })
    }
}

const DETACH: u8 = 1 << DfuRequest::Detach as u8;
const DNLOAD: u8 = 1 << DfuRequest::Dnload as u8;
const UPLOAD: u8 = 1 << DfuRequest::Upload as u8;
const GETSTATUS: u8 = 1 << DfuRequest::GetStatus as u8;
const CLRSTATUS: u8 = 1 << DfuRequest::ClrStatus as u8;
const GETSTATE: u8 = 1 << DfuRequest::GetState as u8;
const ABORT: u8 = 1 << DfuRequest::Abort as u8;

/// Requests accepted in each state, indexed by state value.
///
/// DETACH is also accepted in `dfuIDLE` so a host can leave the bootloader.
const VALID_REQUESTS: [u8; 11] = [
    DETACH | GETSTATUS | GETSTATE,
    GETSTATUS | GETSTATE,
    DETACH | DNLOAD | UPLOAD | GETSTATUS | GETSTATE | ABORT,
    DNLOAD | GETSTATUS | GETSTATE | ABORT,
    0,
    DNLOAD | GETSTATUS | GETSTATE | ABORT,
    GETSTATUS | GETSTATE | ABORT,
    0,
    0,
    UPLOAD | GETSTATUS | GETSTATE | ABORT,
    GETSTATUS | CLRSTATUS | GETSTATE,
];

impl DfuState {
    /// `true` if `request` is legal in this state.
    pub fn allows(self, request: DfuRequest) -> bool {
        VALID_REQUESTS
            .get(self as usize)
            .map_or(false, |mask| mask & (1 << request as u8) != 0)
    }
}

/// One DFU session: protocol state plus everything needed to persist an
/// image.
pub struct DfuSession<F: DfuFlash, R: Reboot> {
    state: DfuState,
    status: DfuStatusCode,
    alt: u8,
    ticks: u8,
    end_of_image: bool,
    detach_pending: bool,
    buffer: DoubleBuffer,
    prog: ProgramState,
    flash: F,
    reboot: R,
}

impl<F: DfuFlash, R: Reboot> DfuSession<F, R> {
    /// New session in `appDETACH`, no zone loaded.
    pub fn new(flash: F, reboot: R) -> Self {
        Self {
            state: DfuState::AppDetach,
            status: DfuStatusCode::Ok,
            alt: 0,
            ticks: 0,
            end_of_image: false,
            detach_pending: false,
            buffer: DoubleBuffer::new(),
            prog: ProgramState::new(F::MAX_RETRY),
            flash,
            reboot,
        }
    }

    /// Current state.
    pub fn state(&self) -> DfuState {
        self.state
    }

    /// Current status code.
    pub fn status(&self) -> DfuStatusCode {
        self.status
    }

    /// Selected alternate setting.
    pub fn alt_setting(&self) -> u8 {
        self.alt
    }

    /// Flash cursors and engine progress.
    pub fn program_state(&self) -> &ProgramState {
        &self.prog
    }

    /// Data received and not yet committed to flash.
    pub fn buffer(&self) -> &DoubleBuffer {
        &self.buffer
    }

    /// Flash device.
    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// Mutable flash device, for board code sharing the SPI bus.
    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    /// Reboot capability.
    pub fn rebooter(&self) -> &R {
        &self.reboot
    }

    /// Give back the flash and the reboot capability.
    pub fn release(self) -> (F, R) {
        (self.flash, self.reboot)
    }

    /// USB device reached the Configured state.
    ///
    /// Moves `appDETACH` to `dfuIDLE` with the first zone selected, does
    /// nothing in any other state.
    pub fn configured(&mut self) {
        if self.state == DfuState::AppDetach && self.select_alt(0) {
            #[cfg(feature = "defmt-03")]
            defmt::info!("configured, dfuIDLE");
        }
    }

    /// `SET_INTERFACE`: load the cursors of zone `alt` and drop any queued
    /// data.
    ///
    /// Returns `false`, and changes nothing, if there is no such zone.
    pub fn select_alt(&mut self, alt: u8) -> bool {
        let zone = match F::ZONES.get(alt) {
            Some(zone) => *zone,
            None => return false,
        };

        #[cfg(feature = "defmt-03")]
        defmt::info!("alt {} {=str}: {=u32:#010x}..{=u32:#010x}", alt, zone.name, zone.start, zone.end);

        self.alt = alt;
        self.buffer.clear();
        self.prog.load(&zone, F::MAX_RETRY);
        self.end_of_image = false;
        self.state = DfuState::DfuIdle;
        self.status = DfuStatusCode::Ok;
        true
    }

    /// Validate a class request code against the current state.
    ///
    /// An unknown request, or one not allowed in this state, puts the session
    /// in `dfuERROR`.
    pub fn request(&mut self, code: u8) -> Result<DfuRequest, DfuError> {
        match DfuRequest::try_from(code) {
            Ok(req) if self.state.allows(req) => Ok(req),
            _ => Err(self.fail(DfuError::ProtocolViolation)),
        }
    }

    /// Enter `dfuERROR` for a request that can't be served.
    pub fn fail(&mut self, e: DfuError) -> DfuError {
        #[cfg(feature = "defmt-03")]
        defmt::warn!("{} in {}, dfuERROR", e, self.state);
        self.state = DfuState::DfuError;
        self.status = e.into();
        e
    }

    /// `DFU_DETACH`: reboot on the next [`poll()`](DfuSession::poll), once the
    /// request has been acknowledged.
    pub fn detach(&mut self) {
        self.detach_pending = true;
    }

    /// `DFU_DNLOAD`.
    ///
    /// An empty block ends the image. Otherwise `data` is queued at the
    /// receive cursor.
    pub fn download(&mut self, data: &[u8]) -> Result<(), DfuError> {
        if data.is_empty() {
            #[cfg(feature = "defmt-03")]
            defmt::info!("end of image at {=u32:#010x}", self.prog.addr_recv);
            self.end_of_image = true;
            self.state = DfuState::DfuManifestSync;
            return Ok(());
        }

        let recv = match self.prog.addr_recv.checked_add(data.len() as u32) {
            Some(recv) if recv <= self.prog.addr_end => recv,
            _ => return Err(self.fail(DfuError::RangeOverflow)),
        };

        // host ignored dfuDNBUSY
        if !self.buffer.append(data) {
            return Err(self.fail(DfuError::ProtocolViolation));
        }

        self.prog.addr_recv = recv;
        self.end_of_image = false;

        // short block: last one of the image
        if data.len() < F::TRANSFER_SIZE as usize && self.buffer.pending() > 0 && self.buffer.commit() {
            self.prog.skip_to_window_end();
        }

        self.state = DfuState::DfuDnloadSync;
        Ok(())
    }

    /// `DFU_UPLOAD`: read flash at the read cursor into `dst`.
    ///
    /// `requested` is the host's wLength, which may be larger than `dst`.
    /// Returns the number of bytes read, fewer than `dst.len()` at the end of
    /// the zone. Anything shorter than `requested` ends the upload.
    pub fn upload(&mut self, dst: &mut [u8], requested: usize) -> Result<usize, DfuError> {
        let left = self.prog.addr_end.saturating_sub(self.prog.addr_read) as usize;
        let len = min(dst.len(), left);

        if len > 0 {
            self.flash.select(self.prog.chip);
            if let Err(e) = self.flash.read(self.prog.addr_read, &mut dst[..len]) {
                return Err(self.fail(e.into()));
            }
            self.prog.addr_read += len as u32;
        }

        // a short frame ends the upload
        self.state = if len > 0 && len == requested {
            DfuState::DfuUploadIdle
        } else {
            DfuState::DfuIdle
        };

        Ok(len)
    }

    /// `DFU_GETSTATUS` reply.
    ///
    /// In `dfuMANIFEST_SYNC` with [`ManifestPolicy::Drain`] this finishes all
    /// queued programming before returning.
    pub fn get_status(&mut self) -> [u8; 6] {
        let reported = match self.state {
            DfuState::DfuDnloadSync => {
                if self.buffer.used() < 2 {
                    self.state = DfuState::DfuDnloadIdle;
                    DfuState::DfuDnloadIdle
                } else {
                    DfuState::DfuDnBusy
                }
            }
            DfuState::DfuManifestSync => match F::MANIFEST_POLICY {
                ManifestPolicy::Drain => {
                    self.state = DfuState::DfuIdle;
                    self.drain();
                    self.finish_manifest();
                    DfuState::DfuIdle
                }
                ManifestPolicy::Report => {
                    self.flush_tail();
                    if self.buffer.is_empty() {
                        self.state = DfuState::DfuIdle;
                        self.finish_manifest();
                        DfuState::DfuIdle
                    } else {
                        DfuState::DfuManifest
                    }
                }
            },
            state => state,
        };

        let t = F::POLL_TIMEOUT_MS.to_le_bytes();
        [self.status as u8, t[0], t[1], t[2], reported as u8, 0]
    }

    /// `DFU_CLRSTATUS`.
    pub fn clear_status(&mut self) {
        self.state = DfuState::DfuIdle;
        self.status = DfuStatusCode::Ok;
    }

    /// `DFU_GETSTATE` reply.
    pub fn get_state(&self) -> u8 {
        self.state as u8
    }

    /// `DFU_ABORT`. Queued data keeps being programmed.
    pub fn abort(&mut self) {
        self.state = DfuState::DfuIdle;
    }

    /// USB bus reset.
    ///
    /// Outside of `appDETACH` the session is over: the device is rebooted and,
    /// if the reboot returns, the session starts over.
    pub fn bus_reset(&mut self) {
        if self.state == DfuState::AppDetach {
            return;
        }

        #[cfg(feature = "defmt-03")]
        defmt::warn!("{} in {}, rebooting", DfuError::BusReset, self.state);

        self.reboot.reboot();

        self.state = DfuState::AppDetach;
        self.status = DfuStatusCode::Ok;
        self.ticks = 0;
        self.end_of_image = false;
        self.detach_pending = false;
        self.buffer.clear();
        self.prog = ProgramState::new(F::MAX_RETRY);
    }

    /// Run deferred work that must follow the status stage of a request.
    pub fn poll(&mut self) {
        if self.detach_pending {
            self.detach_pending = false;
            #[cfg(feature = "defmt-03")]
            defmt::info!("detach");
            self.reboot.reboot();
        }
    }

    /// One step of the flash engine, subject to
    /// [`TICK_DIVIDER`](DfuFlash::TICK_DIVIDER).
    pub fn tick(&mut self) -> Tick {
        if F::TICK_DIVIDER > 0 {
            if self.ticks < F::TICK_DIVIDER {
                self.ticks += 1;
                return Tick::Throttled;
            }
            self.ticks = 0;
        }
        self.step()
    }

    fn step(&mut self) -> Tick {
        self.flush_tail();
        let t = self.prog.tick(&mut self.flash, &mut self.buffer, &mut self.reboot);

        #[cfg(feature = "defmt-03")]
        if t == Tick::Abandoned {
            defmt::warn!("{}", DfuError::VerifyRetryExhausted);
        }

        t
    }

    /// Queue a partially filled window once the host has sent the whole
    /// image.
    fn flush_tail(&mut self) {
        if self.end_of_image && self.buffer.pending() > 0 && self.buffer.commit() {
            self.prog.skip_to_window_end();
        }
    }

    fn drain(&mut self) {
        while !self.buffer.is_empty() {
            self.step();
        }
    }

    fn finish_manifest(&mut self) {
        self.end_of_image = false;
        if let Some(zone) = F::ZONES.get(self.alt) {
            let zone = *zone;
            self.prog.load(&zone, F::MAX_RETRY);
        }

        #[cfg(feature = "defmt-03")]
        defmt::info!("manifest done");
    }
}
