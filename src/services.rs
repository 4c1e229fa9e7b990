//! The services dispatcher.
//!
//! Nodes never call the platform directly: every capability they consume
//! (mutual-exclusion byte cells, key exchange, allocation, math and DSP
//! kernels) is reached through this single entry point, routed by a packed
//! service command:
//!
//! ```text
//! 31     28 27    24 23     16 15        4 3     0
//! [command] [option] [  tag  ] [ function ] [group]
//! ```
//!
//! The platform is offered every command first and may service it with
//! dedicated hardware; otherwise the generic backend runs. Argument passing
//! keeps the original five-slot convention (three pointers and an integer
//! besides the command) so binary nodes and accelerator shims share one ABI.

use crate::bits::{field, with_field};
use crate::dsp;
use crate::error::Error;
use crate::platform::Platform;
use crate::sync;

const COMMAND_MSB: u32 = 31;
const COMMAND_LSB: u32 = 28;
const OPTION_MSB: u32 = 27;
const OPTION_LSB: u32 = 24;
const TAG_MSB: u32 = 23;
const TAG_LSB: u32 = 16;
const FUNCTION_MSB: u32 = 15;
const FUNCTION_LSB: u32 = 4;
const GROUP_MSB: u32 = 3;
const GROUP_LSB: u32 = 0;

/// Service groups, one per family of capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceGroup {
    /// Barriers, byte mutexes, keys, clocks.
    Internal = 0,
    /// Arc access and callbacks for scripts.
    Script = 1,
    /// Allocator and the stdlib subset.
    Stdlib = 2,
    /// math.h subset.
    Math = 3,
    /// CMSIS-DSP style kernels.
    DspMl = 4,
    /// Neural-network kernels (platform only).
    DeepLearning = 5,
    /// Speech/audio codecs (platform only).
    Audio = 6,
    /// Image processing (platform only).
    Image = 7,
}

impl ServiceGroup {
    fn from_raw(raw: u8) -> Option<ServiceGroup> {
        Some(match raw {
            0 => ServiceGroup::Internal,
            1 => ServiceGroup::Script,
            2 => ServiceGroup::Stdlib,
            3 => ServiceGroup::Math,
            4 => ServiceGroup::DspMl,
            5 => ServiceGroup::DeepLearning,
            6 => ServiceGroup::Audio,
            7 => ServiceGroup::Image,
            _ => return None,
        })
    }
}

/// Function ids of [`ServiceGroup::Internal`].
pub mod internal {
    pub const SLEEP_CONTROL: u16 = 0;
    pub const MUTEX_WRITE_BYTE_AND_CHECK: u16 = 5;
    pub const MUTEX_READ_BYTE: u16 = 6;
    pub const MUTEX_WRITE_BYTE: u16 = 7;
    pub const MUTEX_CLEAR_BIT: u16 = 8;
    pub const READ_TIME64: u16 = 10;
    pub const KEY_EXCHANGE: u16 = 13;
}

/// Function ids of [`ServiceGroup::Script`].
pub mod script {
    pub const NODE: u16 = 2;
    pub const DEBUG_TRACE: u16 = 3;
    pub const FORMAT_UPDATE: u16 = 4;
}

/// Function ids of [`ServiceGroup::Stdlib`].
pub mod stdlib {
    pub const MALLOC: u16 = 1;
    pub const FREE: u16 = 2;
}

/// Function ids of [`ServiceGroup::Math`].
pub mod math {
    pub const SQRT_F32: u16 = 1;
    pub const SINE_F32: u16 = 2;
    pub const LOG10_F32: u16 = 3;
}

/// Function ids of [`ServiceGroup::DspMl`].
pub mod dsp_ml {
    pub const CHECK_END_COMPUTE: u16 = 1;
    pub const BIQUAD_DF1_Q15: u16 = 2;
    pub const BIQUAD_DF1_F32: u16 = 3;
    pub const HANN_WINDOW_F32: u16 = 4;
}

/// Command sub-codes in the COMMAND field of DSP-ML services.
pub mod dsp_command {
    pub const INIT: u8 = 1;
    pub const RUN: u8 = 2;
}

/// The packed service command word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceCommand(pub u32);

impl ServiceCommand {
    pub fn pack(command: u8, option: u8, tag: u8, function: u16, group: ServiceGroup) -> Self {
        let mut w = 0;
        w = with_field(w, COMMAND_MSB, COMMAND_LSB, command as u32);
        w = with_field(w, OPTION_MSB, OPTION_LSB, option as u32);
        w = with_field(w, TAG_MSB, TAG_LSB, tag as u32);
        w = with_field(w, FUNCTION_MSB, FUNCTION_LSB, function as u32);
        w = with_field(w, GROUP_MSB, GROUP_LSB, group as u32);
        ServiceCommand(w)
    }

    pub fn command(self) -> u8 {
        field(self.0, COMMAND_MSB, COMMAND_LSB) as u8
    }

    pub fn option(self) -> u8 {
        field(self.0, OPTION_MSB, OPTION_LSB) as u8
    }

    pub fn tag(self) -> u8 {
        field(self.0, TAG_MSB, TAG_LSB) as u8
    }

    pub fn function_id(self) -> u16 {
        field(self.0, FUNCTION_MSB, FUNCTION_LSB) as u16
    }

    /// The 4-bit sub-function in the high bits of the function field.
    pub fn sub_function(self) -> u8 {
        (self.function_id() >> 8) as u8
    }

    pub fn group(self) -> Option<ServiceGroup> {
        ServiceGroup::from_raw(field(self.0, GROUP_MSB, GROUP_LSB) as u8)
    }
}

/// Shorthand for a function-only command.
pub fn service(function: u16, group: ServiceGroup) -> ServiceCommand {
    ServiceCommand::pack(0, 0, 0, function, group)
}

/// The three pointer slots and the integer slot of a service call. Slots
/// the function does not use stay zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceArgs {
    pub ptr1: usize,
    pub ptr2: usize,
    pub ptr3: usize,
    pub n: isize,
}

impl ServiceArgs {
    pub fn new(ptr1: usize, ptr2: usize, ptr3: usize, n: isize) -> ServiceArgs {
        ServiceArgs { ptr1, ptr2, ptr3, n }
    }
}

/// DF1 q15 cascade instance written by the INIT service and consumed by the
/// RUN service. Lives in node-owned memory.
#[repr(C)]
pub struct BiquadInstQ15 {
    pub num_stages: u32,
    pub post_shift: i32,
    pub coeffs: *const i16,
    pub state: *mut i16,
}

/// DF1 f32 cascade instance.
#[repr(C)]
pub struct BiquadInstF32 {
    pub num_stages: u32,
    pub coeffs: *const f32,
    pub state: *mut f32,
}

/// The services entry point handed to nodes at RESET.
pub struct Services<'a> {
    platform: &'a dyn Platform,
}

impl<'a> Services<'a> {
    pub fn new(platform: &'a dyn Platform) -> Services<'a> {
        Services { platform }
    }

    /// Route one service command: platform override first, then the generic
    /// backend of the group.
    pub fn dispatch(&self, command: ServiceCommand, args: &mut ServiceArgs) -> Result<(), Error> {
        if self.platform.service(command, args) {
            return Ok(());
        }
        let group = command.group().ok_or_else(|| self.unknown(command))?;
        match group {
            ServiceGroup::Internal => self.internal(command, args),
            ServiceGroup::Script => self.script(command, args),
            ServiceGroup::Stdlib => self.stdlib(command, args),
            ServiceGroup::Math => self.math(command, args),
            ServiceGroup::DspMl => self.dsp_ml(command, args),
            // No generic backend for these families; platforms must claim
            // them through the override hook.
            ServiceGroup::DeepLearning | ServiceGroup::Audio | ServiceGroup::Image => {
                Err(Error::UnknownService {
                    group: group as u8,
                    function: command.function_id(),
                })
            }
        }
    }

    fn unknown(&self, command: ServiceCommand) -> Error {
        Error::UnknownService {
            group: command.group().map(|g| g as u8).unwrap_or(0xF),
            function: command.function_id(),
        }
    }

    fn internal(&self, command: ServiceCommand, args: &mut ServiceArgs) -> Result<(), Error> {
        match command.function_id() {
            internal::SLEEP_CONTROL => Ok(()),
            internal::MUTEX_WRITE_BYTE_AND_CHECK => {
                // ptr1: byte cell, ptr2: result flag out, ptr3: whoami in.
                unsafe {
                    let whoami = *(args.ptr3 as *const u8);
                    let ok = sync::write_byte_and_check(args.ptr1, whoami);
                    *(args.ptr2 as *mut u8) = ok as u8;
                }
                Ok(())
            }
            internal::MUTEX_READ_BYTE => {
                unsafe {
                    *(args.ptr2 as *mut u8) = sync::read_byte(args.ptr1);
                }
                Ok(())
            }
            internal::MUTEX_WRITE_BYTE => {
                unsafe {
                    let value = *(args.ptr2 as *const u8);
                    sync::write_byte(args.ptr1, value);
                }
                Ok(())
            }
            internal::MUTEX_CLEAR_BIT => {
                unsafe {
                    sync::clear_bit(args.ptr1, args.n as u32);
                }
                Ok(())
            }
            internal::READ_TIME64 => {
                unsafe {
                    *(args.ptr1 as *mut u64) = self.platform.time64();
                }
                Ok(())
            }
            internal::KEY_EXCHANGE => {
                let keys = self.platform.key_pair();
                unsafe {
                    core::ptr::copy_nonoverlapping(keys.as_ptr(), args.ptr1 as *mut u32, 2);
                }
                Ok(())
            }
            _ => Err(self.unknown(command)),
        }
    }

    fn script(&self, command: ServiceCommand, _args: &mut ServiceArgs) -> Result<(), Error> {
        match command.function_id() {
            // The bytecode engine is not part of the core; the hook points
            // exist so scripted graphs run unchanged.
            script::NODE | script::DEBUG_TRACE | script::FORMAT_UPDATE => {
                log::trace!("script service {:#x} ignored", command.0);
                Ok(())
            }
            _ => Err(self.unknown(command)),
        }
    }

    fn stdlib(&self, command: ServiceCommand, args: &mut ServiceArgs) -> Result<(), Error> {
        match command.function_id() {
            stdlib::MALLOC => {
                let size = args.n as usize;
                let addr = self.platform.alloc(size).unwrap_or(0);
                unsafe {
                    *(args.ptr1 as *mut usize) = addr;
                }
                Ok(())
            }
            stdlib::FREE => {
                self.platform.free(args.ptr1);
                Ok(())
            }
            _ => Err(self.unknown(command)),
        }
    }

    fn math(&self, command: ServiceCommand, args: &mut ServiceArgs) -> Result<(), Error> {
        let apply = |args: &ServiceArgs, f: fn(f32) -> f32| unsafe {
            let src = core::slice::from_raw_parts(args.ptr1 as *const f32, args.n as usize);
            let dst = core::slice::from_raw_parts_mut(args.ptr2 as *mut f32, args.n as usize);
            for (d, s) in dst.iter_mut().zip(src) {
                *d = f(*s);
            }
        };
        match command.function_id() {
            math::SQRT_F32 => {
                apply(args, f32::sqrt);
                Ok(())
            }
            math::SINE_F32 => {
                apply(args, f32::sin);
                Ok(())
            }
            math::LOG10_F32 => {
                apply(args, f32::log10);
                Ok(())
            }
            _ => Err(self.unknown(command)),
        }
    }

    fn dsp_ml(&self, command: ServiceCommand, args: &mut ServiceArgs) -> Result<(), Error> {
        match command.function_id() {
            dsp_ml::CHECK_END_COMPUTE => {
                unsafe {
                    *(args.ptr1 as *mut u8) = 1;
                }
                Ok(())
            }
            dsp_ml::BIQUAD_DF1_Q15 => {
                if command.command() == dsp_command::INIT {
                    // (instance, coeffs, state, stages | post_shift << 8)
                    let inst = args.ptr1 as *mut BiquadInstQ15;
                    unsafe {
                        (*inst).num_stages = (args.n & 0xFF) as u32;
                        (*inst).post_shift = (args.n >> 8) as i32;
                        (*inst).coeffs = args.ptr2 as *const i16;
                        (*inst).state = args.ptr3 as *mut i16;
                        let state_len =
                            (*inst).num_stages as usize * dsp::BIQUAD_STATE_PER_STAGE;
                        core::slice::from_raw_parts_mut((*inst).state, state_len).fill(0);
                    }
                } else {
                    // (instance, src, dst, block_size)
                    let inst = args.ptr1 as *const BiquadInstQ15;
                    unsafe {
                        let stages = (*inst).num_stages as usize;
                        let coeffs = core::slice::from_raw_parts(
                            (*inst).coeffs,
                            stages * dsp::BIQUAD_COEFFS_PER_STAGE,
                        );
                        let state = core::slice::from_raw_parts_mut(
                            (*inst).state,
                            stages * dsp::BIQUAD_STATE_PER_STAGE,
                        );
                        let src =
                            core::slice::from_raw_parts(args.ptr2 as *const i16, args.n as usize);
                        let dst = core::slice::from_raw_parts_mut(
                            args.ptr3 as *mut i16,
                            args.n as usize,
                        );
                        dsp::biquad_cascade_df1_q15(
                            state,
                            coeffs,
                            (*inst).post_shift as u8,
                            src,
                            dst,
                        );
                    }
                }
                Ok(())
            }
            dsp_ml::BIQUAD_DF1_F32 => {
                if command.command() == dsp_command::INIT {
                    let inst = args.ptr1 as *mut BiquadInstF32;
                    unsafe {
                        (*inst).num_stages = (args.n & 0xFF) as u32;
                        (*inst).coeffs = args.ptr2 as *const f32;
                        (*inst).state = args.ptr3 as *mut f32;
                        let state_len =
                            (*inst).num_stages as usize * dsp::BIQUAD_STATE_PER_STAGE;
                        core::slice::from_raw_parts_mut((*inst).state, state_len).fill(0.0);
                    }
                } else {
                    let inst = args.ptr1 as *const BiquadInstF32;
                    unsafe {
                        let stages = (*inst).num_stages as usize;
                        let coeffs = core::slice::from_raw_parts(
                            (*inst).coeffs,
                            stages * dsp::BIQUAD_COEFFS_PER_STAGE,
                        );
                        let state = core::slice::from_raw_parts_mut(
                            (*inst).state,
                            stages * dsp::BIQUAD_STATE_PER_STAGE,
                        );
                        let src =
                            core::slice::from_raw_parts(args.ptr2 as *const f32, args.n as usize);
                        let dst = core::slice::from_raw_parts_mut(
                            args.ptr3 as *mut f32,
                            args.n as usize,
                        );
                        dsp::biquad_cascade_df1_f32(state, coeffs, src, dst);
                    }
                }
                Ok(())
            }
            dsp_ml::HANN_WINDOW_F32 => {
                unsafe {
                    let samples =
                        core::slice::from_raw_parts_mut(args.ptr1 as *mut f32, args.n as usize);
                    dsp::hann_window_f32(samples);
                }
                Ok(())
            }
            _ => Err(self.unknown(command)),
        }
    }
}

impl core::fmt::Debug for Services<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("Services")
    }
}
