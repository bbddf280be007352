//! CPU register identifiers, values and the paused-thread register snapshot.

use std::fmt;

use super::{Address, Architecture};
use crate::error::{HoldfastError, HoldfastResult};

/// Identifier for a specific CPU register
///
/// Operators name registers with the strings the instrumentation host uses
/// (`"pc"`, `"x0"`, `"rax"`, `"q3"`, ...). [`RegisterId::parse`] resolves those
/// names for a given architecture into this enum. Common registers (PC, SP,
/// FP, Status) exist on all architectures; the rest are architecture-specific.
///
/// ## Example
///
/// ```rust
/// use holdfast_core::types::{Architecture, Arm64Register, RegisterId, X86_64Register};
///
/// assert_eq!(RegisterId::parse("pc", Architecture::Arm64)?, RegisterId::Pc);
/// assert_eq!(RegisterId::parse("x0", Architecture::Arm64)?, RegisterId::Arm64(Arm64Register::X(0)));
/// assert_eq!(RegisterId::parse("RAX", Architecture::X86_64)?, RegisterId::X86_64(X86_64Register::Rax));
/// assert_eq!(RegisterId::parse("rip", Architecture::X86_64)?, RegisterId::Pc);
/// # Ok::<(), holdfast_core::error::HoldfastError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterId
{
    /// Program Counter (PC on ARM64, RIP on x86-64)
    Pc,
    /// Stack Pointer (SP on ARM64, RSP on x86-64)
    Sp,
    /// Frame Pointer (X29 on ARM64, RBP on x86-64)
    Fp,
    /// Status/Flags register (NZCV on ARM64, RFLAGS on x86-64)
    Status,
    /// ARM64-specific general-purpose register
    Arm64(Arm64Register),
    /// x86-64-specific general-purpose register
    X86_64(X86_64Register),
    /// 128-bit SIMD register (Q/V on ARM64, XMM on x86-64)
    Vector(u8),
    /// Floating-point status/control register
    Floating(FloatingRegister),
}

/// ARM64 general-purpose register identifier
///
/// X0 through X30. X29 is reported as [`RegisterId::Fp`] when parsed by name
/// so that the frame pointer has a single home in the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arm64Register
{
    /// General-purpose register X0-X30
    X(u8),
}

/// x86-64 general-purpose register identifier
///
/// RSP, RBP and RIP are accessed via `RegisterId::Sp`, `RegisterId::Fp` and
/// `RegisterId::Pc` respectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum X86_64Register
{
    /// RAX - Accumulator register (often used for return values)
    Rax,
    /// RBX - Base register
    Rbx,
    /// RCX - Counter register
    Rcx,
    /// RDX - Data register
    Rdx,
    /// RSI - Source index register
    Rsi,
    /// RDI - Destination index register
    Rdi,
    /// R8
    R8,
    /// R9
    R9,
    /// R10
    R10,
    /// R11
    R11,
    /// R12
    R12,
    /// R13
    R13,
    /// R14
    R14,
    /// R15
    R15,
}

/// Floating-point status/control registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatingRegister
{
    /// ARM64 Floating-Point Status Register
    Fpsr,
    /// ARM64 Floating-Point Control Register
    Fpcr,
    /// x86-64 SSE control/status register
    Mxcsr,
}

impl X86_64Register
{
    const ALL: [(&'static str, X86_64Register); 14] = [
        ("rax", X86_64Register::Rax),
        ("rbx", X86_64Register::Rbx),
        ("rcx", X86_64Register::Rcx),
        ("rdx", X86_64Register::Rdx),
        ("rsi", X86_64Register::Rsi),
        ("rdi", X86_64Register::Rdi),
        ("r8", X86_64Register::R8),
        ("r9", X86_64Register::R9),
        ("r10", X86_64Register::R10),
        ("r11", X86_64Register::R11),
        ("r12", X86_64Register::R12),
        ("r13", X86_64Register::R13),
        ("r14", X86_64Register::R14),
        ("r15", X86_64Register::R15),
    ];

    /// Index of this register in the general-purpose register array
    ///
    /// - RAX = 0, RBX = 1, RCX = 2, RDX = 3
    /// - RSI = 4, RDI = 5
    /// - R8 = 6 ... R15 = 13
    const fn index(self) -> usize
    {
        match self {
            X86_64Register::Rax => 0,
            X86_64Register::Rbx => 1,
            X86_64Register::Rcx => 2,
            X86_64Register::Rdx => 3,
            X86_64Register::Rsi => 4,
            X86_64Register::Rdi => 5,
            X86_64Register::R8 => 6,
            X86_64Register::R9 => 7,
            X86_64Register::R10 => 8,
            X86_64Register::R11 => 9,
            X86_64Register::R12 => 10,
            X86_64Register::R13 => 11,
            X86_64Register::R14 => 12,
            X86_64Register::R15 => 13,
        }
    }
}

/// Semantic kind of a register, which decides the shape of its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterKind
{
    /// Plain integer (flags, floating-point control words)
    Numeric,
    /// Pointer-sized value reported as an address
    Address,
    /// 128-bit vector reported as 16 bytes
    Vector,
}

fn indexed(name: &str, prefix: &str, limit: u8) -> Option<u8>
{
    let digits = name.strip_prefix(prefix)?;
    if digits.is_empty() || (digits.len() > 1 && digits.starts_with('0')) {
        return None;
    }
    digits.parse::<u8>().ok().filter(|index| *index < limit)
}

impl RegisterId
{
    /// Resolve an operator-supplied register name for `architecture`.
    ///
    /// Names are case-insensitive. The common aliases `pc`, `sp` and `fp` are
    /// accepted on every architecture.
    ///
    /// ## Errors
    ///
    /// - `InvalidArgument`: the name doesn't denote a register of this architecture
    pub fn parse(name: &str, architecture: Architecture) -> HoldfastResult<Self>
    {
        let lowered = name.trim().to_ascii_lowercase();
        let id = match lowered.as_str() {
            "pc" => Some(RegisterId::Pc),
            "sp" => Some(RegisterId::Sp),
            "fp" => Some(RegisterId::Fp),
            other => match architecture {
                Architecture::Arm64 => Self::parse_arm64(other),
                Architecture::X86_64 => Self::parse_x86_64(other),
                Architecture::Unknown(_) => None,
            },
        };
        id.ok_or_else(|| HoldfastError::InvalidArgument(format!("unknown register {name:?} for {architecture}")))
    }

    fn parse_arm64(name: &str) -> Option<Self>
    {
        match name {
            "x29" => Some(RegisterId::Fp),
            "lr" | "x30" => Some(RegisterId::Arm64(Arm64Register::X(30))),
            "nzcv" | "cpsr" => Some(RegisterId::Status),
            "fpsr" => Some(RegisterId::Floating(FloatingRegister::Fpsr)),
            "fpcr" => Some(RegisterId::Floating(FloatingRegister::Fpcr)),
            _ => indexed(name, "x", 29)
                .map(|index| RegisterId::Arm64(Arm64Register::X(index)))
                .or_else(|| indexed(name, "q", 32).map(RegisterId::Vector))
                .or_else(|| indexed(name, "v", 32).map(RegisterId::Vector)),
        }
    }

    fn parse_x86_64(name: &str) -> Option<Self>
    {
        match name {
            "rip" => Some(RegisterId::Pc),
            "rsp" => Some(RegisterId::Sp),
            "rbp" => Some(RegisterId::Fp),
            "rflags" | "eflags" => Some(RegisterId::Status),
            "mxcsr" => Some(RegisterId::Floating(FloatingRegister::Mxcsr)),
            _ => X86_64Register::ALL
                .iter()
                .find(|(label, _)| *label == name)
                .map(|(_, reg)| RegisterId::X86_64(*reg))
                .or_else(|| indexed(name, "xmm", 16).map(RegisterId::Vector)),
        }
    }

    /// Semantic kind of the register.
    #[must_use]
    pub const fn kind(self) -> RegisterKind
    {
        match self {
            RegisterId::Pc | RegisterId::Sp | RegisterId::Fp | RegisterId::Arm64(_) | RegisterId::X86_64(_) => {
                RegisterKind::Address
            }
            RegisterId::Status | RegisterId::Floating(_) => RegisterKind::Numeric,
            RegisterId::Vector(_) => RegisterKind::Vector,
        }
    }
}

/// 128-bit SIMD register value.
///
/// ## Architecture Support
///
/// - **ARM64**: NEON registers (V0-V31) are 128-bit
/// - **x86-64**: XMM registers (XMM0-XMM15) are 128-bit
///
/// All values are stored in little-endian format, which is the native byte
/// order for both architectures.
///
/// ```rust
/// use holdfast_core::types::VectorRegisterValue;
///
/// let vec_reg = VectorRegisterValue::from_u128(0x1234);
/// assert_eq!(vec_reg.bytes()[0], 0x34); // Least significant byte
/// assert_eq!(vec_reg.as_u128(), 0x1234);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VectorRegisterValue
{
    bytes: [u8; 16],
}

impl VectorRegisterValue
{
    /// Create a new vector register from raw bytes (little-endian).
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self
    {
        Self { bytes }
    }

    /// Create a vector register from a byte slice, if it is exactly 16 bytes long.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Option<Self>
    {
        <[u8; 16]>::try_from(bytes).ok().map(Self::from_bytes)
    }

    /// Create a vector register from a 128-bit integer (little-endian).
    #[must_use]
    pub const fn from_u128(value: u128) -> Self
    {
        Self {
            bytes: value.to_le_bytes(),
        }
    }

    /// Access the raw bytes of the vector register.
    #[must_use]
    pub const fn bytes(&self) -> &[u8; 16]
    {
        &self.bytes
    }

    /// Convert to a 128-bit integer (little-endian).
    #[must_use]
    pub const fn as_u128(&self) -> u128
    {
        u128::from_le_bytes(self.bytes)
    }
}

/// Architecture-agnostic floating point status/control registers.
///
/// - **ARM64**: FPSR and FPCR
/// - **x86-64**: MXCSR
///
/// A field is `None` when the register doesn't exist on the snapshot's architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FloatingPointState
{
    /// ARM64 FPSR (Floating-Point Status Register).
    pub fpsr: Option<u32>,
    /// ARM64 FPCR (Floating-Point Control Register).
    pub fpcr: Option<u32>,
    /// x86-64 MXCSR.
    pub mxcsr: Option<u32>,
}

/// Value held by a register, shaped by its [`RegisterKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterValue
{
    /// Numeric registers
    Numeric(u64),
    /// Pointer-sized registers
    Address(Address),
    /// Vector registers
    Vector(VectorRegisterValue),
}

impl fmt::Display for RegisterValue
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            RegisterValue::Numeric(value) => write!(f, "{value}"),
            RegisterValue::Address(address) => write!(f, "{address}"),
            RegisterValue::Vector(vector) => write!(f, "0x{:032x}", vector.as_u128()),
        }
    }
}

/// Operator-supplied value for a register write, in the shape it arrived in.
///
/// The accessor decides whether the shape fits the target register; see
/// [`crate::registers::RegisterAccessor::write_register`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterInput
{
    /// A bare number
    Number(u64),
    /// Text, expected to hold an address (`"0x7ff0"` or decimal)
    Text(String),
    /// A byte array, expected to hold a vector
    Bytes(Vec<u8>),
}

/// Register snapshot of a trapped thread
///
/// Captured by the substrate when a trap fires and handed to the trap
/// coordinator. While the thread is paused the snapshot is owned by the
/// coordinator and exposed to the control channel; on resume it is handed back
/// to the substrate, so any writes take effect when the thread continues.
///
/// ```rust
/// use holdfast_core::types::{Address, Architecture, RegisterContext, RegisterId, RegisterValue};
///
/// let mut regs = RegisterContext::new(Architecture::Arm64);
/// regs.set(RegisterId::Pc, RegisterValue::Address(Address::from(0x1000)));
/// assert_eq!(regs.get(RegisterId::Pc), Some(RegisterValue::Address(Address::from(0x1000))));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterContext
{
    /// Program Counter (PC) - address of the instruction that trapped
    pub pc: Address,
    /// Stack Pointer (SP)
    pub sp: Address,
    /// Frame Pointer (FP)
    pub fp: Address,
    /// General-purpose registers (architecture-specific)
    ///
    /// - **ARM64**: X0-X30 (31 registers; index 29 mirrors nothing, FP lives in `fp`)
    /// - **x86-64**: RAX, RBX, RCX, RDX, RSI, RDI, R8-R15 (14 registers)
    pub general: Vec<u64>,
    /// Status/Flags register
    pub status: u64,
    /// SIMD/vector registers (128-bit lanes).
    pub vector: Vec<VectorRegisterValue>,
    /// Floating-point status/control registers.
    pub floating: FloatingPointState,
    architecture: Architecture,
}

impl RegisterContext
{
    /// Create a zeroed snapshot sized for `architecture`.
    #[must_use]
    pub fn new(architecture: Architecture) -> Self
    {
        let (general, vector, floating) = match architecture {
            Architecture::Arm64 => (
                31,
                32,
                FloatingPointState {
                    fpsr: Some(0),
                    fpcr: Some(0),
                    mxcsr: None,
                },
            ),
            Architecture::X86_64 => (
                14,
                16,
                FloatingPointState {
                    fpsr: None,
                    fpcr: None,
                    mxcsr: Some(0),
                },
            ),
            Architecture::Unknown(_) => (0, 0, FloatingPointState::default()),
        };
        Self {
            pc: Address::ZERO,
            sp: Address::ZERO,
            fp: Address::ZERO,
            general: vec![0; general],
            status: 0,
            vector: vec![VectorRegisterValue::default(); vector],
            floating,
            architecture,
        }
    }

    /// CPU architecture of this snapshot.
    #[must_use]
    pub fn architecture(&self) -> Architecture
    {
        self.architecture
    }

    /// Read a register
    ///
    /// Returns `None` if the register doesn't exist in this snapshot (wrong
    /// architecture, or an index beyond the captured bank).
    #[must_use]
    pub fn get(&self, id: RegisterId) -> Option<RegisterValue>
    {
        match id {
            RegisterId::Pc => Some(RegisterValue::Address(self.pc)),
            RegisterId::Sp => Some(RegisterValue::Address(self.sp)),
            RegisterId::Fp => Some(RegisterValue::Address(self.fp)),
            RegisterId::Status => Some(RegisterValue::Numeric(self.status)),
            RegisterId::Arm64(Arm64Register::X(idx)) => {
                if self.architecture != Architecture::Arm64 {
                    return None;
                }
                self.general
                    .get(idx as usize)
                    .map(|value| RegisterValue::Address(Address::from(*value)))
            }
            RegisterId::X86_64(reg) => {
                if self.architecture != Architecture::X86_64 {
                    return None;
                }
                self.general
                    .get(reg.index())
                    .map(|value| RegisterValue::Address(Address::from(*value)))
            }
            RegisterId::Vector(idx) => self.vector.get(idx as usize).copied().map(RegisterValue::Vector),
            RegisterId::Floating(reg) => self.floating_slot(reg).map(|value| RegisterValue::Numeric(u64::from(value))),
        }
    }

    /// Write a register
    ///
    /// Returns `None` if the register doesn't exist in this snapshot or the
    /// value's shape doesn't fit the register (a vector into a scalar register,
    /// a scalar into a vector register). Addresses and numbers are
    /// interchangeable for scalar registers; floating-point control registers
    /// keep the low 32 bits.
    pub fn set(&mut self, id: RegisterId, value: RegisterValue) -> Option<()>
    {
        let scalar = match value {
            RegisterValue::Numeric(raw) => Some(raw),
            RegisterValue::Address(address) => Some(address.value()),
            RegisterValue::Vector(_) => None,
        };
        match id {
            RegisterId::Pc => self.pc = Address::from(scalar?),
            RegisterId::Sp => self.sp = Address::from(scalar?),
            RegisterId::Fp => self.fp = Address::from(scalar?),
            RegisterId::Status => self.status = scalar?,
            RegisterId::Arm64(Arm64Register::X(idx)) => {
                if self.architecture != Architecture::Arm64 {
                    return None;
                }
                *self.general.get_mut(idx as usize)? = scalar?;
            }
            RegisterId::X86_64(reg) => {
                if self.architecture != Architecture::X86_64 {
                    return None;
                }
                *self.general.get_mut(reg.index())? = scalar?;
            }
            RegisterId::Vector(idx) => {
                let RegisterValue::Vector(vector) = value else {
                    return None;
                };
                *self.vector.get_mut(idx as usize)? = vector;
            }
            RegisterId::Floating(reg) => {
                let slot = match reg {
                    FloatingRegister::Fpsr => &mut self.floating.fpsr,
                    FloatingRegister::Fpcr => &mut self.floating.fpcr,
                    FloatingRegister::Mxcsr => &mut self.floating.mxcsr,
                };
                let current = slot.as_mut()?;
                #[allow(clippy::cast_possible_truncation)]
                {
                    *current = scalar? as u32;
                }
            }
        }
        Some(())
    }

    fn floating_slot(&self, reg: FloatingRegister) -> Option<u32>
    {
        match reg {
            FloatingRegister::Fpsr => self.floating.fpsr,
            FloatingRegister::Fpcr => self.floating.fpcr,
            FloatingRegister::Mxcsr => self.floating.mxcsr,
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_parse_arm64_names()
    {
        let arch = Architecture::Arm64;
        assert_eq!(RegisterId::parse("x29", arch).unwrap(), RegisterId::Fp);
        assert_eq!(RegisterId::parse("lr", arch).unwrap(), RegisterId::Arm64(Arm64Register::X(30)));
        assert_eq!(RegisterId::parse("q31", arch).unwrap(), RegisterId::Vector(31));
        assert_eq!(RegisterId::parse("nzcv", arch).unwrap(), RegisterId::Status);
        assert!(RegisterId::parse("x31", arch).is_err());
        assert!(RegisterId::parse("x01", arch).is_err());
        assert!(RegisterId::parse("rax", arch).is_err());
    }

    #[test]
    fn test_parse_x86_64_names()
    {
        let arch = Architecture::X86_64;
        assert_eq!(RegisterId::parse("rsp", arch).unwrap(), RegisterId::Sp);
        assert_eq!(RegisterId::parse("xmm15", arch).unwrap(), RegisterId::Vector(15));
        assert_eq!(RegisterId::parse("mxcsr", arch).unwrap(), RegisterId::Floating(FloatingRegister::Mxcsr));
        assert!(RegisterId::parse("xmm16", arch).is_err());
        assert!(RegisterId::parse("x0", arch).is_err());
    }

    #[test]
    fn test_register_kinds()
    {
        assert_eq!(RegisterId::Pc.kind(), RegisterKind::Address);
        assert_eq!(RegisterId::Status.kind(), RegisterKind::Numeric);
        assert_eq!(RegisterId::Vector(0).kind(), RegisterKind::Vector);
        assert_eq!(RegisterId::X86_64(X86_64Register::R9).kind(), RegisterKind::Address);
    }

    #[test]
    fn test_set_rejects_mismatched_shapes()
    {
        let mut regs = RegisterContext::new(Architecture::X86_64);
        let vector = RegisterValue::Vector(VectorRegisterValue::from_u128(7));
        assert!(regs.set(RegisterId::Pc, vector).is_none());
        assert!(regs.set(RegisterId::Vector(0), RegisterValue::Numeric(7)).is_none());
        assert!(regs.set(RegisterId::Vector(0), vector).is_some());
        assert_eq!(regs.get(RegisterId::Vector(0)), Some(vector));
    }

    #[test]
    fn test_set_general_register()
    {
        let mut regs = RegisterContext::new(Architecture::X86_64);
        let rdi = RegisterId::X86_64(X86_64Register::Rdi);
        regs.set(rdi, RegisterValue::Numeric(0xdead)).unwrap();
        assert_eq!(regs.get(rdi), Some(RegisterValue::Address(Address::from(0xdead))));
        assert!(regs.set(RegisterId::Arm64(Arm64Register::X(0)), RegisterValue::Numeric(1)).is_none());
    }

    #[test]
    fn test_floating_registers_follow_architecture()
    {
        let mut regs = RegisterContext::new(Architecture::Arm64);
        let fpcr = RegisterId::Floating(FloatingRegister::Fpcr);
        regs.set(fpcr, RegisterValue::Numeric(0x0300_0000)).unwrap();
        assert_eq!(regs.get(fpcr), Some(RegisterValue::Numeric(0x0300_0000)));
        assert_eq!(regs.get(RegisterId::Floating(FloatingRegister::Mxcsr)), None);
    }
}
