//! Thread and architecture types.

use std::fmt;

/// Thread identifier
///
/// A thread identifier uniquely identifies a thread within the instrumented
/// process. The exact representation is substrate-specific (an OS thread id,
/// a Mach port name, ...). We store it as a `u64` to provide a
/// substrate-agnostic interface.
///
/// ## Example
///
/// ```rust
/// use holdfast_core::types::ThreadId;
///
/// let thread = ThreadId::from(12345);
/// assert_eq!(thread.raw(), 12345);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(pub u64);

impl ThreadId
{
    /// Get the raw `u64` representation of the thread identifier
    #[must_use]
    pub fn raw(&self) -> u64
    {
        self.0
    }
}

impl From<u64> for ThreadId
{
    fn from(value: u64) -> Self
    {
        Self(value)
    }
}

impl fmt::Display for ThreadId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// CPU architecture of the instrumented process
///
/// Different architectures have different register layouts and instruction
/// encodings. The agent only needs the architecture to name registers and to
/// size code patches.
///
/// ## Supported Architectures
///
/// - **Arm64**: 64-bit ARM
/// - **X86_64**: 64-bit x86 (Intel/AMD processors)
/// - **Unknown**: Other architectures; registers are limited to the common set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture
{
    /// 64-bit ARM
    ///
    /// 31 general-purpose registers (X0-X30) plus SP, PC and NZCV.
    ///
    /// See: [ARM64 Architecture Reference Manual](https://developer.arm.com/documentation/ddi0487/latest)
    Arm64,
    /// 64-bit x86 (Intel/AMD)
    ///
    /// 16 general-purpose registers plus RIP and RFLAGS.
    ///
    /// See: [Intel 64 and IA-32 Architectures Software Developer's Manual](https://www.intel.com/content/www/us/en/developer/articles/technical/intel-sdm.html)
    X86_64,
    /// Any other architecture (or unknown)
    ///
    /// The `&'static str` contains the architecture name (e.g., "riscv64", "mips").
    Unknown(&'static str),
}

impl Architecture
{
    /// Get the architecture of the currently running binary
    ///
    /// The agent runs inside its target, so this is also the target's architecture.
    #[must_use]
    pub const fn current() -> Self
    {
        #[cfg(target_arch = "aarch64")]
        {
            Architecture::Arm64
        }

        #[cfg(target_arch = "x86_64")]
        {
            Architecture::X86_64
        }

        #[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
        {
            Architecture::Unknown(std::env::consts::ARCH)
        }
    }

    /// Longest encoding of a single instruction in bytes.
    ///
    /// Used to reserve room for code patches: x86 instructions can be up to 15
    /// bytes, fixed-width RISC encodings are 4.
    #[must_use]
    pub fn max_instruction_size(self) -> usize
    {
        match self {
            Architecture::X86_64 => 15,
            Architecture::Arm64 => 4,
            Architecture::Unknown(name) => {
                if matches!(name, "x86" | "ia32") {
                    15
                } else {
                    4
                }
            }
        }
    }
}

impl fmt::Display for Architecture
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Architecture::Arm64 => write!(f, "arm64"),
            Architecture::X86_64 => write!(f, "x86_64"),
            Architecture::Unknown(name) => write!(f, "{name}"),
        }
    }
}
