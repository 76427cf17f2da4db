// src/arch/mod.rs

//! Architecture-specific abstractions.

pub mod x86;

/// Architecture-specific CPU implementation.
#[cfg(target_arch = "x86")]
pub type ArchCpu = x86::X86Cpu;

/// Inert CPU implementation for non-target builds (host tests).
#[cfg(not(target_arch = "x86"))]
pub type ArchCpu = StubCpu;

/// Trait for CPU-specific operations.
pub trait Cpu {
    /// Halt the CPU until the next interrupt.
    fn halt();

    /// Disable interrupts.
    fn disable_interrupts();

    /// Enable interrupts.
    fn enable_interrupts();
}

/// CPU stub for builds without the real hardware behind them.
#[cfg(not(target_arch = "x86"))]
pub struct StubCpu;

#[cfg(not(target_arch = "x86"))]
impl Cpu for StubCpu {
    fn halt() {
        core::hint::spin_loop();
    }

    fn disable_interrupts() {}

    fn enable_interrupts() {}
}
