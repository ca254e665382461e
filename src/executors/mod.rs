pub mod cpu;

pub use cpu::CpuExecutor;
