#[cfg(target_arch = "x86_64")]
mod x64;

#[cfg(target_arch = "x86_64")]
pub use x64::*;

#[cfg(not(target_arch = "x86_64"))]
compile_error!("checkbr only implements an x86_64 backend");
