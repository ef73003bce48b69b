//! Architecture-specific halves of the fiber-swap context switch.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub(crate) use x86_64::{context_switch, init_context, SavedRegs};
    } else {
        compile_error!("ring-adapter's fiber-swap context switch is only implemented for x86_64; the backend-fd adapter (E2) does not need it and remains available on other architectures");
    }
}
