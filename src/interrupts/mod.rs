pub mod gdt;
pub mod idt;
pub mod usermode;

/// Segmentation, the IDT and the PICs, in dependency order. Interrupts
/// stay masked until the boot code is ready for ticks.
pub fn init() {
    gdt::init();
    idt::init();
    unsafe { idt::PICS.lock().initialize() };
}
