pub mod exceptions;
pub mod idt;

pub fn init() {
    idt::init();
    crate::log_info!("IDT loaded, PIC remapped.");
}
