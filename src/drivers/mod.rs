pub mod keyboard;
pub mod speaker;
pub mod time;

pub fn init() {
    keyboard::init();
    time::init();
    crate::log_info!("Drivers initialized.");
}
