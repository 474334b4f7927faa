pub mod console;

pub fn init() {
    crate::log_info!("Console driver ready.");
}
