//! Console output device: the VGA text buffer, mirrored to the serial port
//! so the log and user output interleave in one stream.

/// Sink for `sys_write`. The bytes were already staged into kernel memory
/// by the caller; non-printable bytes are left to the VGA writer's
/// substitution rule. Returns the number of bytes consumed.
pub fn write_to_console(buf: &[u8]) -> usize {
    let mut vga = crate::vga::WRITER.lock();
    let mut serial = crate::serial::SERIAL1.lock();
    for &byte in buf {
        vga.write_byte(byte);
        serial.send(byte);
    }
    buf.len()
}
