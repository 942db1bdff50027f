//! Kernel log sink.
//!
//! Registers a serial print function with the `norn-core` log registry.
//! There is exactly one sink (COM1); it takes no locks and never
//! allocates, so it is safe from fault handlers and the earliest boot
//! path.

use core::fmt::{self, Write as _};

use crate::serial::{COM1, Uart16550};

/// The COM1 sink.
static UART: Uart16550 = Uart16550::new(COM1);

struct SerialWriter;

impl fmt::Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        UART.write_str(s);
        Ok(())
    }
}

fn serial_print(args: fmt::Arguments<'_>) {
    let _ = SerialWriter.write_fmt(args);
}

/// Initializes COM1 and registers it as the global print function.
pub fn init_early_serial() {
    // SAFETY: The kernel owns COM1; called once on the BSP before logging.
    unsafe {
        UART.init();
        norn_core::log::set_print_fn(serial_print);
    }
}
