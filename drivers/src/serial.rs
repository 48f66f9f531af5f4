//! Serial console: the runtime klog backend.
//!
//! A deliberately small 16550 driver — transmit only, polled. Its single job
//! is to take over log output from the early-boot fallback with proper
//! locking so lines from different CPUs do not interleave.

use core::fmt::{self, Write};

use nfb_lib::IrqMutex;
use nfb_lib::ports::{COM1, serial_putc, serial_write_bytes};

const UART_REG_IER: u16 = 1;
const UART_REG_FCR: u16 = 2;
const UART_REG_LCR: u16 = 3;
const UART_REG_MCR: u16 = 4;

const LCR_8N1: u8 = 0x03;
const LCR_DLAB: u8 = 0x80;
const FCR_ENABLE_CLEAR: u8 = 0x07;
const MCR_DTR_RTS_AUX2: u8 = 0x0B;

struct SerialPort {
    base: u16,
}

impl SerialPort {
    const fn new(base: u16) -> Self {
        Self { base }
    }

    /// Program 115200 8N1 with FIFOs enabled.
    unsafe fn init(&mut self) {
        use x86_64::instructions::port::Port;

        let mut ier = Port::<u8>::new(self.base + UART_REG_IER);
        let mut fcr = Port::<u8>::new(self.base + UART_REG_FCR);
        let mut lcr = Port::<u8>::new(self.base + UART_REG_LCR);
        let mut mcr = Port::<u8>::new(self.base + UART_REG_MCR);
        let mut dll = Port::<u8>::new(self.base);
        let mut dlh = Port::<u8>::new(self.base + 1);

        ier.write(0x00);
        lcr.write(LCR_DLAB);
        dll.write(0x01); // 115200 baud
        dlh.write(0x00);
        lcr.write(LCR_8N1);
        fcr.write(FCR_ENABLE_CLEAR);
        mcr.write(MCR_DTR_RTS_AUX2);
    }
}

impl Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        // SAFETY: callers hold the SERIAL lock; the port was initialised.
        unsafe { serial_write_bytes(self.base, s.as_bytes()) };
        Ok(())
    }
}

static SERIAL: IrqMutex<SerialPort> = IrqMutex::new(SerialPort::new(COM1));

fn serial_klog_backend(args: fmt::Arguments<'_>) {
    let mut port = SERIAL.lock();
    let _ = fmt::write(&mut *port, args);
    // SAFETY: lock held, port initialised.
    unsafe { serial_putc(port.base, b'\r') };
    unsafe { serial_putc(port.base, b'\n') };
}

/// Initialise the UART and register as the klog backend.
pub fn init() {
    {
        let mut port = SERIAL.lock();
        // SAFETY: COM1 is a standard 16550-compatible UART on this platform.
        unsafe { port.init() };
    }
    nfb_lib::klog::klog_register_backend(serial_klog_backend);
}
