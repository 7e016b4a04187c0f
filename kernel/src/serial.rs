// COM1 serial port used for all kernel console output

use core::fmt;

use spin::Mutex;

/// I/O port base of the first serial port.
pub const COM1_PORT: u16 = 0x3F8;

pub struct SerialPort {
    #[cfg(target_arch = "x86_64")]
    inner: uart_16550::SerialPort,
}

impl SerialPort {
    /// Create a handle to COM1.
    ///
    /// # Safety
    ///
    /// The caller must ensure COM1 is present at the standard I/O base and
    /// that nothing else drives the port concurrently.
    #[cfg(target_arch = "x86_64")]
    pub const unsafe fn com1() -> Self {
        Self {
            // SAFETY: COM1_PORT is the standard ISA base for the first UART.
            inner: unsafe { uart_16550::SerialPort::new(COM1_PORT) },
        }
    }

    pub fn init(&mut self) {
        #[cfg(target_arch = "x86_64")]
        self.inner.init();
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        #[cfg(target_arch = "x86_64")]
        {
            self.inner.write_str(s)
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            let _ = s;
            Ok(())
        }
    }
}

static SERIAL1: Mutex<Option<SerialPort>> = Mutex::new(None);

/// Bring up COM1. Called once, before the first log line.
pub fn init() {
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: Single initialization of the standard COM1 base.
        let mut port = unsafe { SerialPort::com1() };
        port.init();
        *SERIAL1.lock() = Some(port);
    }
}

#[doc(hidden)]
pub fn _serial_print(args: fmt::Arguments) {
    use core::fmt::Write;

    crate::arch::without_interrupts(|| {
        if let Some(port) = SERIAL1.lock().as_mut() {
            let _ = port.write_fmt(args);
        }
    });
}

/// Write directly to COM1 without taking the writer lock.
///
/// Reserved for the panic, double-fault and machine-check paths, which must
/// not block on a lock that the interrupted code may hold. Never allocates.
pub fn emergency_write(args: fmt::Arguments) {
    use core::fmt::Write;

    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: The emergency paths run with interrupts off and never
        // return to the interrupted context, so racing the normal writer
        // can at worst interleave characters.
        let mut port = unsafe { uart_16550::SerialPort::new(COM1_PORT) };
        let _ = port.write_fmt(args);
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = args;
    }
}

#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_serial_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => {
        $crate::serial_print!("{}\n", format_args!($($arg)*))
    };
}
