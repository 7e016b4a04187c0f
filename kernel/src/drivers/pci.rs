//! PCI configuration-space access
//!
//! Legacy port-based mechanism (0xCF8/0xCFC), enough to find and program
//! the USB host controllers.

pub const PCI_CONFIG_ADDRESS: u16 = 0xCF8;
pub const PCI_CONFIG_DATA: u16 = 0xCFC;

/// Command-register bits.
pub const PCI_CMD_IO_SPACE: u16 = 1 << 0;
pub const PCI_CMD_MEMORY_SPACE: u16 = 1 << 1;
pub const PCI_CMD_BUS_MASTER: u16 = 1 << 2;

/// BAR bit 0: 1 = I/O space, 0 = memory space.
pub const PCI_BAR_IO: u32 = 1;

/// One discovered PCI function.
#[derive(Debug, Clone, Copy)]
pub struct PciDevice {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
    pub vendor_id: u16,
    pub device_id: u16,
    pub interrupt_line: u8,
}

/// CONFIG_ADDRESS encoding for `(bus, device, function, offset)`.
pub fn config_address(bus: u8, device: u8, function: u8, offset: u8) -> u32 {
    0x8000_0000
        | ((bus as u32) << 16)
        | ((device as u32 & 0x1F) << 11)
        | ((function as u32 & 0x7) << 8)
        | (offset as u32 & 0xFC)
}

#[cfg(target_os = "none")]
pub fn read_config(bus: u8, device: u8, function: u8, offset: u8) -> u32 {
    use x86_64::instructions::port::Port;

    // SAFETY: Standard PCI configuration mechanism #1.
    unsafe {
        let mut addr: Port<u32> = Port::new(PCI_CONFIG_ADDRESS);
        let mut data: Port<u32> = Port::new(PCI_CONFIG_DATA);
        addr.write(config_address(bus, device, function, offset));
        data.read()
    }
}

#[cfg(not(target_os = "none"))]
pub fn read_config(_bus: u8, _device: u8, _function: u8, _offset: u8) -> u32 {
    0xFFFF_FFFF
}

#[cfg(target_os = "none")]
pub fn write_config(bus: u8, device: u8, function: u8, offset: u8, value: u32) {
    use x86_64::instructions::port::Port;

    // SAFETY: Standard PCI configuration mechanism #1.
    unsafe {
        let mut addr: Port<u32> = Port::new(PCI_CONFIG_ADDRESS);
        let mut data: Port<u32> = Port::new(PCI_CONFIG_DATA);
        addr.write(config_address(bus, device, function, offset));
        data.write(value);
    }
}

#[cfg(not(target_os = "none"))]
pub fn write_config(_bus: u8, _device: u8, _function: u8, _offset: u8, _value: u32) {}

/// Read base address register `n` (0..=5).
pub fn read_bar(dev: &PciDevice, n: u8) -> u32 {
    read_config(dev.bus, dev.device, dev.function, 0x10 + n * 4)
}

fn set_command_bits(dev: &PciDevice, bits: u16) {
    let cmd = read_config(dev.bus, dev.device, dev.function, 0x04);
    let new = (cmd & 0xFFFF_0000) | u32::from((cmd as u16) | bits);
    write_config(dev.bus, dev.device, dev.function, 0x04, new);
}

pub fn enable_bus_mastering(dev: &PciDevice) {
    set_command_bits(dev, PCI_CMD_BUS_MASTER);
}

pub fn enable_io_space(dev: &PciDevice) {
    set_command_bits(dev, PCI_CMD_IO_SPACE);
}

pub fn enable_memory_space(dev: &PciDevice) {
    set_command_bits(dev, PCI_CMD_MEMORY_SPACE);
}

/// Scan every bus/device/function with the given class and subclass,
/// invoking `f` with the device and its programming interface.
pub fn scan_class(class: u8, subclass: u8, mut f: impl FnMut(PciDevice, u8)) {
    for bus in 0..=255u16 {
        for device in 0..32u8 {
            for function in 0..8u8 {
                let bus = bus as u8;
                let id = read_config(bus, device, function, 0x00);
                let vendor = (id & 0xFFFF) as u16;
                if vendor == 0xFFFF {
                    continue;
                }
                let class_info = read_config(bus, device, function, 0x08);
                let dev_class = (class_info >> 24) as u8;
                let dev_subclass = (class_info >> 16) as u8;
                let prog_if = (class_info >> 8) as u8;
                if dev_class != class || dev_subclass != subclass {
                    continue;
                }
                let irq = (read_config(bus, device, function, 0x3C) & 0xFF) as u8;
                f(
                    PciDevice {
                        bus,
                        device,
                        function,
                        vendor_id: vendor,
                        device_id: (id >> 16) as u16,
                        interrupt_line: irq,
                    },
                    prog_if,
                );
            }
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn config_address_encoding() {
        assert_eq!(config_address(0, 0, 0, 0), 0x8000_0000);
        assert_eq!(config_address(1, 2, 3, 0x3C), 0x8001_133C);
        // Offset is dword-aligned in the encoding.
        assert_eq!(config_address(0, 0, 0, 0x3E), config_address(0, 0, 0, 0x3C));
        // Device and function fields are masked to their widths.
        assert_eq!(config_address(0, 32, 8, 0), config_address(0, 0, 0, 0));
    }
}
