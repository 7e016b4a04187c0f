//! Device drivers in the execution/IO core: PCI configuration access and
//! the USB host-controller stack with its HID class driver.

pub mod pci;
pub mod usb;
