//! USB CDC-ACM transport for the command/telemetry link, set up the same
//! way `main.rs::init` wires up the USB serial port: a statically-lived
//! `UsbBusAllocator`, one `SerialPort`, one `UsbDevice`.

use cfg_if::cfg_if;
use defmt::println;
use hal::clocks::Clocks;
use usb_device::{bus::UsbBusAllocator, prelude::*};
use usbd_serial::SerialPort;

cfg_if! {
    if #[cfg(feature = "h7")] {
        use hal::{pac, usb_otg::{Usb1, Usb1BusType as UsbBusType}};
        static mut USB_EP_MEMORY: [u32; 1024] = [0; 1024];
    } else if #[cfg(feature = "g4")] {
        use hal::{pac, usb::{self, UsbBus, UsbBusType}};
    }
}

static mut USB_BUS: Option<UsbBusAllocator<UsbBusType>> = None;

/// Builds the USB bus, serial port, and device. Must run once, from
/// `#[init]`, after the USB bus allocator's backing peripheral is clocked.
pub fn setup(
    usb_peripheral: UsbPeripheral,
    clock_cfg: &Clocks,
) -> (SerialPort<'static, UsbBusType>, UsbDevice<'static, UsbBusType>) {
    cfg_if! {
        if #[cfg(feature = "h7")] {
            let usb = Usb1::new(
                usb_peripheral.otg_global,
                usb_peripheral.otg_device,
                usb_peripheral.otg_pwrclk,
                clock_cfg.hclk(),
            );
            unsafe { USB_BUS = Some(hal::usb_otg::UsbBus::new(usb, unsafe { &mut USB_EP_MEMORY })) };
        } else if #[cfg(feature = "g4")] {
            let usb = usb::Peripheral { regs: usb_peripheral.usb };
            unsafe { USB_BUS = Some(UsbBus::new(usb)) };
        }
    }

    let serial = SerialPort::new(unsafe { USB_BUS.as_ref().unwrap() });

    let device = UsbDeviceBuilder::new(unsafe { USB_BUS.as_ref().unwrap() }, UsbVidPid(0x16c0, 0x27de))
        .manufacturer("Opto-TRIAC Board")
        .product("phasectl")
        .serial_number("PC")
        .device_class(usbd_serial::USB_CLASS_CDC)
        .build();

    println!("USB command/telemetry link ready");
    (serial, device)
}

cfg_if! {
    if #[cfg(feature = "h7")] {
        pub struct UsbPeripheral {
            pub otg_global: pac::OTG1_HS_GLOBAL,
            pub otg_device: pac::OTG1_HS_DEVICE,
            pub otg_pwrclk: pac::OTG1_HS_PWRCLK,
        }
    } else if #[cfg(feature = "g4")] {
        pub struct UsbPeripheral {
            pub usb: pac::USB,
        }
    }
}
