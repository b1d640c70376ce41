// Copyright (C) 2024 Ethan Uppal and Utku Melemetci. All rights reserved.

//! Byte-addressed memory and the overlay that routes address ranges to
//! devices.

use crate::arch::{mask, Address, ADDRESS_SPACE};

/// Read/write access to bytes at integer addresses. Addresses wrap: every
/// implementation masks into its own range instead of failing.
pub trait Memory {
    fn read(&mut self, address: Address, buffer: &mut [u8]);

    fn write(&mut self, address: Address, data: &[u8]);
}

/// Main memory: a flat block covering the whole address space.
pub struct Ram {
    bytes: Box<[u8]>,
}

impl Default for Ram {
    fn default() -> Self {
        Self::with_size(ADDRESS_SPACE)
    }
}

impl Ram {
    /// `size` must be a power of two.
    pub fn with_size(size: usize) -> Self {
        debug_assert!(size.is_power_of_two());
        Self {
            bytes: vec![0; size].into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn clear(&mut self) {
        self.bytes.fill(0);
    }

    fn index(&self, address: u64) -> usize {
        address as usize & (self.bytes.len() - 1)
    }
}

impl Memory for Ram {
    fn read(&mut self, address: Address, buffer: &mut [u8]) {
        for (i, byte) in buffer.iter_mut().enumerate() {
            *byte = self.bytes[self.index(address as u64 + i as u64)];
        }
    }

    fn write(&mut self, address: Address, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            let index = self.index(address as u64 + i as u64);
            self.bytes[index] = *byte;
        }
    }
}

/// Handle to a device attached to a [`MappedMemory`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceId(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Mapping {
    start: Address,
    length: u32,
    device: DeviceId,
    device_offset: Address,
}

impl Mapping {
    /// Offset of `address` inside this mapping, if it falls inside.
    fn offset_of(&self, address: Address) -> Option<u32> {
        let offset = mask((address as u64).wrapping_sub(self.start as u64));
        (offset < self.length).then_some(offset)
    }
}

/// Main memory overlaid with device ranges. Later mappings shadow earlier
/// ones.
#[derive(Default)]
pub struct MappedMemory {
    ram: Ram,
    devices: Vec<Box<dyn Memory>>,
    mappings: Vec<Mapping>,
}

impl MappedMemory {
    pub fn new(ram: Ram) -> Self {
        Self {
            ram,
            devices: vec![],
            mappings: vec![],
        }
    }

    /// Registers a device; it is not visible until [`Self::map`]ped.
    pub fn attach(&mut self, device: Box<dyn Memory>) -> DeviceId {
        self.devices.push(device);
        DeviceId(self.devices.len() - 1)
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Routes `length` bytes starting at `address` to `device`, starting at
    /// `device_offset` inside it. Returns `false` for an unknown device.
    pub fn map(
        &mut self,
        address: Address,
        device: DeviceId,
        device_offset: Address,
        length: u32,
    ) -> bool {
        if device.0 >= self.devices.len() {
            return false;
        }
        self.mappings.push(Mapping {
            start: mask(address as u64),
            length,
            device,
            device_offset,
        });
        true
    }

    /// Removes every mapping; attached devices stay attached.
    pub fn unmap_all(&mut self) {
        self.mappings.clear();
    }

    pub fn ram(&self) -> &Ram {
        &self.ram
    }

    pub fn ram_mut(&mut self) -> &mut Ram {
        &mut self.ram
    }

    fn route(&self, address: Address) -> Option<(DeviceId, Address)> {
        self.mappings.iter().rev().find_map(|mapping| {
            mapping.offset_of(address).map(|offset| {
                (
                    mapping.device,
                    mask(mapping.device_offset as u64 + offset as u64),
                )
            })
        })
    }
}

impl Memory for MappedMemory {
    fn read(&mut self, address: Address, buffer: &mut [u8]) {
        if self.mappings.is_empty() {
            return self.ram.read(address, buffer);
        }
        for (i, byte) in buffer.iter_mut().enumerate() {
            let address = mask(address as u64 + i as u64);
            let target = std::slice::from_mut(byte);
            match self.route(address) {
                Some((device, offset)) => {
                    self.devices[device.0].read(offset, target)
                }
                None => self.ram.read(address, target),
            }
        }
    }

    fn write(&mut self, address: Address, data: &[u8]) {
        if self.mappings.is_empty() {
            return self.ram.write(address, data);
        }
        for (i, byte) in data.iter().enumerate() {
            let address = mask(address as u64 + i as u64);
            let source = std::slice::from_ref(byte);
            match self.route(address) {
                Some((device, offset)) => {
                    self.devices[device.0].write(offset, source)
                }
                None => self.ram.write(address, source),
            }
        }
    }
}

/// Reads an unsigned little-endian integer of `bytes` bytes.
pub fn read_uint(
    memory: &mut dyn Memory,
    address: Address,
    bytes: usize,
) -> u64 {
    let mut raw = [0; 8];
    memory.read(address, &mut raw[..bytes]);
    u64::from_le_bytes(raw)
}

/// Writes the low `bytes` bytes of `value`, little-endian.
pub fn write_uint(
    memory: &mut dyn Memory,
    address: Address,
    value: u64,
    bytes: usize,
) {
    memory.write(address, &value.to_le_bytes()[..bytes]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::ADDRESS_MASK;

    /// Records every byte written to it; reads return the offset.
    #[derive(Default)]
    struct Probe {
        writes: std::rc::Rc<std::cell::RefCell<Vec<(Address, u8)>>>,
    }

    impl Memory for Probe {
        fn read(&mut self, address: Address, buffer: &mut [u8]) {
            for (i, byte) in buffer.iter_mut().enumerate() {
                *byte = (address as usize + i) as u8;
            }
        }

        fn write(&mut self, address: Address, data: &[u8]) {
            for (i, byte) in data.iter().enumerate() {
                self.writes.borrow_mut().push((address + i as u32, *byte));
            }
        }
    }

    #[test]
    fn ram_wraps_at_the_end() {
        let mut ram = Ram::with_size(16);
        ram.write(15, &[1, 2]);
        let mut buffer = [0; 1];
        ram.read(0, &mut buffer);
        assert_eq!([2], buffer);
    }

    #[test]
    fn full_address_space_wraps() {
        let mut memory = MappedMemory::default();
        write_uint(&mut memory, ADDRESS_MASK, 0xbbaa, 2);
        assert_eq!(0xbb, read_uint(&mut memory, 0, 1));
        assert_eq!(0xaa, read_uint(&mut memory, ADDRESS_MASK, 1));
    }

    #[test]
    fn mapped_ranges_go_to_the_device() {
        let probe = Probe::default();
        let writes = probe.writes.clone();
        let mut memory = MappedMemory::default();
        let id = memory.attach(Box::new(probe));
        assert!(memory.map(0x100, id, 0x10, 4));

        memory.write(0xfe, &[1, 2, 3, 4]);
        assert_eq!(vec![(0x10, 3), (0x11, 4)], *writes.borrow());
        assert_eq!(0x0201, read_uint(&mut memory, 0xfe, 2));
        assert_eq!(0x13, read_uint(&mut memory, 0x103, 1));
        assert_eq!(0, read_uint(&mut memory, 0x104, 1));
    }

    #[test]
    fn unknown_devices_are_not_mapped() {
        let mut memory = MappedMemory::default();
        assert!(!memory.map(0, DeviceId(3), 0, 8));
    }
}
