// Copyright (C) 2024 Ethan Uppal and Utku Melemetci. All rights reserved.

use crate::{arch::Address, memory::Memory};

/// Bytes destined for one contiguous address range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub address: Address,
    pub bytes: Vec<u8>,
}

/// A fully resolved program image. The assembler leaves its segments in
/// address order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Program {
    pub segments: Vec<Segment>,
}

impl Program {
    /// Appends `bytes` at `address`, extending the last segment when the
    /// two are contiguous.
    pub fn push(&mut self, address: Address, bytes: &[u8]) {
        if let Some(last) = self.segments.last_mut() {
            if last.address as usize + last.bytes.len() == address as usize {
                last.bytes.extend_from_slice(bytes);
                return;
            }
        }
        self.segments.push(Segment {
            address,
            bytes: bytes.to_vec(),
        });
    }

    /// Total number of bytes across all segments.
    pub fn len(&self) -> usize {
        self.segments.iter().map(|segment| segment.bytes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(|segment| segment.bytes.is_empty())
    }

    pub fn write_to(&self, memory: &mut dyn Memory) {
        for segment in &self.segments {
            memory.write(segment.address, &segment.bytes);
        }
    }
}
