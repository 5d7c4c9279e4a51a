use thiserror::Error;

/// Size of the guest address space in bytes
pub const MEM_SIZE: usize = 65536;

/// Guest memory: 64 KiB, byte-addressable, zero-initialised.
///
/// 32-bit words are read and written little-endian at any byte
/// address (no alignment requirement on data accesses). The backing
/// store is one contiguous heap allocation so that translated code
/// can address it directly through [`Memory::base_ptr`]; like the
/// register file, it is created once per VM and never relocated.
#[derive(Debug)]
pub struct Memory {
    data: Box<[u8; MEM_SIZE]>,
}

#[derive(Error, PartialEq, Eq, Debug)]
pub enum AccessError {
    #[error("access to address {0}: out of allowed range")]
    OutOfBounds(u32),
}

impl Memory {
    pub fn new() -> Self {
        Self {
            data: vec![0u8; MEM_SIZE]
                .into_boxed_slice()
                .try_into()
                .expect("length matches MEM_SIZE"),
        }
    }

    /// Read the little-endian 32-bit word at any byte address
    pub fn read_word(&self, addr: u32) -> Result<u32, AccessError> {
        let addr = addr as usize;
        if addr + 4 > MEM_SIZE {
            return Err(AccessError::OutOfBounds(addr as u32));
        }
        let bytes = [
            self.data[addr],
            self.data[addr + 1],
            self.data[addr + 2],
            self.data[addr + 3],
        ];
        Ok(u32::from_le_bytes(bytes))
    }

    /// Write a 32-bit word little-endian at any byte address
    pub fn write_word(&mut self, addr: u32, value: u32) -> Result<(), AccessError> {
        let addr = addr as usize;
        if addr + 4 > MEM_SIZE {
            return Err(AccessError::OutOfBounds(addr as u32));
        }
        self.data[addr..addr + 4].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Copy a program image to guest address 0. The rest of memory
    /// stays zero-initialised.
    pub fn load_image(&mut self, image: &[u8]) {
        assert!(
            image.len() <= MEM_SIZE,
            "image of {} bytes exceeds guest memory",
            image.len()
        );
        self.data[..image.len()].copy_from_slice(image);
    }

    /// Host address of guest byte 0, for translated loads and stores
    pub fn base_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn check_memory_zero_initialised() {
        let mem = Memory::new();
        for addr in (0..100).step_by(12) {
            assert_eq!(mem.read_word(addr).unwrap(), 0);
        }
    }

    #[test]
    fn check_word_write_then_read() {
        let mut mem = Memory::new();
        mem.write_word(96, 0xdead_beef).unwrap();
        assert_eq!(mem.read_word(96).unwrap(), 0xdead_beef);
        // Neighbouring words see only the overlapping bytes
        assert_eq!(mem.read_word(100).unwrap(), 0);
    }

    #[test]
    fn check_words_are_little_endian() {
        let mut mem = Memory::new();
        mem.write_word(0, 0x0403_0201).unwrap();
        assert_eq!(mem.read_word(1).unwrap(), 0x0004_0302);
    }

    #[test]
    fn check_unaligned_access() {
        let mut mem = Memory::new();
        mem.write_word(13, 0x1234_5678).unwrap();
        assert_eq!(mem.read_word(13).unwrap(), 0x1234_5678);
    }

    #[test]
    fn check_out_of_bounds() {
        let mut mem = Memory::new();
        assert_eq!(mem.read_word(65536), Err(AccessError::OutOfBounds(65536)));
        // A word starting in range but ending past the limit is also out
        assert_eq!(mem.read_word(65533), Err(AccessError::OutOfBounds(65533)));
        assert_eq!(
            mem.write_word(65533, 1),
            Err(AccessError::OutOfBounds(65533))
        );
        assert_eq!(mem.read_word(65532).unwrap(), 0);
    }

    #[test]
    fn check_load_image() {
        let mut mem = Memory::new();
        mem.load_image(&[0x01, 0x02, 0x03, 0x04, 0x05]);
        assert_eq!(mem.read_word(0).unwrap(), 0x0403_0201);
        assert_eq!(mem.read_word(4).unwrap(), 0x0000_0005);
    }
}
