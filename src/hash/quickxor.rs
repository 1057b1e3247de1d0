//! QuickXOR hash, the 160-bit rotating-XOR digest used by OneDrive.
//!
//! Bytes are XORed into a 160-bit circular register at positions that
//! advance 11 bits per input byte; the total input length is folded into
//! the last 8 bytes of the result.

/// Register width in bits.
const WIDTH: usize = 160;
/// Bit advance per input byte.
const SHIFT: usize = 11;
/// The third cell only holds the remaining 32 bits of the register.
const BITS_IN_LAST_CELL: usize = WIDTH % 64;

#[derive(Debug, Clone)]
pub struct QuickXor {
    data: [u64; 3],
    shift_so_far: usize,
    length: u64,
}

impl Default for QuickXor {
    fn default() -> Self {
        Self::new()
    }
}

impl QuickXor {
    pub fn new() -> Self {
        Self {
            data: [0; 3],
            shift_so_far: 0,
            length: 0,
        }
    }

    pub fn update(&mut self, input: &[u8]) {
        let current_shift = self.shift_so_far;
        let mut vector_array_index = current_shift / 64;
        let mut vector_offset = current_shift % 64;
        let iterations = input.len().min(WIDTH);

        for i in 0..iterations {
            let is_last_cell = vector_array_index == self.data.len() - 1;
            let bits_in_cell = if is_last_cell { BITS_IN_LAST_CELL } else { 64 };

            if vector_offset <= bits_in_cell - 8 {
                let mut j = i;
                while j < input.len() {
                    self.data[vector_array_index] ^= (input[j] as u64) << vector_offset;
                    j += WIDTH;
                }
            } else {
                // The byte straddles two cells.
                let index1 = vector_array_index;
                let index2 = if is_last_cell { 0 } else { vector_array_index + 1 };
                let low = (bits_in_cell - vector_offset) as u32;
                let mut j = i;
                while j < input.len() {
                    let b = input[j] as u64;
                    self.data[index1] ^= b << vector_offset;
                    self.data[index2] ^= b >> low;
                    j += WIDTH;
                }
            }

            vector_offset += SHIFT;
            while vector_offset >= bits_in_cell {
                vector_array_index = if is_last_cell { 0 } else { vector_array_index + 1 };
                vector_offset -= bits_in_cell;
            }
        }

        self.shift_so_far = (self.shift_so_far + SHIFT * (input.len() % WIDTH)) % WIDTH;
        self.length = self.length.wrapping_add(input.len() as u64);
    }

    /// Produce the 20-byte digest.
    pub fn finalize(&self) -> [u8; 20] {
        let mut block = [0u8; 20];
        for (i, byte) in block.iter_mut().enumerate() {
            *byte = (self.data[i / 8] >> ((i % 8) * 8)) as u8;
        }
        let length_bytes = self.length.to_le_bytes();
        for (i, b) in length_bytes.iter().enumerate() {
            block[WIDTH / 8 - 8 + i] ^= b;
        }
        block
    }
}
