//! Memory - Target process memory operations
//!
//! Backends implement [`ProcessMemory`] with exact, all-or-nothing transfers.
//! Everything else (argument validation, typed values, text, structures) is
//! layered on top by [`MemoryExt`] using a fixed little-endian layout.

use thiserror::Error;

/// Memory operation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Failed to read memory at {address:#x}: {reason}")]
    ReadFailed { address: u64, reason: String },

    #[error("Failed to write memory at {address:#x}: {reason}")]
    WriteFailed { address: u64, reason: String },

    #[error("Partial transfer at {address:#x}: {transferred} of {expected} bytes")]
    Partial {
        address: u64,
        expected: usize,
        transferred: usize,
    },

    #[error("Null address")]
    NullAddress,

    #[error("Transfer length must be greater than zero")]
    EmptyTransfer,

    #[error("Invalid text at {address:#x}: {reason}")]
    InvalidText { address: u64, reason: String },
}

/// Size of a pointer in the target's address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PointerWidth {
    Bits32,
    #[default]
    Bits64,
}

impl PointerWidth {
    pub fn bytes(self) -> usize {
        match self {
            PointerWidth::Bits32 => 4,
            PointerWidth::Bits64 => 8,
        }
    }
}

/// Text encodings understood by the text helpers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Utf16Le,
}

impl TextEncoding {
    /// Width of one code unit in bytes
    pub fn unit_size(self) -> usize {
        match self {
            TextEncoding::Utf8 => 1,
            TextEncoding::Utf16Le => 2,
        }
    }

    /// Encode `text` without a terminator
    pub fn encode(self, text: &str) -> Vec<u8> {
        match self {
            TextEncoding::Utf8 => text.as_bytes().to_vec(),
            TextEncoding::Utf16Le => text.encode_utf16().flat_map(u16::to_le_bytes).collect(),
        }
    }

    /// Encode `text` followed by a NUL code unit
    pub fn encode_with_nul(self, text: &str) -> Vec<u8> {
        let mut bytes = self.encode(text);
        bytes.extend(std::iter::repeat(0).take(self.unit_size()));
        bytes
    }

    fn decode(self, address: u64, bytes: &[u8]) -> Result<String, MemoryError> {
        match self {
            TextEncoding::Utf8 => {
                String::from_utf8(bytes.to_vec()).map_err(|e| MemoryError::InvalidText {
                    address,
                    reason: format!("Invalid UTF-8: {}", e),
                })
            }
            TextEncoding::Utf16Le => {
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .collect();
                String::from_utf16(&units).map_err(|e| MemoryError::InvalidText {
                    address,
                    reason: format!("Invalid UTF-16: {}", e),
                })
            }
        }
    }
}

/// Raw access to a target's address space.
///
/// Implementations must transfer exactly `buffer.len()` / `data.len()` bytes
/// or fail; a short transfer is reported as [`MemoryError::Partial`]. A write
/// must leave the instruction cache coherent for the written range.
pub trait ProcessMemory: Send + Sync {
    fn read_raw(&self, address: u64, buffer: &mut [u8]) -> Result<(), MemoryError>;

    fn write_raw(&self, address: u64, data: &[u8]) -> Result<(), MemoryError>;

    /// Pointer size used by pointer-chain resolution
    fn pointer_width(&self) -> PointerWidth {
        PointerWidth::Bits64
    }
}

/// Values with a fixed little-endian encoding
pub trait Scalar: Copy {
    const SIZE: usize;

    fn from_le(bytes: &[u8]) -> Self;

    fn to_le(self) -> Vec<u8>;
}

macro_rules! impl_scalar {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Scalar for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn from_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    <$ty>::from_le_bytes(raw)
                }

                fn to_le(self) -> Vec<u8> {
                    self.to_le_bytes().to_vec()
                }
            }
        )*
    };
}

impl_scalar!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

/// Validated and typed operations over any [`ProcessMemory`]
pub trait MemoryExt: ProcessMemory {
    /// Read exactly `buffer.len()` bytes
    fn read_into(&self, address: u64, buffer: &mut [u8]) -> Result<(), MemoryError> {
        if address == 0 {
            return Err(MemoryError::NullAddress);
        }
        if buffer.is_empty() {
            return Err(MemoryError::EmptyTransfer);
        }
        self.read_raw(address, buffer)
    }

    /// Read memory from the target process
    fn read(&self, address: u64, size: usize) -> Result<Vec<u8>, MemoryError> {
        let mut buffer = vec![0u8; size];
        self.read_into(address, &mut buffer)?;
        Ok(buffer)
    }

    /// Write memory to the target process
    fn write(&self, address: u64, data: &[u8]) -> Result<(), MemoryError> {
        if address == 0 {
            return Err(MemoryError::NullAddress);
        }
        if data.is_empty() {
            return Err(MemoryError::EmptyTransfer);
        }
        self.write_raw(address, data)
    }

    fn read_value<V: Scalar>(&self, address: u64) -> Result<V, MemoryError> {
        let data = self.read(address, V::SIZE)?;
        Ok(V::from_le(&data))
    }

    fn write_value<V: Scalar>(&self, address: u64, value: V) -> Result<(), MemoryError> {
        self.write(address, &value.to_le())
    }

    fn read_u8(&self, address: u64) -> Result<u8, MemoryError> {
        self.read_value(address)
    }

    fn write_u8(&self, address: u64, value: u8) -> Result<(), MemoryError> {
        self.write_value(address, value)
    }

    fn read_u32(&self, address: u64) -> Result<u32, MemoryError> {
        self.read_value(address)
    }

    fn read_u64(&self, address: u64) -> Result<u64, MemoryError> {
        self.read_value(address)
    }

    /// Read a pointer-sized value, zero-extended to 64 bits
    fn read_pointer(&self, address: u64) -> Result<u64, MemoryError> {
        match self.pointer_width() {
            PointerWidth::Bits32 => self.read_value::<u32>(address).map(u64::from),
            PointerWidth::Bits64 => self.read_value::<u64>(address),
        }
    }

    /// Write a pointer-sized value; the upper half is dropped for 32-bit targets
    fn write_pointer(&self, address: u64, value: u64) -> Result<(), MemoryError> {
        match self.pointer_width() {
            PointerWidth::Bits32 => self.write_value(address, value as u32),
            PointerWidth::Bits64 => self.write_value(address, value),
        }
    }

    /// Read a fixed-layout structure
    fn read_struct<T: bytemuck::Pod>(&self, address: u64) -> Result<T, MemoryError> {
        let data = self.read(address, std::mem::size_of::<T>())?;
        Ok(bytemuck::pod_read_unaligned(&data))
    }

    fn write_struct<T: bytemuck::Pod>(&self, address: u64, value: &T) -> Result<(), MemoryError> {
        self.write(address, bytemuck::bytes_of(value))
    }

    /// Read `length` bytes and decode them as text
    fn read_text(
        &self,
        address: u64,
        length: usize,
        encoding: TextEncoding,
    ) -> Result<String, MemoryError> {
        let data = self.read(address, length)?;
        encoding.decode(address, &data)
    }

    /// Read a NUL-terminated string of at most `max_units` code units
    fn read_c_string(
        &self,
        address: u64,
        encoding: TextEncoding,
        max_units: usize,
    ) -> Result<String, MemoryError> {
        let unit = encoding.unit_size();
        let mut data = Vec::new();
        for index in 0..max_units {
            let bytes = self.read(address + (index * unit) as u64, unit)?;
            if bytes.iter().all(|&b| b == 0) {
                break;
            }
            data.extend_from_slice(&bytes);
        }
        encoding.decode(address, &data)
    }

    /// Write text without a terminator
    fn write_text(
        &self,
        address: u64,
        text: &str,
        encoding: TextEncoding,
    ) -> Result<(), MemoryError> {
        self.write(address, &encoding.encode(text))
    }

    /// Copy `size` bytes from `source` to `destination` inside the target
    fn copy(&self, source: u64, destination: u64, size: usize) -> Result<(), MemoryError> {
        let data = self.read(source, size)?;
        self.write(destination, &data)
    }
}

impl<M: ProcessMemory + ?Sized> MemoryExt for M {}
